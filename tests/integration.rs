//! End-to-end tests: a real server and client talking over TCP and over
//! in-memory duplex streams.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use muxrpc::{Client, ConnectOptions, RpcError, Server, Service};

#[derive(Serialize, Deserialize, Clone, Copy)]
struct Args {
    num1: i32,
    num2: i32,
}

/// Arith.Sum plus a deliberately slow and a deliberately failing method.
fn test_server() -> Arc<Server> {
    let server = Arc::new(Server::new());
    server
        .register(
            Service::builder("Arith")
                .method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) })
                .method("Fail", |_args: Args| async move {
                    let failed: muxrpc::Result<i32> = Err(RpcError::handler("boom"));
                    failed
                })
                .build(),
        )
        .unwrap();
    server
        .register(
            Service::builder("Slow")
                .method("Sleep", |ms: u64| async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(ms)
                })
                .build(),
        )
        .unwrap();
    server
}

/// Bind a server on an ephemeral port and return its address.
async fn start_server() -> String {
    let server = test_server();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(server.accept(listener));
    addr
}

#[tokio::test]
async fn test_concurrent_calls_each_complete_once() {
    let addr = start_server().await;
    let client = Client::dial(&addr).await.unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..5i32 {
        let client = client.clone();
        tasks.spawn(async move {
            let sum: i32 = client
                .call(
                    "Arith.Sum",
                    &Args {
                        num1: i,
                        num2: i * 10,
                    },
                )
                .await
                .unwrap();
            assert_eq!(sum, i + i * 10);
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_method_keeps_connection_usable() {
    let addr = start_server().await;
    let client = Client::dial(&addr).await.unwrap();

    let err = client
        .call::<_, i32>("Arith.Missing", &Args { num1: 1, num2: 2 })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));

    let sum: i32 = client
        .call("Arith.Sum", &Args { num1: 1, num2: 2 })
        .await
        .unwrap();
    assert_eq!(sum, 3);
}

#[tokio::test]
async fn test_unknown_service_reports_not_found() {
    let addr = start_server().await;
    let client = Client::dial(&addr).await.unwrap();

    let err = client
        .call::<_, i32>("Nope.Sum", &Args { num1: 1, num2: 2 })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn test_user_method_error_travels_back() {
    let addr = start_server().await;
    let client = Client::dial(&addr).await.unwrap();

    let err = client
        .call::<_, i32>("Arith.Fail", &Args { num1: 0, num2: 0 })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "boom");

    // The connection survives a failing method.
    let sum: i32 = client
        .call("Arith.Sum", &Args { num1: 2, num2: 3 })
        .await
        .unwrap();
    assert_eq!(sum, 5);
}

#[tokio::test]
async fn test_handle_timeout_yields_timely_error() {
    let addr = start_server().await;
    let opts = ConnectOptions::default().with_handle_timeout(Duration::from_millis(100));
    let client = Client::dial_with_options(&addr, opts).await.unwrap();

    let started = Instant::now();
    let err = client.call::<_, u64>("Slow.Sleep", &500u64).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.to_string().contains("request handle timeout"));
    assert!(err.to_string().contains("100ms"));
    assert!(
        elapsed < Duration::from_millis(400),
        "timeout response took {:?}",
        elapsed
    );

    // The orphaned method finishing later must not corrupt the stream: a
    // subsequent fast call on the same connection succeeds.
    let sum: i32 = client
        .call("Arith.Sum", &Args { num1: 4, num2: 5 })
        .await
        .unwrap();
    assert_eq!(sum, 9);
}

#[tokio::test]
async fn test_zero_handle_timeout_means_unlimited() {
    let addr = start_server().await;
    let client = Client::dial(&addr).await.unwrap();

    let slept: u64 = client.call("Slow.Sleep", &150u64).await.unwrap();
    assert_eq!(slept, 150);
}

#[tokio::test]
async fn test_connect_timeout_fires_promptly() {
    // Non-routable address: the TCP handshake can only hang or fail, never
    // complete, so the dial resolves by timeout (or an immediate network
    // error on hosts that reject the route).
    let opts = ConnectOptions::default().with_connect_timeout(Duration::from_millis(200));

    let started = Instant::now();
    let err = Client::dial_with_options("10.255.255.1:1", opts)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(2), "dial took {:?}", elapsed);
    match err {
        RpcError::ConnectTimeout(timeout) => {
            assert_eq!(timeout, Duration::from_millis(200));
            assert!(elapsed >= Duration::from_millis(150));
        }
        RpcError::Io(_) => {}
        other => panic!("unexpected dial error: {}", other),
    }
}

#[tokio::test]
async fn test_close_completes_outstanding_call_with_shutdown() {
    let addr = start_server().await;
    let client = Client::dial(&addr).await.unwrap();

    let (done, mut rx) = mpsc::channel(1);
    client.go("Slow.Sleep", &5_000u64, done).await;
    client.close().await.unwrap();

    let call = rx.recv().await.unwrap();
    assert!(matches!(call.error, Some(RpcError::Shutdown)));
}

#[tokio::test]
async fn test_cancelled_call_leaves_client_usable() {
    let addr = start_server().await;
    let client = Client::dial(&addr).await.unwrap();

    let cancelled =
        tokio::time::timeout(Duration::from_millis(50), client.call::<_, u64>("Slow.Sleep", &400u64))
            .await;
    assert!(cancelled.is_err());

    // The orphaned response arrives later and is discarded; meanwhile the
    // client keeps working.
    let sum: i32 = client
        .call("Arith.Sum", &Args { num1: 7, num2: 8 })
        .await
        .unwrap();
    assert_eq!(sum, 15);

    // Give the orphaned response time to land on the reader, then prove the
    // connection is still healthy.
    tokio::time::sleep(Duration::from_millis(450)).await;
    let sum: i32 = client
        .call("Arith.Sum", &Args { num1: 1, num2: 1 })
        .await
        .unwrap();
    assert_eq!(sum, 2);
}

#[tokio::test]
async fn test_json_codec_end_to_end() {
    let addr = start_server().await;
    let opts = ConnectOptions::default().with_codec(muxrpc::codec::JSON_TYPE);
    let client = Client::dial_with_options(&addr, opts).await.unwrap();

    let sum: i32 = client
        .call("Arith.Sum", &Args { num1: 20, num2: 22 })
        .await
        .unwrap();
    assert_eq!(sum, 42);
}

#[tokio::test]
async fn test_go_with_shared_done_channel() {
    let addr = start_server().await;
    let client = Client::dial(&addr).await.unwrap();

    let (done, mut rx) = mpsc::channel(10);
    for i in 0..3i32 {
        client
            .go("Arith.Sum", &Args { num1: i, num2: 1 }, done.clone())
            .await;
    }

    let mut sums: Vec<i32> = Vec::new();
    for _ in 0..3 {
        let call = rx.recv().await.unwrap();
        assert!(call.error.is_none());
        sums.push(call.reply().unwrap());
    }
    sums.sort_unstable();
    assert_eq!(sums, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_sequence_numbers_strictly_increase_from_one() {
    let addr = start_server().await;
    let client = Client::dial(&addr).await.unwrap();

    let (done, mut rx) = mpsc::channel(10);
    let mut seqs = Vec::new();
    for _ in 0..4 {
        seqs.push(
            client
                .go("Arith.Sum", &Args { num1: 1, num2: 1 }, done.clone())
                .await,
        );
    }
    assert_eq!(seqs, vec![1, 2, 3, 4]);

    for _ in 0..4 {
        rx.recv().await.unwrap();
    }
}

#[tokio::test]
async fn test_duplicate_register_rejected() {
    let server = test_server();
    let err = server
        .register(
            Service::builder("Arith")
                .method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) })
                .build(),
        )
        .unwrap_err();
    assert!(err.to_string().contains("service already defined: Arith"));
}

#[tokio::test]
async fn test_serve_conn_over_duplex_stream() {
    // The server core is transport-agnostic: anything bidirectional works.
    let (near, far) = tokio::io::duplex(64 * 1024);

    let server = test_server();
    tokio::spawn(server.serve_conn(Box::new(far)));

    let client = Client::new(Box::new(near), ConnectOptions::default())
        .await
        .unwrap();
    let sum: i32 = client
        .call("Arith.Sum", &Args { num1: 30, num2: 12 })
        .await
        .unwrap();
    assert_eq!(sum, 42);
}

#[tokio::test]
async fn test_server_drops_connection_on_bad_magic() {
    use tokio::io::AsyncWriteExt;

    let (mut near, far) = tokio::io::duplex(4 * 1024);

    let server = test_server();
    let serve = tokio::spawn(server.serve_conn(Box::new(far)));

    // Hand-rolled preamble with the wrong magic number.
    near.write_all(b"{\"magic_number\":1,\"codec_type\":\"application/msgpack\",\"connect_timeout\":0,\"handle_timeout\":0}\n")
        .await
        .unwrap();

    // The server must abandon the connection rather than serve it.
    tokio::time::timeout(Duration::from_secs(1), serve)
        .await
        .expect("server kept the connection open")
        .unwrap();
}

#[tokio::test]
async fn test_server_drops_connection_on_unknown_codec() {
    use tokio::io::AsyncWriteExt;

    let (mut near, far) = tokio::io::duplex(4 * 1024);

    let server = test_server();
    let serve = tokio::spawn(server.serve_conn(Box::new(far)));

    near.write_all(b"{\"magic_number\":3891036,\"codec_type\":\"application/bogus\",\"connect_timeout\":0,\"handle_timeout\":0}\n")
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), serve)
        .await
        .expect("server kept the connection open")
        .unwrap();
}
