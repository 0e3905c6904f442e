//! Server dispatcher: accepts connections, runs the handshake, and serves
//! frames.
//!
//! Each accepted connection gets its own task. Within a connection, requests
//! are read sequentially but handled in parallel; responses are serialized
//! by a per-connection send mutex so a header and its body are never
//! interleaved with another handler's frame. On shutdown the serve loop
//! drains in-flight handlers before closing the codec.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinSet;

use crate::codec::{codec_factory, BoxedConn, CodecKind, CodecPair, CodecWrite, Header};
use crate::error::{Result, RpcError};
use crate::handshake::{read_preamble, MAGIC_NUMBER};
use crate::service::{Method, Service};

/// Write half of a connection's codec behind the per-connection send mutex.
type SharedWriter = Arc<Mutex<Box<dyn CodecWrite>>>;

/// RPC server: a concurrent map of registered services.
#[derive(Default)]
pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Server {
    /// Create an empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service. A duplicate name fails and leaves the first
    /// registration intact.
    pub fn register(&self, service: Service) -> Result<()> {
        let mut services = self.services.write().expect("service map lock poisoned");
        if services.contains_key(service.name()) {
            return Err(RpcError::DuplicateService(service.name().to_string()));
        }
        services.insert(service.name().to_string(), Arc::new(service));
        Ok(())
    }

    /// Resolve `"Service.Method"`, splitting on the last dot.
    fn find_service(&self, service_method: &str) -> Result<Arc<Method>> {
        let dot = service_method.rfind('.').ok_or_else(|| {
            RpcError::Protocol(format!(
                "service/method request ill-formed: {}",
                service_method
            ))
        })?;
        let (service_name, method_name) = (&service_method[..dot], &service_method[dot + 1..]);

        let service = self
            .services
            .read()
            .expect("service map lock poisoned")
            .get(service_name)
            .cloned()
            .ok_or_else(|| RpcError::ServiceNotFound(service_name.to_string()))?;

        service
            .method(method_name)
            .cloned()
            .ok_or_else(|| RpcError::MethodNotFound(service_method.to_string()))
    }

    /// Accept connections on `listener` forever, serving each on its own
    /// task. Returns when the listener fails.
    pub async fn accept(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.serve_conn(Box::new(stream) as BoxedConn).await;
                    });
                }
                Err(err) => {
                    tracing::error!("rpc server: accept error: {}", err);
                    return;
                }
            }
        }
    }

    /// Run the handshake on `conn`, then serve frames until the peer goes
    /// away.
    ///
    /// The connection is dropped (closed) on a bad preamble, a magic-number
    /// mismatch, or an unknown codec name.
    pub async fn serve_conn(self: Arc<Self>, mut conn: BoxedConn) {
        let opt = match read_preamble(&mut conn).await {
            Ok(opt) => opt,
            Err(err) => {
                tracing::error!("rpc server: options error: {}", err);
                return;
            }
        };
        if opt.magic_number != MAGIC_NUMBER {
            tracing::error!(
                "rpc server: invalid magic number {:#x}",
                opt.magic_number
            );
            return;
        }
        let Some(factory) = codec_factory(&opt.codec_type) else {
            tracing::error!("rpc server: invalid codec type {}", opt.codec_type);
            return;
        };
        self.serve_codec(factory(conn), opt.handle_timeout).await;
    }

    /// Per-connection read loop.
    async fn serve_codec(&self, pair: CodecPair, handle_timeout: Duration) {
        let CodecPair {
            mut reader,
            writer,
            kind,
        } = pair;
        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        let mut handlers = JoinSet::new();

        loop {
            let header = match reader.read_header().await {
                Ok(header) => header,
                Err(err) => {
                    if !is_clean_eof(&err) {
                        tracing::error!("rpc server: read header error: {}", err);
                    }
                    break;
                }
            };

            let method = match self.find_service(&header.service_method) {
                Ok(method) => method,
                Err(err) => {
                    // The request body is still on the wire; discard it so
                    // the stream stays framed, then report the resolution
                    // failure on the same header.
                    if reader.read_body().await.is_err() {
                        break;
                    }
                    let mut response = header;
                    response.error = err.to_string();
                    send_response(&writer, &response, &[]).await;
                    continue;
                }
            };

            let body = match reader.read_body().await {
                Ok(body) => body,
                Err(err) => {
                    tracing::error!("rpc server: read body error: {}", err);
                    let mut response = header;
                    response.error = err.to_string();
                    send_response(&writer, &response, &[]).await;
                    continue;
                }
            };

            handlers.spawn(handle_request(
                method,
                header,
                body,
                kind,
                writer.clone(),
                handle_timeout,
            ));
        }

        // Connection is done; let in-flight handlers finish, then close.
        while handlers.join_next().await.is_some() {}
        let _ = writer.lock().await.close().await;
    }
}

/// Invoke one request and write its response.
///
/// The invocation runs on its own task and delivers its encoded outcome
/// through a oneshot; this coordinator owns all response writing. When the
/// handle timeout fires first, the timeout error response is written here
/// and the invocation task is left running; its eventual outcome lands on a
/// dead oneshot and never touches the stream.
async fn handle_request(
    method: Arc<Method>,
    mut header: Header,
    body: Bytes,
    kind: CodecKind,
    writer: SharedWriter,
    timeout: Duration,
) {
    let (called_tx, called_rx) = oneshot::channel();
    tokio::spawn(async move {
        let outcome = method.invoke(body, kind).await;
        let _ = called_tx.send(outcome);
    });

    if timeout.is_zero() {
        let outcome = flatten(called_rx.await);
        write_outcome(&writer, &mut header, outcome).await;
        return;
    }

    tokio::select! {
        _ = tokio::time::sleep(timeout) => {
            header.error = format!(
                "rpc server: request handle timeout: expect within {:?}",
                timeout
            );
            send_response(&writer, &header, &[]).await;
        }
        outcome = called_rx => {
            write_outcome(&writer, &mut header, flatten(outcome)).await;
        }
    }
}

/// A dropped oneshot means the invocation task died mid-flight.
fn flatten(outcome: std::result::Result<Result<Vec<u8>>, oneshot::error::RecvError>) -> Result<Vec<u8>> {
    outcome.unwrap_or_else(|_| Err(RpcError::Handler("method panicked".to_string())))
}

async fn write_outcome(writer: &SharedWriter, header: &mut Header, outcome: Result<Vec<u8>>) {
    match outcome {
        Ok(reply) => send_response(writer, header, &reply).await,
        Err(err) => {
            header.error = err.to_string();
            // Empty placeholder body keeps the frame self-consistent.
            send_response(writer, header, &[]).await;
        }
    }
}

/// Write one response under the send mutex. Write errors are logged; the
/// connection's next read observes the failure and terminates the loop.
async fn send_response(writer: &SharedWriter, header: &Header, body: &[u8]) {
    let mut writer = writer.lock().await;
    if let Err(err) = writer.write(header, body).await {
        tracing::error!("rpc server: write response error: {}", err);
    }
}

fn is_clean_eof(err: &RpcError) -> bool {
    matches!(err, RpcError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof)
}
