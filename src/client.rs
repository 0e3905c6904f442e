//! Client multiplexer: many concurrent calls over one connection.
//!
//! A [`Client`] assigns every outgoing call a sequence number, parks the
//! call in a pending table, and writes the frame under the sending mutex so
//! a header and its body are contiguous on the wire. A background receive
//! task matches responses to pending calls by sequence number and deposits
//! each completed [`Call`] into its done channel exactly once. Any terminal
//! failure of the connection completes every pending call with that error.
//!
//! # Example
//!
//! ```ignore
//! let client = Client::dial("127.0.0.1:9007").await?;
//! let sum: i32 = client.call("Arith.Sum", &Args { num1: 1, num2: 2 }).await?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use crate::codec::{codec_factory, BoxedConn, CodecKind, CodecRead, CodecWrite, Header};
use crate::error::{Result, RpcError};
use crate::handshake::{write_preamble, ConnectOptions};

/// A completed call, delivered through its done channel.
#[derive(Debug, Clone)]
pub struct Call {
    /// Sequence number assigned at registration (0 if registration was
    /// refused).
    pub seq: u64,
    /// Qualified method name, format "Service.Method".
    pub service_method: String,
    /// Terminal error, if any.
    pub error: Option<RpcError>,
    /// Raw reply body; present iff the call succeeded.
    reply: Option<Bytes>,
    kind: CodecKind,
}

impl Call {
    /// Decode the reply body, or surface the call's error.
    pub fn reply<R: DeserializeOwned>(&self) -> Result<R> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let bytes = self
            .reply
            .as_ref()
            .ok_or_else(|| RpcError::Protocol("call completed without a reply body".to_string()))?;
        self.kind.decode(bytes)
    }
}

/// Channel end completed calls are deposited into. Must be buffered
/// (capacity >= 1) so depositing never blocks on the receiver; tokio
/// enforces this at channel construction.
pub type DoneSender = mpsc::Sender<Call>;

struct PendingCall {
    call: Call,
    done: DoneSender,
}

struct ClientState {
    /// Next sequence number; starts at 1 and is never reused.
    next_seq: u64,
    pending: HashMap<u64, PendingCall>,
    /// Set by [`Client::close`]; rejects new calls.
    closing: bool,
    /// Set by the receive loop on I/O failure; rejects new calls.
    shutdown: bool,
    close_tx: Option<oneshot::Sender<()>>,
}

/// RPC client over one connection.
///
/// Cheap to clone; all clones share the connection and pending table.
#[derive(Clone)]
pub struct Client {
    /// Sending mutex: held across register-plus-write in [`Client::go`] and
    /// taken first by termination.
    writer: Arc<AsyncMutex<Box<dyn CodecWrite>>>,
    kind: CodecKind,
    state: Arc<Mutex<ClientState>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("kind", &self.kind).finish()
    }
}

impl Client {
    /// Dial `addr` with default options.
    pub async fn dial<A: ToSocketAddrs>(addr: A) -> Result<Client> {
        Self::dial_with_options(addr, ConnectOptions::default()).await
    }

    /// Dial with explicit options.
    ///
    /// The whole connect-plus-handshake path is raced against the connect
    /// timeout; on expiry the in-flight attempt is dropped (closing the
    /// transport) and a connect-timeout error is returned. A zero timeout
    /// disables the race.
    pub async fn dial_with_options<A: ToSocketAddrs>(
        addr: A,
        opts: ConnectOptions,
    ) -> Result<Client> {
        let opts = opts.normalized();
        let connect_timeout = opts.connect_timeout;

        let attempt = async move {
            let stream = TcpStream::connect(addr).await?;
            Self::new(Box::new(stream) as BoxedConn, opts).await
        };

        if connect_timeout.is_zero() {
            attempt.await
        } else {
            match tokio::time::timeout(connect_timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(RpcError::ConnectTimeout(connect_timeout)),
            }
        }
    }

    /// Build a client over an established bidirectional stream: write the
    /// preamble, construct the codec, and start the background receive
    /// task. This is the entry point for non-TCP transports.
    pub async fn new(mut conn: BoxedConn, opts: ConnectOptions) -> Result<Client> {
        let opts = opts.normalized();
        let Some(factory) = codec_factory(&opts.codec_type) else {
            let err = RpcError::InvalidCodec(opts.codec_type.clone());
            tracing::error!("rpc client: codec error: {}", err);
            return Err(err);
        };
        if let Err(err) = write_preamble(&mut conn, &opts).await {
            tracing::error!("rpc client: options error: {}", err);
            return Err(err);
        }

        let pair = factory(conn);
        let (close_tx, close_rx) = oneshot::channel();
        let state = Arc::new(Mutex::new(ClientState {
            next_seq: 1,
            pending: HashMap::new(),
            closing: false,
            shutdown: false,
            close_tx: Some(close_tx),
        }));
        let writer = Arc::new(AsyncMutex::new(pair.writer));

        tokio::spawn(receive(
            pair.reader,
            close_rx,
            state.clone(),
            writer.clone(),
        ));

        Ok(Client {
            writer,
            kind: pair.kind,
            state,
        })
    }

    /// True while the client is neither closed nor shut down.
    pub fn is_available(&self) -> bool {
        let state = self.state.lock().expect("client state lock poisoned");
        !state.closing && !state.shutdown
    }

    /// Close the connection. The receive loop stops and every outstanding
    /// call completes with the shutdown error. A second close fails with
    /// the shutdown error.
    pub async fn close(&self) -> Result<()> {
        let close_tx = {
            let mut state = self.state.lock().expect("client state lock poisoned");
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
            state.close_tx.take()
        };
        if let Some(tx) = close_tx {
            let _ = tx.send(());
        }
        Ok(())
    }

    /// Submit a call asynchronously. The completed [`Call`] is deposited
    /// into `done` exactly once. Returns the assigned sequence number, or 0
    /// if the client refused the call (already closing or shut down); the
    /// refusal itself arrives through `done` as a call completed with the
    /// shutdown error.
    ///
    /// The submission itself must not be abandoned mid-flight: poll the
    /// returned future to completion (it finishes as soon as the frame is
    /// written). [`Client::call`] wraps it in a detached task so its own
    /// cancellation can never tear a frame in half.
    pub async fn go<A: Serialize>(&self, service_method: &str, args: &A, done: DoneSender) -> u64 {
        let mut call = Call {
            seq: 0,
            service_method: service_method.to_string(),
            error: None,
            reply: None,
            kind: self.kind,
        };

        let body = match self.kind.encode(args) {
            Ok(body) => body,
            Err(err) => {
                call.error = Some(err);
                let _ = done.send(call).await;
                return 0;
            }
        };

        self.send_call(call, body, done).await
    }

    /// Register the call and write its frame under the sending mutex.
    async fn send_call(&self, mut call: Call, body: Vec<u8>, done: DoneSender) -> u64 {
        assert!(
            done.max_capacity() >= 1,
            "rpc client: done channel is unbuffered"
        );

        // Sending mutex held across register-plus-write so a header and its
        // body are contiguous on the wire.
        let mut writer = self.writer.lock().await;

        let registered = {
            let mut state = self.state.lock().expect("client state lock poisoned");
            if state.closing || state.shutdown {
                Err(RpcError::Shutdown)
            } else {
                let seq = state.next_seq;
                state.next_seq += 1;
                call.seq = seq;
                state.pending.insert(
                    seq,
                    PendingCall {
                        call: call.clone(),
                        done: done.clone(),
                    },
                );
                Ok(seq)
            }
        };
        let seq = match registered {
            Ok(seq) => seq,
            Err(err) => {
                drop(writer);
                call.error = Some(err);
                let _ = done.send(call).await;
                return 0;
            }
        };

        let header = Header::request(&call.service_method, seq);
        if let Err(err) = writer.write(&header, &body).await {
            drop(writer);
            // The receive loop may have raced us to this entry; whoever
            // removes it completes the call.
            if let Some(mut pending) = self.remove_call(seq) {
                pending.call.error = Some(err);
                let _ = pending.done.send(pending.call).await;
            }
        }
        seq
    }

    /// Call synchronously: submit and wait for the completion, then decode
    /// the reply.
    ///
    /// The returned future is cancel safe: dropping it mid-wait (from
    /// `tokio::time::timeout`, `select!`, ...) removes the pending entry,
    /// so the late response is discarded by the receive loop and the client
    /// stays usable.
    pub async fn call<A: Serialize, R: DeserializeOwned>(
        &self,
        service_method: &str,
        args: &A,
    ) -> Result<R> {
        let (done, mut rx) = mpsc::channel(1);

        let call = Call {
            seq: 0,
            service_method: service_method.to_string(),
            error: None,
            reply: None,
            kind: self.kind,
        };
        let body = self.kind.encode(args)?;

        // Submit on a detached task: cancelling this future can abandon the
        // wait but never a half-written frame.
        let client = self.clone();
        let submit = tokio::spawn(async move { client.send_call(call, body, done).await });
        let seq = submit.await.map_err(|_| RpcError::Shutdown)?;

        let mut guard = RemovePending {
            state: Some(self.state.clone()),
            seq,
        };
        let call = rx.recv().await.ok_or(RpcError::Shutdown)?;
        guard.disarm();

        call.reply()
    }

    fn remove_call(&self, seq: u64) -> Option<PendingCall> {
        self.state
            .lock()
            .expect("client state lock poisoned")
            .pending
            .remove(&seq)
    }
}

/// Removes the pending entry when a synchronous wait is cancelled.
struct RemovePending {
    state: Option<Arc<Mutex<ClientState>>>,
    seq: u64,
}

impl RemovePending {
    fn disarm(&mut self) {
        self.state = None;
    }
}

impl Drop for RemovePending {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            if let Ok(mut state) = state.lock() {
                state.pending.remove(&self.seq);
            }
        }
    }
}

/// Background reader: match responses to pending calls by sequence number.
async fn receive(
    mut reader: Box<dyn CodecRead>,
    mut close_rx: oneshot::Receiver<()>,
    state: Arc<Mutex<ClientState>>,
    writer: Arc<AsyncMutex<Box<dyn CodecWrite>>>,
) {
    let err = loop {
        let header = tokio::select! {
            _ = &mut close_rx => break RpcError::Shutdown,
            result = reader.read_header() => match result {
                Ok(header) => header,
                Err(err) => break err,
            },
        };

        let pending = {
            state
                .lock()
                .expect("client state lock poisoned")
                .pending
                .remove(&header.seq)
        };

        match pending {
            // The client already gave up on this seq (partial send or a
            // cancelled wait); discard the body to stay aligned.
            None => {
                if let Err(err) = reader.read_body().await {
                    break err;
                }
            }
            Some(mut pending) if !header.error.is_empty() => {
                let body_result = reader.read_body().await;
                pending.call.error = Some(RpcError::Remote(header.error));
                let _ = pending.done.send(pending.call).await;
                if let Err(err) = body_result {
                    break err;
                }
            }
            Some(mut pending) => match reader.read_body().await {
                Ok(body) => {
                    pending.call.reply = Some(body);
                    let _ = pending.done.send(pending.call).await;
                }
                Err(err) => {
                    pending.call.error = Some(err.clone());
                    let _ = pending.done.send(pending.call).await;
                    break err;
                }
            },
        }
    };

    terminate_calls(&state, &writer, err).await;
}

/// Complete every pending call with `err` and mark the client shut down.
///
/// Takes the sending mutex first to quiesce senders, then the state lock.
/// This is the only place both are held, and the only order used anywhere.
async fn terminate_calls(
    state: &Arc<Mutex<ClientState>>,
    writer: &Arc<AsyncMutex<Box<dyn CodecWrite>>>,
    err: RpcError,
) {
    let mut writer = writer.lock().await;

    let drained: Vec<PendingCall> = {
        let mut state = state.lock().expect("client state lock poisoned");
        state.shutdown = true;
        state.pending.drain().map(|(_, pending)| pending).collect()
    };

    tracing::debug!(
        "rpc client: terminating {} pending call(s): {}",
        drained.len(),
        err
    );
    for mut pending in drained {
        pending.call.error = Some(err.clone());
        let _ = pending.done.send(pending.call).await;
    }

    let _ = writer.close().await;
}
