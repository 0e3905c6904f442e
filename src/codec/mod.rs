//! Frame codec abstraction.
//!
//! A codec moves [`Header`]-plus-body frames over a bidirectional byte
//! stream. On the wire every unit is a length-prefixed blob (`u32` big
//! endian length, then that many bytes of codec-encoded value); a frame is
//! one header blob followed by exactly one body blob.
//!
//! Two codecs ship with the crate:
//!
//! - [`MsgpackCodec`] - self-describing binary bodies via `rmp-serde`
//! - [`JsonCodec`] - JSON bodies via `serde_json`
//!
//! Additional codecs can be registered process-wide by name with
//! [`register_codec`]; the handshake preamble selects the codec for a
//! connection by that name.
//!
//! Because the client writes while its background reader blocks on the next
//! response (and the server writes from handler tasks while its loop blocks
//! on the next request), a codec is constructed as a read half and a write
//! half. The write half is shared behind the per-connection send mutex, the
//! read half is owned by the single reading task.

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, RpcError};

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgpackCodec;

/// Maximum length of a single header or body blob (64 MiB).
pub const MAX_BLOB_LEN: u32 = 64 * 1024 * 1024;

/// Registry name of the self-describing binary codec (the default).
pub const MSGPACK_TYPE: &str = "application/msgpack";

/// Registry name of the JSON codec.
pub const JSON_TYPE: &str = "application/json";

/// Frame header carried before every request and every response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Qualified method name, format "Service.Method".
    pub service_method: String,
    /// Client-assigned sequence number, echoed by the server.
    pub seq: u64,
    /// Empty on requests; non-empty on a response iff the server could not
    /// produce a reply.
    pub error: String,
}

impl Header {
    /// Build a request header.
    pub fn request(service_method: &str, seq: u64) -> Self {
        Self {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        }
    }
}

/// A bidirectional byte stream a codec can be constructed from.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

/// Boxed connection, the form streams are handed to codec factories in.
pub type BoxedConn = Box<dyn Connection>;

/// Read half of a codec: decodes headers and hands body blobs out raw.
#[async_trait::async_trait]
pub trait CodecRead: Send {
    /// Read and decode the next frame header.
    async fn read_header(&mut self) -> Result<Header>;

    /// Read the next body blob. Dropping the returned bytes discards the
    /// body, which keeps the stream aligned when no one wants it.
    async fn read_body(&mut self) -> Result<Bytes>;
}

/// Write half of a codec.
#[async_trait::async_trait]
pub trait CodecWrite: Send {
    /// Write a header and its body contiguously and flush. A failed write
    /// shuts the transport down before returning the error.
    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<()>;

    /// Shut the transport down.
    async fn close(&mut self) -> Result<()>;
}

/// Value encoding a codec uses for headers and bodies.
///
/// The client and the server-side method trampolines use this to encode
/// arguments and decode replies in the same encoding the connection's codec
/// speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    /// MessagePack, struct-as-map so payloads stay self-describing.
    Msgpack,
    /// JSON.
    Json,
}

impl CodecKind {
    /// Encode a value.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecKind::Msgpack => Ok(rmp_serde::to_vec_named(value)?),
            CodecKind::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Decode a value.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            CodecKind::Msgpack => Ok(rmp_serde::from_slice(bytes)?),
            CodecKind::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

/// The two halves of a constructed codec plus the value encoding it speaks.
pub struct CodecPair {
    /// Read half, owned by the connection's reading task.
    pub reader: Box<dyn CodecRead>,
    /// Write half, shared behind the per-connection send mutex.
    pub writer: Box<dyn CodecWrite>,
    /// Value encoding for arguments and replies on this connection.
    pub kind: CodecKind,
}

/// Constructs a codec over a connection.
pub type CodecFactory = fn(BoxedConn) -> CodecPair;

static CODECS: LazyLock<RwLock<HashMap<String, CodecFactory>>> = LazyLock::new(|| {
    let mut map: HashMap<String, CodecFactory> = HashMap::new();
    map.insert(MSGPACK_TYPE.to_string(), MsgpackCodec::split);
    map.insert(JSON_TYPE.to_string(), JsonCodec::split);
    RwLock::new(map)
});

/// Register an additional codec under `name`, replacing any previous entry.
pub fn register_codec(name: &str, factory: CodecFactory) {
    CODECS
        .write()
        .expect("codec registry lock poisoned")
        .insert(name.to_string(), factory);
}

/// Look up a codec factory by name.
pub fn codec_factory(name: &str) -> Option<CodecFactory> {
    CODECS
        .read()
        .expect("codec registry lock poisoned")
        .get(name)
        .copied()
}

/// Read one length-prefixed blob.
pub(crate) async fn read_blob<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_BLOB_LEN {
        return Err(RpcError::Protocol(format!(
            "blob length {} exceeds maximum {}",
            len, MAX_BLOB_LEN
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Write one length-prefixed blob. Does not flush.
pub(crate) async fn write_blob<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_BLOB_LEN as usize {
        return Err(RpcError::Protocol(format!(
            "blob length {} exceeds maximum {}",
            bytes.len(),
            MAX_BLOB_LEN
        )));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    Ok(())
}
