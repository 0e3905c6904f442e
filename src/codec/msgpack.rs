//! Self-describing binary codec backed by `rmp-serde`.
//!
//! Headers and bodies are MessagePack documents inside length-prefixed
//! blobs. Encoding uses `to_vec_named` so structs travel as maps and stay
//! decodable without out-of-band schema.

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};

use super::{read_blob, write_blob, BoxedConn, CodecKind, CodecPair, CodecRead, CodecWrite, Header};
use crate::error::Result;

/// MessagePack frame codec, the default for new connections.
pub struct MsgpackCodec;

impl MsgpackCodec {
    /// Split `conn` into msgpack codec halves.
    pub fn split(conn: BoxedConn) -> CodecPair {
        let (reader, writer) = tokio::io::split(conn);
        CodecPair {
            reader: Box::new(MsgpackReader { inner: reader }),
            writer: Box::new(MsgpackWriter {
                inner: BufWriter::new(writer),
            }),
            kind: CodecKind::Msgpack,
        }
    }
}

/// Read half of the msgpack codec.
pub struct MsgpackReader {
    inner: ReadHalf<BoxedConn>,
}

#[async_trait::async_trait]
impl CodecRead for MsgpackReader {
    async fn read_header(&mut self) -> Result<Header> {
        let blob = read_blob(&mut self.inner).await?;
        CodecKind::Msgpack.decode(&blob)
    }

    async fn read_body(&mut self) -> Result<Bytes> {
        read_blob(&mut self.inner).await
    }
}

/// Write half of the msgpack codec. Writes are buffered and flushed once
/// per frame.
pub struct MsgpackWriter {
    inner: BufWriter<WriteHalf<BoxedConn>>,
}

#[async_trait::async_trait]
impl CodecWrite for MsgpackWriter {
    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let head = CodecKind::Msgpack.encode(header)?;
        let result = async {
            write_blob(&mut self.inner, &head).await?;
            write_blob(&mut self.inner, body).await?;
            self.inner.flush().await?;
            Ok(())
        }
        .await;
        if let Err(ref err) = result {
            tracing::error!("rpc codec: msgpack write error: {}", err);
            let _ = self.inner.shutdown().await;
        }
        result
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
