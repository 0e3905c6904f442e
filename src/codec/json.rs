//! JSON frame codec backed by `serde_json`.
//!
//! Same length-prefixed framing as the msgpack codec with JSON documents
//! inside the blobs. Useful when the peer wants human-readable traffic.

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufWriter, ReadHalf, WriteHalf};

use super::{read_blob, write_blob, BoxedConn, CodecKind, CodecPair, CodecRead, CodecWrite, Header};
use crate::error::Result;

/// JSON frame codec.
pub struct JsonCodec;

impl JsonCodec {
    /// Split `conn` into JSON codec halves.
    pub fn split(conn: BoxedConn) -> CodecPair {
        let (reader, writer) = tokio::io::split(conn);
        CodecPair {
            reader: Box::new(JsonReader { inner: reader }),
            writer: Box::new(JsonWriter {
                inner: BufWriter::new(writer),
            }),
            kind: CodecKind::Json,
        }
    }
}

/// Read half of the JSON codec.
pub struct JsonReader {
    inner: ReadHalf<BoxedConn>,
}

#[async_trait::async_trait]
impl CodecRead for JsonReader {
    async fn read_header(&mut self) -> Result<Header> {
        let blob = read_blob(&mut self.inner).await?;
        CodecKind::Json.decode(&blob)
    }

    async fn read_body(&mut self) -> Result<Bytes> {
        read_blob(&mut self.inner).await
    }
}

/// Write half of the JSON codec.
pub struct JsonWriter {
    inner: BufWriter<WriteHalf<BoxedConn>>,
}

#[async_trait::async_trait]
impl CodecWrite for JsonWriter {
    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let head = CodecKind::Json.encode(header)?;
        let result = async {
            write_blob(&mut self.inner, &head).await?;
            write_blob(&mut self.inner, body).await?;
            self.inner.flush().await?;
            Ok(())
        }
        .await;
        if let Err(ref err) = result {
            tracing::error!("rpc codec: json write error: {}", err);
            let _ = self.inner.shutdown().await;
        }
        result
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
