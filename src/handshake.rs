//! Connection preamble.
//!
//! The initiator sends one [`ConnectOptions`] JSON document terminated by a
//! newline as the very first bytes on the stream. The acceptor validates the
//! magic number, selects the body codec by name, and switches to it for all
//! subsequent frames. JSON is the one encoding both sides understand before
//! a codec has been agreed on.
//!
//! The acceptor reads the preamble byte at a time so nothing past the
//! newline is buffered away from the codec that takes over the stream.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::MSGPACK_TYPE;
use crate::error::{Result, RpcError};

/// Sanity-check constant opening every connection.
pub const MAGIC_NUMBER: u32 = 0x3b5f5c;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the preamble line, far above any legitimate options value.
const MAX_PREAMBLE_LEN: usize = 4096;

/// Handshake preamble: selects the body codec and carries the timeout
/// configuration for the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Must equal [`MAGIC_NUMBER`]; anything else is a stray stream.
    pub magic_number: u32,
    /// Registry name of the body codec.
    pub codec_type: String,
    /// Budget for the whole dial-plus-handshake path. Zero disables it.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Per-request budget on the server. Zero means unlimited.
    #[serde(with = "duration_ms")]
    pub handle_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: MSGPACK_TYPE.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl ConnectOptions {
    /// Force the magic constant and fill an empty codec name with the
    /// default. Applied to every user-supplied options value.
    pub fn normalized(mut self) -> Self {
        self.magic_number = MAGIC_NUMBER;
        if self.codec_type.is_empty() {
            self.codec_type = MSGPACK_TYPE.to_string();
        }
        self
    }

    /// Select the body codec by registry name.
    pub fn with_codec(mut self, codec_type: &str) -> Self {
        self.codec_type = codec_type.to_string();
        self
    }

    /// Override the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the per-request handle timeout.
    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }
}

/// Write the preamble line and flush.
pub(crate) async fn write_preamble<W: AsyncWrite + Unpin>(
    writer: &mut W,
    opts: &ConnectOptions,
) -> Result<()> {
    let mut line = serde_json::to_vec(opts)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the preamble line without consuming any bytes past the newline.
pub(crate) async fn read_preamble<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ConnectOptions> {
    let mut line = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= MAX_PREAMBLE_LEN {
            return Err(RpcError::Protocol("handshake preamble too long".to_string()));
        }
        line.push(byte[0]);
    }
    Ok(serde_json::from_slice(&line)?)
}

/// Durations ride the preamble as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
