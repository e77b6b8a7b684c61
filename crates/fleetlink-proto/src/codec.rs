//! Message codec for async streams

use crate::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Codec framing MessagePack-encoded messages with a 4-byte length prefix.
///
/// One codec instance owns one direction of one stream; the read buffer is
/// internal state and must not be shared across readers.
pub struct MessageCodec {
    /// Read buffer for incoming data
    read_buf: BytesMut,
    /// Maximum message size allowed
    max_message_size: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    /// Create a new codec with default settings
    pub fn new() -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Create a new codec with a custom max message size
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_message_size,
        }
    }

    /// Encode a message to bytes with length prefix
    pub fn encode<M: Serialize>(&self, message: &M) -> Result<Bytes, ProtocolError> {
        let body = rmp_serde::to_vec(message)
            .map_err(|e| ProtocolError::Serialization(format!("encode: {}", e)))?;

        if body.len() > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: body.len(),
                max: self.max_message_size,
            });
        }

        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);

        Ok(buf.freeze())
    }

    /// Write one message to an async writer.
    ///
    /// The length prefix and body go out in a single `write_all`, so a
    /// message is never interleaved with another writer's bytes as long as
    /// callers serialize access to the writer.
    pub async fn write_message<W, M>(&self, writer: &mut W, message: &M) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
        M: Serialize,
    {
        let encoded = self.encode(message)?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read the next message from an async reader.
    ///
    /// Returns `Ok(None)` on a clean EOF at a message boundary. EOF in the
    /// middle of a message is an error.
    pub async fn read_message<R, M>(&mut self, reader: &mut R) -> Result<Option<M>, ProtocolError>
    where
        R: AsyncRead + Unpin,
        M: DeserializeOwned,
    {
        loop {
            if let Some(message) = self.try_decode()? {
                return Ok(Some(message));
            }

            let mut temp_buf = [0u8; 8192];
            let n = reader.read(&mut temp_buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                } else {
                    return Err(ProtocolError::InvalidMessage);
                }
            }

            self.read_buf.extend_from_slice(&temp_buf[..n]);
        }
    }

    /// Try to decode one message from the internal buffer
    pub fn try_decode<M: DeserializeOwned>(&mut self) -> Result<Option<M>, ProtocolError> {
        if self.read_buf.len() < 4 {
            return Ok(None);
        }

        // Peek the length prefix without consuming it
        let body_len = (&self.read_buf[..4]).get_u32() as usize;

        if body_len > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: body_len,
                max: self.max_message_size,
            });
        }

        if self.read_buf.len() < 4 + body_len {
            return Ok(None);
        }

        self.read_buf.advance(4);
        let body = self.read_buf.split_to(body_len);

        let message = rmp_serde::from_slice(&body)
            .map_err(|e| ProtocolError::Serialization(format!("decode: {}", e)))?;
        Ok(Some(message))
    }

    /// Get the current buffer size
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }
}
