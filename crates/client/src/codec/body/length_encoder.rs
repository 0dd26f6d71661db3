//! Encoder for request payloads framed by `Content-Length`.

use crate::protocol::{PayloadItem, SendError};
use bytes::BytesMut;
use tokio_util::codec::Encoder;
use tracing::warn;

/// Copies chunks through while counting down the announced length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthEncoder {
    remaining: u64,
}

impl LengthEncoder {
    /// Creates an encoder for a body announced as `length` bytes.
    ///
    /// # Arguments
    /// * `length` - the `Content-Length` sent with the request head
    pub fn new(length: u64) -> Self {
        Self { remaining: length }
    }
}

impl Encoder<PayloadItem> for LengthEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            PayloadItem::Chunk(bytes) => {
                let len = bytes.len() as u64;
                if len > self.remaining {
                    warn!(len, remaining = self.remaining, "request body longer than its content-length");
                    return Err(SendError::invalid_head("body exceeds content-length"));
                }
                dst.extend_from_slice(&bytes);
                self.remaining -= len;
                Ok(())
            }
            PayloadItem::Eof => {
                if self.remaining != 0 {
                    return Err(SendError::invalid_head(format!("body ended {} bytes short", self.remaining)));
                }
                Ok(())
            }
        }
    }
}
