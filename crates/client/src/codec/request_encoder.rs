//! Streaming request encoder: a head followed by `Content-Length` framed payload chunks.

use bytes::BytesMut;
use tokio_util::codec::Encoder;
use tracing::error;

use crate::codec::body::LengthEncoder;
use crate::codec::header::HeaderEncoder;
use crate::protocol::{Message, PayloadSize, RequestHeader, SendError};

/// An encoder for outgoing requests: one head, then the payload it announced.
///
/// A payload item sent before the head, or a second head, is a [`SendError`].
#[derive(Debug, Default)]
pub struct RequestEncoder {
    header_encoder: HeaderEncoder,
    payload_encoder: Option<LengthEncoder>,
}

impl RequestEncoder {
    /// Creates an encoder waiting for a request head.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder<Message<(RequestHeader, PayloadSize)>> for RequestEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Message<(RequestHeader, PayloadSize)>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Header((head, payload_size)) => {
                if self.payload_encoder.is_some() {
                    error!("expect payload item but receive request head");
                    return Err(SendError::invalid_head("request head sent twice"));
                }

                if let PayloadSize::Length(length) = payload_size {
                    self.payload_encoder = Some(LengthEncoder::new(length));
                }
                self.header_encoder.encode((head, payload_size), dst)
            }

            Message::Payload(payload_item) => {
                let Some(payload_encoder) = &mut self.payload_encoder else {
                    error!("expect request head but receive payload item");
                    return Err(SendError::invalid_head("payload sent without a head announcing it"));
                };

                let is_eof = payload_item.is_eof();
                let result = payload_encoder.encode(payload_item, dst);
                if is_eof {
                    self.payload_encoder.take();
                }
                result
            }
        }
    }
}
