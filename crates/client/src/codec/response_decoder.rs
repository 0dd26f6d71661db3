//! Streaming response decoder.
//!
//! Yields one [`Message::Header`] with the parsed head and its payload framing, then
//! [`Message::Payload`] items until [`PayloadItem::Eof`].

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::body::PayloadDecoder;
use crate::codec::header::HeaderDecoder;
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, ResponseHeader};

/// A decoder for one HTTP/1.1 response: a [`Message::Header`], then payload items
/// ending with [`PayloadItem::Eof`].
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    header_decoder: HeaderDecoder,
    payload_decoder: Option<PayloadDecoder>,
}

impl ResponseDecoder {
    /// Creates a decoder for the next response on a connection.
    ///
    /// # Arguments
    /// * `head_request` - must be set when decoding the answer to a HEAD request
    pub fn new(head_request: bool) -> Self {
        Self { header_decoder: HeaderDecoder::new(head_request), payload_decoder: None }
    }

    fn payload_message(&mut self, item: Option<PayloadItem>) -> Option<Message<(ResponseHeader, PayloadSize)>> {
        match item {
            Some(item @ PayloadItem::Chunk(_)) => Some(Message::Payload(item)),
            Some(item @ PayloadItem::Eof) => {
                self.payload_decoder.take();
                Some(Message::Payload(item))
            }
            None => None,
        }
    }
}

impl Decoder for ResponseDecoder {
    type Item = Message<(ResponseHeader, PayloadSize)>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let item = payload_decoder.decode(src)?;
            return Ok(self.payload_message(item));
        }

        let message = match self.header_decoder.decode(src)? {
            Some((header, payload_size)) => {
                self.payload_decoder = Some(payload_size.into());
                Some(Message::Header((header, payload_size)))
            }
            None => None,
        };

        Ok(message)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let item = payload_decoder.decode_eof(src)?;
            return Ok(self.payload_message(item));
        }

        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(ParseError::invalid_header("connection closed inside response head")),
        }
    }
}
