//! Decoder for response payloads delimited by a `Content-Length` header.

use std::cmp;

use crate::protocol::{ParseError, PayloadItem};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Yields whatever is buffered, up to the bytes still owed, then [`PayloadItem::Eof`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthDecoder {
    /// Body bytes still owed by the server
    remaining: u64,
}

impl LengthDecoder {
    /// Creates a decoder for a body of exactly `length` bytes.
    ///
    /// # Arguments
    /// * `length` - the value of the response's `Content-Length` header
    pub fn new(length: u64) -> Self {
        Self { remaining: length }
    }
}

impl Decoder for LengthDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    /// Splits off the buffered part of the body.
    ///
    /// # Returns
    /// * `Ok(Some(PayloadItem::Chunk(bytes)))` with at most the bytes still owed
    /// * `Ok(Some(PayloadItem::Eof))` once the whole body has been read
    /// * `Ok(None)` when the buffer is empty
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.remaining == 0 {
            return Ok(Some(PayloadItem::Eof));
        }

        if src.is_empty() {
            return Ok(None);
        }

        let len = cmp::min(self.remaining, src.len() as u64);
        #[allow(clippy::cast_possible_truncation, reason = "len is bounded by src.len()")]
        let bytes = src.split_to(len as usize).freeze();

        self.remaining -= bytes.len() as u64;
        Ok(Some(PayloadItem::Chunk(bytes)))
    }

    /// Like [`decode`](Self::decode), but a connection closed before the full length
    /// arrived is a [`ParseError::InvalidBody`].
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => Err(ParseError::invalid_body(format!("connection closed with {} body bytes missing", self.remaining))),
        }
    }
}
