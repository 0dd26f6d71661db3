//! Decoder for response payloads that run until the server closes the connection.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::protocol::{ParseError, PayloadItem};

/// A decoder for bodies delimited by the server closing the connection.
///
/// Every byte that arrives belongs to the body; `decode_eof` yields the rest and then
/// [`PayloadItem::Eof`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseDecoder {
    finished: bool,
}

impl Decoder for CloseDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.finished {
            return Ok(Some(PayloadItem::Eof));
        }
        if src.is_empty() {
            return Ok(None);
        }
        Ok(Some(PayloadItem::Chunk(src.split().freeze())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        self.finished = true;
        Ok(Some(PayloadItem::Eof))
    }
}
