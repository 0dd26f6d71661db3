//! Selects the payload decoding strategy for a response.

use crate::codec::body::chunked_decoder::ChunkedDecoder;
use crate::codec::body::close_decoder::CloseDecoder;
use crate::codec::body::length_decoder::LengthDecoder;
use crate::protocol::{ParseError, PayloadItem, PayloadSize};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// A response body decoder that dispatches to the framing the head announced.
///
/// Build one from the [`PayloadSize`] decoded with the head, then feed it the rest
/// of the stream until it yields [`PayloadItem::Eof`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadDecoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Length(LengthDecoder),
    Chunked(ChunkedDecoder),
    UntilClose(CloseDecoder),
    NoBody,
}

impl PayloadDecoder {
    /// Creates a decoder for a response without a body, which yields `Eof` at once.
    pub fn empty() -> Self {
        Self { kind: Kind::NoBody }
    }

    /// Creates a decoder for `Transfer-Encoding: chunked` bodies.
    pub fn chunked() -> Self {
        Self { kind: Kind::Chunked(ChunkedDecoder::new()) }
    }

    /// Creates a decoder for a body of `size` bytes.
    ///
    /// # Arguments
    /// * `size` - the value of the `Content-Length` header
    pub fn fix_length(size: u64) -> Self {
        Self { kind: Kind::Length(LengthDecoder::new(size)) }
    }

    /// Creates a decoder for a body that ends when the server closes the connection.
    pub fn until_close() -> Self {
        Self { kind: Kind::UntilClose(CloseDecoder::default()) }
    }
}

impl From<PayloadSize> for PayloadDecoder {
    fn from(payload_size: PayloadSize) -> Self {
        match payload_size {
            PayloadSize::Length(size) => PayloadDecoder::fix_length(size),
            PayloadSize::Chunked => PayloadDecoder::chunked(),
            PayloadSize::Empty => PayloadDecoder::empty(),
            PayloadSize::UntilClose => PayloadDecoder::until_close(),
        }
    }
}

impl Decoder for PayloadDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            Kind::Length(decoder) => decoder.decode(src),
            Kind::Chunked(decoder) => decoder.decode(src),
            Kind::UntilClose(decoder) => decoder.decode(src),
            Kind::NoBody => Ok(Some(PayloadItem::Eof)),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            Kind::Length(decoder) => decoder.decode_eof(src),
            Kind::Chunked(decoder) => decoder.decode_eof(src),
            Kind::UntilClose(decoder) => decoder.decode_eof(src),
            Kind::NoBody => Ok(Some(PayloadItem::Eof)),
        }
    }
}
