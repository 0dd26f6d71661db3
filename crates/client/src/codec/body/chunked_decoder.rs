//! Decoder for `Transfer-Encoding: chunked` response payloads
//! ([RFC 9112 section 7.1](https://www.rfc-editor.org/rfc/rfc9112#section-7.1)).
//!
//! Size lines (including any chunk extensions) are parsed with
//! [`httparse::parse_chunk_size`]; trailer fields after the last chunk are skipped.

use bytes::{Buf, BytesMut};
use httparse::Status;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::protocol::{ParseError, PayloadItem};
use ChunkedState::*;

const CRLF: &[u8] = b"\r\n";

/// A decoder for `Transfer-Encoding: chunked` response bodies.
///
/// Chunk extensions and trailers are read and discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: ChunkedState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    /// Expecting a size line
    Size,
    /// Inside chunk data with this many bytes left
    Data(u64),
    /// Expecting the CRLF that closes chunk data
    DataEnd,
    /// After the zero sized chunk, skipping trailer lines up to the empty one
    Trailer,
    /// The terminating empty line was read
    End,
}

impl ChunkedDecoder {
    /// Creates a decoder positioned before the first chunk size line.
    pub fn new() -> Self {
        Self { state: Size }
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                Size => match httparse::parse_chunk_size(src) {
                    Ok(Status::Complete((consumed, size))) => {
                        src.advance(consumed);
                        trace!(size, "read chunk size");
                        self.state = if size == 0 { Trailer } else { Data(size) };
                    }
                    Ok(Status::Partial) => return Ok(None),
                    Err(_) => return Err(ParseError::invalid_body("invalid chunk size line")),
                },

                Data(remaining) => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    #[allow(clippy::cast_possible_truncation, reason = "bounded by src.len()")]
                    let len = remaining.min(src.len() as u64) as usize;
                    let bytes = src.split_to(len).freeze();
                    let left = remaining - len as u64;
                    self.state = if left == 0 { DataEnd } else { Data(left) };
                    return Ok(Some(PayloadItem::Chunk(bytes)));
                }

                DataEnd => {
                    if src.len() < CRLF.len() {
                        return Ok(None);
                    }
                    if &src[..CRLF.len()] != CRLF {
                        return Err(ParseError::invalid_body("chunk data not followed by CRLF"));
                    }
                    src.advance(CRLF.len());
                    self.state = Size;
                }

                Trailer => {
                    let Some(line_end) = src.windows(CRLF.len()).position(|window| window == CRLF) else {
                        return Ok(None);
                    };
                    src.advance(line_end + CRLF.len());
                    if line_end == 0 {
                        self.state = End;
                    }
                }

                End => {
                    trace!("finished reading chunked data");
                    return Ok(Some(PayloadItem::Eof));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => Err(ParseError::invalid_body("connection closed inside chunked body")),
        }
    }
}
