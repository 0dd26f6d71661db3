//! Decoder for the status line and header block of a response.
//!
//! Parsing is done by `httparse` into a fixed array of header slots, after which the
//! head is converted into an `http::Response<()>` and the payload framing is derived
//! from the request method, the status code and the `Transfer-Encoding` /
//! `Content-Length` headers.
//!
//! # Limits
//!
//! - Maximum number of headers: 64
//! - Maximum header size: 8KB
//! - HTTP/1.0 and HTTP/1.1 only

use bytes::{Buf, BytesMut};
use http::{HeaderName, HeaderValue, StatusCode, Version, header};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::utils::ensure;
use crate::protocol::{ParseError, PayloadSize, ResponseHeader};

/// Maximum number of headers allowed in a response
const MAX_HEADER_NUM: usize = 64;

/// Maximum size in bytes allowed for the entire header section
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Decodes a [`ResponseHeader`] and the [`PayloadSize`] that follows it.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderDecoder {
    /// The response answers a HEAD request and carries no payload whatever its headers say.
    head_request: bool,
}

impl HeaderDecoder {
    /// Creates a header decoder.
    ///
    /// # Arguments
    /// * `head_request` - whether the response answers a HEAD request, in which case
    ///   its framing headers describe a body that is never sent
    pub fn new(head_request: bool) -> Self {
        Self { head_request }
    }
}

impl Decoder for HeaderDecoder {
    type Item = (ResponseHeader, PayloadSize);
    type Error = ParseError;

    /// Parses the status line and headers once they are fully buffered.
    ///
    /// # Returns
    /// * `Ok(Some((header, payload_size)))` with the parsed head consumed from `src`
    /// * `Ok(None)` when the head is incomplete
    /// * `Err(ParseError)` when the head is malformed or exceeds the size limits
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut resp = httparse::Response::new(&mut headers);

        let parsed = resp.parse(src).map_err(|e| match e {
            Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
            e => ParseError::invalid_header(e.to_string()),
        })?;

        let body_offset = match parsed {
            Status::Complete(body_offset) => body_offset,
            Status::Partial => {
                ensure!(src.len() <= MAX_HEADER_BYTES, ParseError::too_large_header(src.len(), MAX_HEADER_BYTES));
                return Ok(None);
            }
        };

        trace!(header_size = body_offset, "parsed response head");
        ensure!(body_offset <= MAX_HEADER_BYTES, ParseError::too_large_header(body_offset, MAX_HEADER_BYTES));

        let version = match resp.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            v => return Err(ParseError::InvalidVersion(v)),
        };
        let status = resp.code.and_then(|code| StatusCode::from_u16(code).ok()).ok_or(ParseError::InvalidStatus)?;

        let mut head = http::Response::new(());
        *head.status_mut() = status;
        *head.version_mut() = version;

        let header_map = head.headers_mut();
        header_map.reserve(resp.headers.len());
        for h in resp.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(ParseError::invalid_header)?;
            let value = HeaderValue::from_bytes(h.value).map_err(ParseError::invalid_header)?;
            header_map.append(name, value);
        }

        src.advance(body_offset);

        let header = ResponseHeader::from(head);
        let payload_size = self.payload_size(&header)?;
        Ok(Some((header, payload_size)))
    }
}

impl HeaderDecoder {
    fn payload_size(self, header: &ResponseHeader) -> Result<PayloadSize, ParseError> {
        if self.head_request || header.is_bodiless_status() {
            return Ok(PayloadSize::Empty);
        }

        // refer: https://www.rfc-editor.org/rfc/rfc9112.html#name-message-body-length
        let te_header = header.headers().get(header::TRANSFER_ENCODING);
        let cl_header = header.headers().get(header::CONTENT_LENGTH);

        match (te_header, cl_header) {
            (Some(te_value), _) if is_chunked(te_value) => Ok(PayloadSize::Chunked),
            (Some(_), _) => Ok(PayloadSize::UntilClose),
            (None, Some(cl_value)) => {
                let cl_str = cl_value.to_str().map_err(|_| ParseError::invalid_content_length("value can't to_str"))?;
                let length = cl_str
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ParseError::invalid_content_length(format!("value {cl_str} is not u64")))?;
                if length == 0 { Ok(PayloadSize::Empty) } else { Ok(PayloadSize::Length(length)) }
            }
            (None, None) => Ok(PayloadSize::UntilClose),
        }
    }
}

fn is_chunked(header_value: &HeaderValue) -> bool {
    const CHUNKED: &[u8] = b"chunked";
    header_value.as_bytes().rsplit(|b| *b == b',').next().is_some_and(|last| last.trim_ascii() == CHUNKED)
}
