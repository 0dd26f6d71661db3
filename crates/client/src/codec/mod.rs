//! HTTP/1.1 wire codec used by the bundled tokio backend.
//!
//! The transaction state machine never touches bytes on the wire; a backend does.
//! The tokio backend frames its socket with these `tokio_util::codec` types:
//!
//! - [`RequestEncoder`]: writes a [`RequestHeader`](crate::protocol::RequestHeader)
//!   and then `Content-Length` framed body chunks
//! - [`ResponseDecoder`]: reads a status line and headers, then the payload framed by
//!   `Content-Length`, chunked transfer encoding, or connection close
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use micro_http_client::codec::ResponseDecoder;
//! use micro_http_client::protocol::Message;
//! use tokio_util::codec::Decoder;
//!
//! let mut decoder = ResponseDecoder::new(false);
//! let mut buffer = BytesMut::from("HTTP/1.1 204 No Content\r\n\r\n");
//! let message = decoder.decode(&mut buffer).unwrap().unwrap();
//! assert!(message.is_header());
//! ```

mod body;
mod header;
mod request_encoder;
mod response_decoder;

pub use request_encoder::RequestEncoder;
pub use response_decoder::ResponseDecoder;
