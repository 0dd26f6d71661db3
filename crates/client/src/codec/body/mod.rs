//! Payload codecs.
//!
//! Responses may be framed by `Content-Length`, by chunked transfer encoding, or by
//! the server closing the connection; [`PayloadDecoder`] picks the matching
//! strategy from a [`PayloadSize`](crate::protocol::PayloadSize). Request bodies are
//! always sent with a known length through [`LengthEncoder`].

mod chunked_decoder;
mod close_decoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;

pub use length_encoder::LengthEncoder;
pub use payload_decoder::PayloadDecoder;
