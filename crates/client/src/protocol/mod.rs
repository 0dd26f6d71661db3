//! Core HTTP message types used by transactions and backends.
//!
//! - **Message framing** ([`message`]): [`Message`], [`PayloadItem`], [`PayloadSize`]
//! - **Requests** ([`request`]): [`RequestHeader`], the head handed to a backend
//! - **Responses** ([`response`]): [`ResponseHeader`] and the accumulated [`Response`]
//! - **Bodies** ([`body`]): [`Body`], buffer or file backed
//! - **Errors** ([`error`]): [`ClientError`], [`ParseError`], [`SendError`]
//!
//! The value types themselves come from the `http` crate; this module only adds
//! what the transaction engine needs around them.

mod message;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::RequestHeader;

mod response;
pub use response::Response;
pub use response::ResponseHeader;

mod body;
pub use body::Body;
pub(crate) use body::Upload;

mod error;
pub use error::ClientError;
pub use error::ParseError;
pub use error::SendError;
