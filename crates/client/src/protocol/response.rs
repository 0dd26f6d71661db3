//! Response types.
//!
//! [`ResponseHeader`] is what the backend hands the transaction once a status line
//! and header block have been read. [`Response`] is the accumulated result a
//! [`ResponseCollector`](crate::ResponseCollector) builds from the callbacks.

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version, header};

/// An accumulated response: status, headers and the complete body.
pub type Response = http::Response<Bytes>;

#[derive(Debug, Clone)]
pub struct ResponseHeader {
    inner: http::Response<()>,
}

impl ResponseHeader {
    pub fn into_inner(self) -> http::Response<()> {
        self.inner
    }

    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// The `Location` header of a redirect, if present and readable.
    pub fn location(&self) -> Option<&str> {
        self.headers().get(header::LOCATION).and_then(|value| value.to_str().ok())
    }

    /// Whether the status code alone rules out a payload.
    pub fn is_bodiless_status(&self) -> bool {
        let status = self.status();
        status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
    }
}

impl From<http::Response<()>> for ResponseHeader {
    #[inline]
    fn from(inner: http::Response<()>) -> Self {
        Self { inner }
    }
}
