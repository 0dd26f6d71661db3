//! The head of an outgoing request.
//!
//! [`RequestHeader`] wraps `http::Request<()>`: everything the backend needs to put a
//! request line and header block on the wire, with the body kept aside by the
//! transaction and streamed separately.

use http::request::Parts;
use http::{HeaderMap, Method, Request, Uri, Version};

#[derive(Debug, Clone)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl AsMut<Request<()>> for RequestHeader {
    fn as_mut(&mut self) -> &mut Request<()> {
        &mut self.inner
    }
}

impl RequestHeader {
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    /// The origin-form target written on the request line.
    pub fn request_target(&self) -> &str {
        self.uri().path_and_query().map_or("/", |path_and_query| path_and_query.as_str())
    }

    /// Whether the response to this request never carries a payload.
    pub fn expects_empty_response(&self) -> bool {
        self.method() == Method::HEAD
    }
}

impl From<Parts> for RequestHeader {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_target() {
        let header: RequestHeader =
            Request::get("http://127.0.0.1:8080/index/?a=1&b=2").body(()).unwrap().into();
        assert_eq!(header.request_target(), "/index/?a=1&b=2");

        let header: RequestHeader = Request::get("http://127.0.0.1:8080").body(()).unwrap().into();
        assert_eq!(header.request_target(), "/");
        assert!(!header.expects_empty_response());

        let header: RequestHeader = Request::head("http://example.com/x").body(()).unwrap().into();
        assert!(header.expects_empty_response());
    }
}
