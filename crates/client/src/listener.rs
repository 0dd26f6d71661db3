//! Transaction callbacks.

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode, Uri, Version};

use crate::protocol::{Response, ResponseHeader};
use crate::transaction::Progress;

/// Receives a transaction's lifecycle.
///
/// Every method runs on the transaction's home thread, never re-entrantly, and with no
/// internal lock held, so implementations may call back into the transaction (cancel
/// it, or drop it). All methods default to doing nothing.
///
/// A successful transaction reports, in order:
///
/// ```text
/// on_connecting  on_connected  [on_send_progress ...]  on_request_sent
/// on_response_status  [on_receive_progress | on_response_body_bytes ...]
/// on_complete  on_closed
/// ```
///
/// with `on_redirect` followed by a fresh `on_connecting` for every redirect that is
/// followed. Exactly one of `on_closed`, `on_timeout`, `on_cancel` or `on_error`
/// ends every initiated transaction, unless the transaction is dropped first.
pub trait Listener: Send {
    fn on_connecting(&mut self) {}

    fn on_connected(&mut self) {}

    fn on_redirect(&mut self, _new_url: &Uri) {}

    fn on_request_sent(&mut self) {}

    fn on_response_status(&mut self, _head: &ResponseHeader) {}

    fn on_response_body_bytes(&mut self, _bytes: &[u8]) {}

    fn on_send_progress(&mut self, _progress: Progress) {}

    fn on_receive_progress(&mut self, _progress: Progress) {}

    /// The whole response body has been delivered.
    fn on_complete(&mut self) {}

    /// Delivered asynchronously after `on_complete`, once the connection is released.
    fn on_closed(&mut self) {}

    fn on_timeout(&mut self) {}

    fn on_cancel(&mut self) {}

    fn on_error(&mut self, _message: &str) {}
}

/// Accumulates status, headers and body into a [`Response`].
///
/// A response head that arrives after a previous one (which cannot happen for a single
/// transaction, redirects are consumed before any head is reported) starts over.
#[derive(Debug)]
pub struct ResponseCollector {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: BytesMut,
}

impl Default for ResponseCollector {
    fn default() -> Self {
        Self { status: StatusCode::OK, version: Version::HTTP_11, headers: HeaderMap::new(), body: BytesMut::new() }
    }
}

impl ResponseCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// A copy of what was collected so far.
    pub fn response(&self) -> Response {
        assemble(self.status, self.version, self.headers.clone(), Bytes::copy_from_slice(&self.body))
    }

    pub fn into_response(self) -> Response {
        assemble(self.status, self.version, self.headers, self.body.freeze())
    }
}

fn assemble(status: StatusCode, version: Version, headers: HeaderMap, body: Bytes) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.version_mut() = version;
    *response.headers_mut() = headers;
    response
}

impl Listener for ResponseCollector {
    fn on_response_status(&mut self, head: &ResponseHeader) {
        self.status = head.status();
        self.version = head.version();
        self.headers = head.headers().clone();
        self.body.clear();
    }

    fn on_response_body_bytes(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONTENT_LENGTH;

    #[test]
    fn test_collects_head_and_body() {
        let mut head = http::Response::new(());
        *head.status_mut() = StatusCode::NOT_FOUND;
        head.headers_mut().insert(CONTENT_LENGTH, "4".parse().unwrap());

        let mut collector = ResponseCollector::new();
        collector.on_response_body_bytes(b"stale");
        collector.on_response_status(&ResponseHeader::from(head));
        collector.on_response_body_bytes(b"no");
        collector.on_response_body_bytes(b"pe");

        assert_eq!(collector.body(), b"nope");
        let response = collector.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[CONTENT_LENGTH], "4");
        assert_eq!(response.body().as_ref(), b"nope");
    }
}
