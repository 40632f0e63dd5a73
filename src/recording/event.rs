// src/recording/event.rs
//! Capture events: snapshots of one intercepted request or response

use crate::recording::tee::BodyReceiver;
use chrono::{DateTime, Utc};
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};

/// Per-exchange metadata supplied by the proxying side
#[derive(Debug, Clone, Default)]
pub struct ExchangeContext {
    /// Correlates the request and response of one exchange
    pub session: i64,

    /// Error reported by the proxy for this exchange
    pub error: Option<String>,

    /// Client address for requests, upstream address for responses
    pub remote_addr: Option<String>,
}

impl ExchangeContext {
    pub fn new(session: i64) -> Self {
        Self {
            session,
            ..Default::default()
        }
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Request line and headers, detached from the live request
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn from_request<B>(req: &Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
        }
    }

    /// Stand-in used when the proxy hands over no request at all
    pub fn placeholder() -> Self {
        Self {
            method: Method::GET,
            uri: Uri::default(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }
}

/// Status line and headers, detached from the live response
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,

    /// URI of the request this response answers
    pub request_uri: Uri,
}

impl ResponseHead {
    pub fn from_response<B>(resp: &Response<B>, request_uri: Uri) -> Self {
        Self {
            status: resp.status(),
            version: resp.version(),
            headers: resp.headers().clone(),
            request_uri,
        }
    }
}

/// The captured half of an exchange
#[derive(Debug, Clone)]
pub enum CapturedMessage {
    Request(RequestHead),
    Response(ResponseHead),
}

impl CapturedMessage {
    /// WARC record type
    pub fn record_type(&self) -> &'static str {
        match self {
            CapturedMessage::Request(_) => "request",
            CapturedMessage::Response(_) => "response",
        }
    }

    pub fn target_uri(&self) -> &Uri {
        match self {
            CapturedMessage::Request(head) => &head.uri,
            CapturedMessage::Response(head) => &head.request_uri,
        }
    }
}

/// One intercepted request or response awaiting archival
#[derive(Debug)]
pub struct CaptureEvent {
    pub message: CapturedMessage,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub session: i64,

    /// Read side of the response body tee
    pub body: Option<BodyReceiver>,

    pub remote_addr: Option<String>,
}

impl CaptureEvent {
    pub fn request(head: RequestHead, ctx: ExchangeContext) -> Self {
        Self {
            message: CapturedMessage::Request(head),
            error: ctx.error,
            timestamp: Utc::now(),
            session: ctx.session,
            body: None,
            remote_addr: ctx.remote_addr,
        }
    }

    pub fn response(head: ResponseHead, body: Option<BodyReceiver>, ctx: ExchangeContext) -> Self {
        Self {
            message: CapturedMessage::Response(head),
            error: ctx.error,
            timestamp: Utc::now(),
            session: ctx.session,
            body,
            remote_addr: ctx.remote_addr,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(self.message, CapturedMessage::Response(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_follows_message() {
        let req = Request::get("http://example.test/a").body(()).unwrap();
        let event = CaptureEvent::request(RequestHead::from_request(&req), ExchangeContext::new(1));
        assert_eq!(event.message.record_type(), "request");
        assert!(!event.is_response());

        let resp = Response::builder().status(200).body(()).unwrap();
        let head = ResponseHead::from_response(&resp, req.uri().clone());
        let event = CaptureEvent::response(head, None, ExchangeContext::new(1));
        assert_eq!(event.message.record_type(), "response");
        assert_eq!(event.message.target_uri(), "http://example.test/a");
    }

    #[test]
    fn test_placeholder_request() {
        let head = RequestHead::placeholder();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.uri, "/");
    }
}
