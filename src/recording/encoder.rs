// src/recording/encoder.rs
//! WARC record encoder
//!
//! Turns one [`CaptureEvent`] into a complete `WARC/1.0` record. The record
//! block is the HTTP head (start line and headers) followed by whatever part
//! of the body the tee delivered.

use crate::recording::event::{CaptureEvent, CapturedMessage, RequestHead, ResponseHead};
use crate::recording::tee::Truncation;
use crate::utils::config::ArchiverConfig;
use crate::utils::errors::{ArchiveError, Result};
use chrono::{SecondsFormat, Utc};
use hyper::header::{HeaderMap, HOST};
use hyper::StatusCode;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const CRLF: &[u8] = b"\r\n";

/// Encodes capture events into WARC records
#[derive(Debug, Clone)]
pub struct RecordEncoder {
    body_idle_timeout: Duration,
    max_body_bytes: usize,
}

impl RecordEncoder {
    pub fn new(body_idle_timeout: Duration, max_body_bytes: usize) -> Self {
        Self {
            body_idle_timeout,
            max_body_bytes,
        }
    }

    pub fn from_config(config: &ArchiverConfig) -> Self {
        Self::new(config.body_idle_timeout(), config.max_body_bytes)
    }

    /// Encode `event` into one record.
    ///
    /// Returns `Ok(None)` for events that must not be archived (304
    /// responses); their body receiver is released immediately.
    pub async fn encode(&self, event: CaptureEvent) -> Result<Option<Vec<u8>>> {
        if let CapturedMessage::Response(head) = &event.message {
            if head.status == StatusCode::NOT_MODIFIED {
                debug!(session = event.session, "Skipping 304 response");
                return Ok(None);
            }
        }

        if let Some(error) = &event.error {
            warn!(session = event.session, "Archiving exchange with proxy error: {}", error);
        }

        let mut block = Vec::with_capacity(512);
        let dumped = match &event.message {
            CapturedMessage::Request(head) => dump_request_head(&mut block, head),
            CapturedMessage::Response(head) => dump_response_head(&mut block, head),
        };
        dumped.map_err(|e| ArchiveError::EncodingFailed(format!("Head dump error: {}", e)))?;

        let mut truncated = None;
        if let Some(body) = event.body {
            let drained = body
                .drain(self.body_idle_timeout, self.max_body_bytes)
                .await;
            if let Some(reason) = drained.truncated {
                debug!(
                    session = event.session,
                    "Body archived truncated ({}) after {} bytes",
                    reason.as_str(),
                    drained.bytes.len()
                );
            }
            truncated = drained.truncated;
            block.extend_from_slice(&drained.bytes);
        }

        let ip_address = match &event.message {
            CapturedMessage::Response(_) => event
                .remote_addr
                .as_deref()
                .and_then(|addr| addr.parse::<SocketAddr>().ok()),
            CapturedMessage::Request(_) => None,
        };

        let record = write_record(&event.message, ip_address, truncated, &block)
            .map_err(|e| ArchiveError::EncodingFailed(format!("Record write error: {}", e)))?;

        debug!(
            session = event.session,
            record_type = event.message.record_type(),
            "Encoded {} byte record captured at {}",
            record.len(),
            event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
        );

        Ok(Some(record))
    }
}

fn write_record(
    message: &CapturedMessage,
    ip_address: Option<SocketAddr>,
    truncated: Option<Truncation>,
    block: &[u8],
) -> io::Result<Vec<u8>> {
    let mut record = Vec::with_capacity(block.len() + 512);
    let record_type = message.record_type();

    record.write_all(b"WARC/1.0\r\n")?;
    write!(record, "WARC-Record-ID: <url:uuid:{}>\r\n", Uuid::new_v4())?;
    write!(record, "WARC-Type: {}\r\n", record_type)?;
    write!(record, "WARC-Target-URI: {}\r\n", message.target_uri())?;
    write!(
        record,
        "Content-Type: application/http; msgtype={}\r\n",
        record_type
    )?;
    write!(
        record,
        "WARC-Date: {}\r\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    )?;
    if let Some(addr) = ip_address {
        write!(record, "WARC-IP-Address: {}\r\n", addr.ip())?;
    }
    if let Some(reason) = truncated {
        write!(record, "WARC-Truncated: {}\r\n", reason.as_str())?;
    }
    write!(record, "Content-Length: {}\r\n", block.len())?;
    record.write_all(CRLF)?;
    record.write_all(block)?;
    record.write_all(b"\r\n\r\n")?;

    Ok(record)
}

/// Dump `METHOD origin-form VERSION` and headers, adding `Host` when the
/// request only carries it in its URI.
fn dump_request_head(out: &mut Vec<u8>, head: &RequestHead) -> io::Result<()> {
    let target = head
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    write!(out, "{} {} {:?}\r\n", head.method, target, head.version)?;
    if !head.headers.contains_key(HOST) {
        if let Some(authority) = head.uri.authority() {
            write!(out, "Host: {}\r\n", authority)?;
        }
    }
    dump_headers(out, &head.headers)
}

fn dump_response_head(out: &mut Vec<u8>, head: &ResponseHead) -> io::Result<()> {
    write!(out, "{:?} {}", head.version, head.status.as_u16())?;
    if let Some(reason) = head.status.canonical_reason() {
        write!(out, " {}", reason)?;
    }
    out.write_all(b"\r\n")?;
    dump_headers(out, &head.headers)
}

fn dump_headers(out: &mut Vec<u8>, headers: &HeaderMap) -> io::Result<()> {
    for (name, value) in headers {
        out.write_all(name.as_str().as_bytes())?;
        out.write_all(b": ")?;
        out.write_all(value.as_bytes())?;
        out.write_all(CRLF)?;
    }
    out.write_all(CRLF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::event::ExchangeContext;
    use crate::recording::tee::tee;
    use bytes::Bytes;
    use http_body_util::{BodyExt, Empty, Full};
    use hyper::{Request, Response};

    fn encoder() -> RecordEncoder {
        RecordEncoder::new(Duration::from_secs(5), 1024)
    }

    fn request_event(uri: &str) -> CaptureEvent {
        let req = Request::get(uri)
            .header("user-agent", "test-agent")
            .body(())
            .unwrap();
        CaptureEvent::request(RequestHead::from_request(&req), ExchangeContext::new(1))
    }

    fn text(record: &[u8]) -> String {
        String::from_utf8_lossy(record).into_owned()
    }

    #[tokio::test]
    async fn test_request_record() {
        let record = encoder()
            .encode(request_event("http://example.test/a?q=1"))
            .await
            .unwrap()
            .unwrap();
        let record = text(&record);

        assert!(record.starts_with("WARC/1.0\r\nWARC-Record-ID: <url:uuid:"));
        assert!(record.contains("WARC-Type: request\r\n"));
        assert!(record.contains("WARC-Target-URI: http://example.test/a?q=1\r\n"));
        assert!(record.contains("Content-Type: application/http; msgtype=request\r\n"));
        assert!(record.contains("GET /a?q=1 HTTP/1.1\r\nHost: example.test\r\nuser-agent: test-agent\r\n\r\n"));
        assert!(!record.contains("WARC-IP-Address"));
        assert!(record.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_response_record_with_body() {
        let resp = Response::builder()
            .status(200)
            .header("content-type", "text/plain")
            .body(Full::new(Bytes::from_static(b"payload")))
            .unwrap();
        let head = ResponseHead::from_response(&resp, "http://example.test/a".parse().unwrap());
        let (body, receiver) = tee(resp.into_body());
        let ctx = ExchangeContext::new(2).with_remote_addr("192.0.2.7:80");
        let event = CaptureEvent::response(head, Some(receiver), ctx);

        let client = body.collect().await.unwrap().to_bytes();
        assert_eq!(&client[..], b"payload");

        let record = text(&encoder().encode(event).await.unwrap().unwrap());
        assert!(record.contains("WARC-Type: response\r\n"));
        assert!(record.contains("WARC-Target-URI: http://example.test/a\r\n"));
        assert!(record.contains("WARC-IP-Address: 192.0.2.7\r\n"));
        assert!(record.contains("HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\n\r\npayload"));
        assert!(!record.contains("WARC-Truncated"));
    }

    #[tokio::test]
    async fn test_content_length_matches_block() {
        let record = encoder()
            .encode(request_event("http://example.test/len"))
            .await
            .unwrap()
            .unwrap();
        let record = text(&record);

        let (headers, rest) = record.split_once("\r\n\r\n").unwrap();
        let length: usize = headers
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(rest.len(), length + 4);
    }

    #[tokio::test]
    async fn test_not_modified_is_suppressed() {
        let resp = Response::builder()
            .status(304)
            .body(Empty::<Bytes>::new())
            .unwrap();
        let head = ResponseHead::from_response(&resp, "http://example.test/a".parse().unwrap());
        let (_body, receiver) = tee(resp.into_body());
        let event = CaptureEvent::response(head, Some(receiver), ExchangeContext::new(3));

        assert!(encoder().encode(event).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_body_is_complete() {
        let resp = Response::builder()
            .status(204)
            .body(Empty::<Bytes>::new())
            .unwrap();
        let head = ResponseHead::from_response(&resp, "http://example.test/e".parse().unwrap());
        let (_body, receiver) = tee(resp.into_body());
        let event = CaptureEvent::response(head, Some(receiver), ExchangeContext::new(4));

        let record = text(&encoder().encode(event).await.unwrap().unwrap());
        assert!(record.contains("HTTP/1.1 204 No Content\r\n"));
        assert!(!record.contains("WARC-Truncated"));
    }

    #[tokio::test]
    async fn test_oversized_body_is_marked() {
        let resp = Response::builder()
            .status(200)
            .body(Full::new(Bytes::from(vec![b'x'; 4096])))
            .unwrap();
        let head = ResponseHead::from_response(&resp, "http://example.test/big".parse().unwrap());
        let (body, receiver) = tee(resp.into_body());
        let event = CaptureEvent::response(head, Some(receiver), ExchangeContext::new(5));

        body.collect().await.unwrap();
        let record = text(&encoder().encode(event).await.unwrap().unwrap());
        assert!(record.contains("WARC-Truncated: length\r\n"));
    }

    #[test]
    fn test_status_line_without_reason_phrase() {
        let resp = Response::builder().status(599).body(()).unwrap();
        let head = ResponseHead::from_response(&resp, "http://example.test/x".parse().unwrap());

        let mut out = Vec::new();
        dump_response_head(&mut out, &head).unwrap();
        assert_eq!(text(&out), "HTTP/1.1 599\r\n\r\n");

        let resp = Response::builder().status(404).body(()).unwrap();
        let head = ResponseHead::from_response(&resp, "http://example.test/x".parse().unwrap());
        out.clear();
        dump_response_head(&mut out, &head).unwrap();
        assert_eq!(text(&out), "HTTP/1.1 404 Not Found\r\n\r\n");
    }
}
