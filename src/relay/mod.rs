//! Per-request orchestration: decode, cache arbitration, execution, rendering.
//!
//! [`Relay::handle`] is the single inbound entry point. The flow for a POST
//! body is: decode the envelope, look the raw bytes up in the cache, and on a
//! miss validate the URL and enter single-flight arbitration — the winner
//! executes the outbound call and publishes, everyone else for the same
//! fingerprint awaits that one outcome. Client-side rejections (bad JSON,
//! bad URL, wrong method) never touch the cache.

pub mod envelope;
pub mod summary;

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{Flight, FlightOutcome, SummaryCache};
use crate::client::UpstreamClient;
use crate::http::{Method, Request, Response, StatusCode, is_token};

use self::envelope::RequestEnvelope;
use self::summary::ResponseSummary;

/// Failures while processing one relayed request.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid envelope: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid target URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid method: {0:?}")]
    InvalidMethod(String),

    /// The outbound call failed; carries the rendered client error so
    /// single-flight waiters fail with the same words as the claimant.
    #[error("upstream failure: {0}")]
    Upstream(String),
}

impl RelayError {
    fn status(&self) -> StatusCode {
        match self {
            RelayError::Decode(_) | RelayError::InvalidUrl(_) | RelayError::InvalidMethod(_) => {
                StatusCode::BadRequest
            }
            RelayError::Upstream(_) => StatusCode::BadGateway,
        }
    }
}

/// Plain-text bodies for rejected requests.
fn error_text(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BadRequest => "Bad request",
        StatusCode::MethodNotAllowed => "Method not allowed",
        StatusCode::BadGateway => "Bad gateway",
        _ => "Internal server error",
    }
}

/// The relay service: a summary cache plus an outbound client.
///
/// Shared across connection tasks behind an [`Arc`]; all methods take
/// `&self`.
pub struct Relay {
    cache: SummaryCache,
    client: UpstreamClient,
}

impl Relay {
    /// Creates a relay with an empty cache.
    pub fn new(client: UpstreamClient) -> Self {
        Self {
            cache: SummaryCache::new(),
            client,
        }
    }

    /// Handles one inbound request end to end. Always produces a response;
    /// failures render as the documented status codes with terse text bodies.
    pub async fn handle(&self, request: Request) -> Response {
        if !matches!(request.method(), Method::Post) {
            return Response::new(StatusCode::MethodNotAllowed)
                .body(error_text(StatusCode::MethodNotAllowed));
        }

        let started = Instant::now();
        // The raw body bytes are the cache fingerprint.
        let fingerprint = request.body().clone();

        match self.process(fingerprint).await {
            Ok(summary) => match serde_json::to_string(summary.as_ref()) {
                Ok(body) => {
                    info!(
                        id = %summary.id,
                        status = summary.status,
                        elapsed = ?started.elapsed(),
                        "summary served"
                    );
                    Response::new(StatusCode::Ok)
                        .header("Content-Type", "application/json")
                        .body(body)
                }
                Err(error) => {
                    warn!(%error, "summary encoding failed");
                    Response::new(StatusCode::InternalServerError)
                        .body(error_text(StatusCode::InternalServerError))
                }
            },
            Err(error) => {
                let status = error.status();
                debug!(%error, status = status.as_u16(), "request rejected");
                Response::new(status).body(error_text(status))
            }
        }
    }

    /// Resolves a fingerprint to its summary, executing the outbound call if
    /// this request wins the claim for it.
    async fn process(&self, fingerprint: Bytes) -> Result<Arc<ResponseSummary>, RelayError> {
        let envelope = RequestEnvelope::decode(&fingerprint)?;

        // A completed entry needs no URL validation and no claim.
        if let Some(summary) = self.cache.lookup(&fingerprint) {
            debug!(id = %summary.id, "cache hit");
            return Ok(summary);
        }

        let target = Url::parse(&envelope.url)?;
        // The method reaches the outbound request line verbatim, so it must
        // be a bare token.
        if !is_token(&envelope.method) {
            return Err(RelayError::InvalidMethod(envelope.method));
        }

        loop {
            match self.cache.begin(fingerprint.clone()) {
                Flight::Hit(summary) => {
                    debug!(id = %summary.id, "cache hit");
                    return Ok(summary);
                }
                Flight::Claimed(claim) => {
                    return match self
                        .client
                        .execute(&envelope.method, &target, &envelope.headers)
                        .await
                    {
                        Ok(upstream) => {
                            let id = self.cache.allocate_id();
                            let summary = ResponseSummary::from_upstream(id, &upstream);
                            Ok(claim.complete(summary))
                        }
                        Err(error) => {
                            warn!(url = %target, %error, "outbound call failed");
                            let message = error.to_string();
                            claim.abort(&message);
                            Err(RelayError::Upstream(message))
                        }
                    };
                }
                Flight::Pending(mut outcome) => match outcome.recv().await {
                    Ok(FlightOutcome::Completed(summary)) => return Ok(summary),
                    Ok(FlightOutcome::Failed(message)) => {
                        return Err(RelayError::Upstream(message));
                    }
                    // The claimant vanished without settling; arbitrate again.
                    Err(_) => continue,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Upstream stub that serves the canned response to every connection,
    /// counting how many it accepted. A non-zero delay holds each response
    /// back long enough for concurrent callers to pile up on one flight.
    async fn counting_upstream(
        response: &'static [u8],
        delay: Duration,
    ) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        let n = stream.read(&mut chunk).await.unwrap();
                        head.extend_from_slice(&chunk[..n]);
                        if n == 0 || head.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    tokio::time::sleep(delay).await;
                    stream.write_all(response).await.unwrap();
                    let _ = stream.shutdown().await;
                });
            }
        });
        (addr, hits)
    }

    fn inbound(method: &str, body: &str) -> Request {
        let raw = format!(
            "{method} /relay HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let (request, _) = Request::parse(raw.as_bytes()).unwrap();
        request
    }

    /// Splits a rendered response into (status, body text).
    fn render(response: Response) -> (u16, String) {
        let status = response.status().as_u16();
        let text = String::from_utf8(response.into_bytes().to_vec()).unwrap();
        let body = text
            .split_once("\r\n\r\n")
            .map(|(_, b)| b.to_owned())
            .unwrap_or_default();
        (status, body)
    }

    fn relay() -> Relay {
        Relay::new(UpstreamClient::new(None))
    }

    const CANNED_OK: &[u8] =
        b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello";

    #[tokio::test]
    async fn relays_and_summarizes() {
        let (addr, hits) = counting_upstream(CANNED_OK, Duration::ZERO).await;
        let relay = relay();
        let body = format!(r#"{{"method":"GET","url":"http://{addr}/data"}}"#);

        let (status, text) = render(relay.handle(inbound("POST", &body)).await);
        assert_eq!(status, 200);
        let summary: ResponseSummary = serde_json::from_str(&text).unwrap();
        assert_eq!(summary.id, "1");
        assert_eq!(summary.status, 200);
        assert_eq!(summary.length, 5);
        assert_eq!(
            summary.headers.get("Content-Type").map(String::as_str),
            Some("text/plain")
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn identical_body_is_served_from_cache() {
        let (addr, hits) = counting_upstream(CANNED_OK, Duration::ZERO).await;
        let relay = relay();
        let body = format!(r#"{{"method":"GET","url":"http://{addr}/data"}}"#);

        let (_, first) = render(relay.handle(inbound("POST", &body)).await);
        let (status, second) = render(relay.handle(inbound("POST", &body)).await);
        assert_eq!(status, 200);
        assert_eq!(first, second);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_bodies_get_distinct_ids() {
        let (addr, hits) = counting_upstream(CANNED_OK, Duration::ZERO).await;
        let relay = relay();
        let first_body = format!(r#"{{"method":"GET","url":"http://{addr}/a"}}"#);
        let second_body = format!(r#"{{"method":"GET","url":"http://{addr}/b"}}"#);

        let (_, first) = render(relay.handle(inbound("POST", &first_body)).await);
        let (_, second) = render(relay.handle(inbound("POST", &second_body)).await);
        let first: ResponseSummary = serde_json::from_str(&first).unwrap();
        let second: ResponseSummary = serde_json::from_str(&second).unwrap();
        assert_eq!(first.id, "1");
        assert_eq!(second.id, "2");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn equivalent_json_with_different_bytes_misses() {
        // Fingerprinting is byte-exact: an extra space is a different key.
        let (addr, hits) = counting_upstream(CANNED_OK, Duration::ZERO).await;
        let relay = relay();
        let compact = format!(r#"{{"method":"GET","url":"http://{addr}/a"}}"#);
        let spaced = format!(r#"{{"method":"GET", "url":"http://{addr}/a"}}"#);

        let (_, first) = render(relay.handle(inbound("POST", &compact)).await);
        let (_, second) = render(relay.handle(inbound("POST", &spaced)).await);
        let first: ResponseSummary = serde_json::from_str(&first).unwrap();
        let second: ResponseSummary = serde_json::from_str(&second).unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_post_is_method_not_allowed() {
        let relay = relay();
        let (status, text) = render(relay.handle(inbound("GET", "{}")).await);
        assert_eq!(status, 405);
        assert_eq!(text, "Method not allowed");
    }

    #[tokio::test]
    async fn malformed_envelope_is_bad_request() {
        let relay = relay();
        for body in ["{not json", "", r#"{"method":"GET"}"#, r#"{"url":7}"#] {
            let (status, text) = render(relay.handle(inbound("POST", body)).await);
            assert_eq!(status, 400, "body: {body}");
            assert_eq!(text, "Bad request");
        }
    }

    #[tokio::test]
    async fn invalid_url_is_bad_request() {
        let relay = relay();
        let (status, text) =
            render(relay.handle(inbound("POST", r#"{"method":"GET","url":"not-a-url"}"#)).await);
        assert_eq!(status, 400);
        assert_eq!(text, "Bad request");
    }

    #[tokio::test]
    async fn unserializable_method_is_bad_request() {
        let (addr, hits) = counting_upstream(CANNED_OK, Duration::ZERO).await;
        let relay = relay();
        for method in ["GE T", r"GET\r\nX-Smuggled: yes"] {
            let body = format!(r#"{{"method":"{method}","url":"http://{addr}/"}}"#);
            let (status, text) = render(relay.handle(inbound("POST", &body)).await);
            assert_eq!(status, 400, "method: {method:?}");
            assert_eq!(text, "Bad request");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn header_injection_is_rejected_before_dialing() {
        let (addr, hits) = counting_upstream(CANNED_OK, Duration::ZERO).await;
        let relay = relay();
        let body = format!(
            r#"{{"method":"GET","url":"http://{addr}/","headers":{{"X-A":"1\r\nX-Smuggled: yes\r\nHost: evil.example"}}}}"#
        );

        let (status, text) = render(relay.handle(inbound("POST", &body)).await);
        assert_eq!(status, 502);
        assert_eq!(text, "Bad gateway");
        assert_eq!(hits.load(Ordering::SeqCst), 0, "nothing may reach the upstream");
    }

    #[tokio::test]
    async fn unknown_envelope_fields_are_tolerated() {
        let (addr, _) = counting_upstream(CANNED_OK, Duration::ZERO).await;
        let relay = relay();
        let body = format!(r#"{{"method":"GET","url":"http://{addr}/","body":"extra"}}"#);

        let (status, _) = render(relay.handle(inbound("POST", &body)).await);
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn upstream_failure_is_bad_gateway_and_never_cached() {
        // Reserve a port, then kill the listener so the first attempt is refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let relay = relay();
        let body = format!(r#"{{"method":"GET","url":"http://{addr}/"}}"#);

        let (status, text) = render(relay.handle(inbound("POST", &body)).await);
        assert_eq!(status, 502);
        assert_eq!(text, "Bad gateway");

        // Revive the upstream on the same port; the identical body must
        // trigger a fresh outbound call, not a cached failure.
        let listener = TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut chunk = [0u8; 1024];
            let mut head = Vec::new();
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                head.extend_from_slice(&chunk[..n]);
                if n == 0 || head.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            stream.write_all(CANNED_OK).await.unwrap();
            let _ = stream.shutdown().await;
        });

        let (status, text) = render(relay.handle(inbound("POST", &body)).await);
        assert_eq!(status, 200);
        let summary: ResponseSummary = serde_json::from_str(&text).unwrap();
        assert_eq!(summary.status, 200);
    }

    #[tokio::test]
    async fn concurrent_identical_bodies_execute_once() {
        let (addr, hits) = counting_upstream(CANNED_OK, Duration::from_millis(100)).await;
        let relay = Arc::new(relay());
        let body = format!(r#"{{"method":"GET","url":"http://{addr}/slow"}}"#);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let relay = Arc::clone(&relay);
            let body = body.clone();
            tasks.push(tokio::spawn(async move {
                render(relay.handle(inbound("POST", &body)).await)
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            let (status, text) = task.await.unwrap();
            assert_eq!(status, 200);
            let summary: ResponseSummary = serde_json::from_str(&text).unwrap();
            ids.push(summary.id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1, "all callers must share one summary");
        assert_eq!(hits.load(Ordering::SeqCst), 1, "exactly one outbound call");
    }
}
