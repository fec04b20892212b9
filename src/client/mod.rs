//! Minimal HTTP/1.1 client for executing relayed requests.
//!
//! One TCP connection per call: the request is serialized with
//! `Connection: close`, the response head is parsed with [`httparse`], and the
//! body is drained to EOF and discarded. Only the head matters — the relay
//! summarizes status, headers, and declared length, never body content.
//!
//! Caller-supplied parts are vetted before the wire: the method and header
//! names must be HTTP tokens and header values single-line, so no envelope
//! string can splice extra header lines into the outbound head. A body that
//! ends before its declared `Content-Length` is an error, not a summary.
//!
//! Timeouts cover the whole exchange (connect, write, read) as a single
//! deadline rather than per-operation timers.

use std::collections::BTreeMap;
use std::io;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};
use url::Url;

use crate::http::{Headers, is_field_value, is_token};

/// Errors from a single outbound exchange.
///
/// Every variant maps to the same inbound outcome (a gateway failure), but
/// the distinctions matter for logs.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("URL has no host")]
    MissingHost,

    #[error("invalid method: {0:?}")]
    InvalidMethod(String),

    #[error("invalid header name: {0:?}")]
    InvalidHeaderName(String),

    #[error("header {name:?} value contains control bytes")]
    InvalidHeaderValue { name: String },

    #[error("connect to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("connection closed before the response head was complete")]
    Truncated,

    #[error("body ended after {read} of {declared} declared bytes")]
    TruncatedBody { declared: i64, read: usize },

    #[error("response head exceeds {max_bytes} bytes")]
    HeadersTooLarge { max_bytes: usize },

    #[error("no response within {after:?}")]
    TimedOut { after: Duration },
}

/// The parts of an upstream response the relay cares about.
#[derive(Debug)]
pub struct UpstreamResponse {
    /// Status code exactly as the upstream sent it, including non-standard values.
    pub status: u16,
    /// All response headers in wire order, duplicates included.
    pub headers: Headers,
    /// Value of the `Content-Length` header, or `-1` when absent or unparsable
    /// (chunked transfer, close-delimited bodies).
    pub content_length: i64,
    /// Bytes actually drained from the body. Logged, never summarized.
    pub body_len: usize,
}

/// HTTP/1.1 client with an optional whole-exchange timeout.
///
/// # Examples
///
/// ```no_run
/// use std::collections::BTreeMap;
/// use std::time::Duration;
/// use relayd::client::UpstreamClient;
/// use url::Url;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let client = UpstreamClient::new(Some(Duration::from_secs(30)));
/// let target = Url::parse("http://example.com/status")?;
/// let response = client.execute("GET", &target, &BTreeMap::new()).await?;
/// println!("upstream said {}", response.status);
/// # Ok(())
/// # }
/// ```
pub struct UpstreamClient {
    timeout: Option<Duration>,
}

impl UpstreamClient {
    /// Maximum number of response headers we parse per exchange.
    const MAX_HEADERS: usize = 64;

    /// Upper bound on the response head (status line plus headers).
    const MAX_HEAD_BYTES: usize = 64 * 1024;

    /// Read chunk size while draining the response body.
    const DRAIN_CHUNK: usize = 8 * 1024;

    /// Creates a client. `None` disables the exchange deadline entirely.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Executes one outbound request and returns the summarized-relevant
    /// parts of the response.
    ///
    /// `method` is written to the request line verbatim. `headers` are the
    /// caller-supplied pairs; transport-owned names (`Host`, `Connection`,
    /// `Content-Length`) are skipped because this client sets its own. The
    /// request carries no body.
    ///
    /// # Errors
    ///
    /// A method or header that cannot be written as a single wire line, or
    /// any failure to connect, write, parse, read the declared body, or
    /// finish within the deadline.
    pub async fn execute(
        &self,
        method: &str,
        target: &Url,
        headers: &BTreeMap<String, String>,
    ) -> Result<UpstreamResponse, ClientError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.exchange(method, target, headers))
                .await
                .map_err(|_| ClientError::TimedOut { after: limit })?,
            None => self.exchange(method, target, headers).await,
        }
    }

    async fn exchange(
        &self,
        method: &str,
        target: &Url,
        headers: &BTreeMap<String, String>,
    ) -> Result<UpstreamResponse, ClientError> {
        if target.scheme() != "http" {
            return Err(ClientError::UnsupportedScheme(target.scheme().to_owned()));
        }
        // Serializing also validates — a head that cannot be written safely
        // is rejected before anything is dialed.
        let head = serialize_request(method, target, headers)?;

        let host = target.host_str().ok_or(ClientError::MissingHost)?;
        let port = target.port_or_known_default().unwrap_or(80);

        // host_str keeps IPv6 brackets, so this parses as a socket address
        // for literals and falls through to DNS for names.
        let authority = format!("{host}:{port}");
        let mut stream =
            TcpStream::connect(&authority)
                .await
                .map_err(|source| ClientError::Connect {
                    addr: authority.clone(),
                    source,
                })?;
        trace!(upstream = %authority, "connected");

        stream.write_all(&head).await?;

        let mut buf = BytesMut::with_capacity(4096);
        let (status, response_headers, body_offset) = read_head(&mut stream, &mut buf).await?;

        let content_length = response_headers
            .get("content-length")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(-1);

        let body_len = drain_body(&mut stream, buf.len() - body_offset).await?;
        if content_length >= 0 && (body_len as u64) < content_length as u64 {
            return Err(ClientError::TruncatedBody {
                declared: content_length,
                read: body_len,
            });
        }
        debug!(
            upstream = %authority,
            status,
            content_length,
            body_len,
            "exchange finished"
        );

        Ok(UpstreamResponse {
            status,
            headers: response_headers,
            content_length,
            body_len,
        })
    }
}

/// Serializes the outbound request head: request line from the URL's path and
/// query, `Host` from the URL, caller headers one per line, then
/// `Connection: close` so EOF delimits the response body.
///
/// The method and header names must be HTTP tokens and header values must be
/// free of control bytes; a CR or LF inside any of them would splice extra
/// header lines into the head. Transport-owned names are skipped before
/// validation, so a hostile value under `Connection` is dropped rather than
/// rejected. The URL contributes nothing unvetted — its parser already
/// strips tabs and newlines and percent-encodes the rest.
fn serialize_request(
    method: &str,
    target: &Url,
    headers: &BTreeMap<String, String>,
) -> Result<BytesMut, ClientError> {
    if !is_token(method) {
        return Err(ClientError::InvalidMethod(method.to_owned()));
    }

    let mut request_target = target.path().to_owned();
    if let Some(query) = target.query() {
        request_target.push('?');
        request_target.push_str(query);
    }

    // Host mirrors the URL authority; default ports were already stripped by
    // the parser, so port() is Some only when it was explicit and non-default.
    let host = target.host_str().unwrap_or_default();
    let host_header = match target.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };

    let mut buf = BytesMut::with_capacity(256 + headers.len() * 64);
    buf.put(format!("{method} {request_target} HTTP/1.1\r\n").as_bytes());
    buf.put(format!("Host: {host_header}\r\n").as_bytes());
    for (name, value) in headers {
        if is_transport_owned(name) {
            continue;
        }
        if !is_token(name) {
            return Err(ClientError::InvalidHeaderName(name.clone()));
        }
        if !is_field_value(value) {
            return Err(ClientError::InvalidHeaderValue { name: name.clone() });
        }
        buf.put(format!("{name}: {value}\r\n").as_bytes());
    }
    buf.put(&b"Connection: close\r\n\r\n"[..]);
    Ok(buf)
}

/// Header names this client owns; caller-supplied values would conflict with
/// the connection handling (no body is ever sent, one exchange per socket).
fn is_transport_owned(name: &str) -> bool {
    name.eq_ignore_ascii_case("host")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("content-length")
}

/// Reads from the stream until the response head parses completely, then
/// returns the status, the headers, and the offset where the body begins
/// within `buf`.
async fn read_head(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Result<(u16, Headers, usize), ClientError> {
    loop {
        let mut slots = [httparse::EMPTY_HEADER; UpstreamClient::MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut slots);
        match parsed.parse(buf)? {
            httparse::Status::Complete(offset) => {
                let status = parsed.code.ok_or(ClientError::Truncated)?;
                let mut headers = Headers::with_capacity(parsed.headers.len());
                for header in parsed.headers.iter() {
                    if let Ok(value) = std::str::from_utf8(header.value) {
                        headers.insert(header.name, value);
                    }
                }
                return Ok((status, headers, offset));
            }
            httparse::Status::Partial => {
                if buf.len() >= UpstreamClient::MAX_HEAD_BYTES {
                    return Err(ClientError::HeadersTooLarge {
                        max_bytes: UpstreamClient::MAX_HEAD_BYTES,
                    });
                }
                let n = stream.read_buf(buf).await?;
                if n == 0 {
                    return Err(ClientError::Truncated);
                }
            }
        }
    }
}

/// Discards the response body, reading fixed-size chunks until EOF, and
/// returns how many bytes were dropped (including `already_buffered` bytes
/// that arrived with the head).
async fn drain_body(stream: &mut TcpStream, already_buffered: usize) -> Result<usize, ClientError> {
    let mut total = already_buffered;
    let mut chunk = [0u8; UpstreamClient::DRAIN_CHUNK];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(total);
        }
        total += n;
    }
}
