//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to an async
//! handler, one spawned task per connection. Persistent connections
//! (keep-alive) are supported, so a caller may submit several relay envelopes
//! over one socket; requests on a connection are handled sequentially.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete inbound request we will buffer (1 MiB).
///
/// The only legitimate payload here is a small JSON envelope; anything near
/// this cap is either abuse or a confused client.
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The relayd inbound HTTP server.
///
/// Binds a TCP address and hands every parsed HTTP/1.1 request to the
/// supplied handler. The handler seam is a plain async function so the
/// relay, or a scripted stand-in for tests, plugs in the same way.
///
/// # Examples
///
/// ```rust,no_run
/// use relayd::server::Server;
/// use relayd::http::{Request, Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(|_req: Request| async {
///         Response::new(StatusCode::Ok)
///     }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    ///
    /// Useful when binding port `0` and needing the actual port afterwards.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// The handler is wrapped in an [`Arc`] and shared across all spawned
    /// tasks, so it must be `Send + Sync + 'static`. Runs until the process
    /// terminates or the listener itself fails.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener fails unrecoverably.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);
        info!(address = %self.local_addr, "relayd listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, peer_addr, handler).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Serves a single TCP connection for its lifetime.
///
/// Every complete request already buffered is parsed and answered before the
/// next socket read, so a client that pipelines envelopes is served in order
/// rather than stalled. The body is awaited in full (per `Content-Length`)
/// before dispatch, since the handler fingerprints the complete body.
async fn serve_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        // Drain buffered requests first.
        while !buf.is_empty() {
            let (request, body_offset) = match Request::parse(&buf) {
                Ok(pair) => pair,
                Err(RequestError::Incomplete) => break,
                Err(e) => {
                    warn!(peer = %peer_addr, error = %e, "unparsable request — sending 400");
                    let response = Response::new(StatusCode::BadRequest)
                        .body("Bad request")
                        .keep_alive(false);
                    stream.write_all(&response.into_bytes()).await?;
                    return Ok(());
                }
            };

            // Wait for the full body if Content-Length says more is coming.
            // Saturating: an absurd declared length must not wrap this sum,
            // it just keeps the request incomplete until the cap trips.
            let content_length = request.content_length().unwrap_or(0);
            let total_needed = body_offset.saturating_add(content_length);
            if buf.len() < total_needed {
                break;
            }

            let keep_alive = request.is_keep_alive();

            debug!(
                peer = %peer_addr,
                method = %request.method(),
                target = %request.target(),
                "dispatching request"
            );

            // The Connection header mirrors the connection decision below.
            let response = handler(request).await.keep_alive(keep_alive);
            stream.write_all(&response.into_bytes()).await?;
            stream.flush().await?;

            // Drop the consumed request bytes from the buffer.
            let _ = buf.split_to(total_needed);

            if !keep_alive {
                debug!(peer = %peer_addr, "Connection: close — shutting down");
                return Ok(());
            }
        }

        // Only incomplete data remains; cap how much of it we will hold.
        if buf.len() > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request too large — sending 413");
            let response = Response::new(StatusCode::PayloadTooLarge)
                .body("Payload too large")
                .keep_alive(false);
            stream.write_all(&response.into_bytes()).await?;
            return Ok(());
        }

        let bytes_read = stream.read_buf(&mut buf).await?;
        if bytes_read == 0 {
            debug!(peer = %peer_addr, "connection closed by peer");
            return Ok(());
        }
    }
}
