//! # relayd
//!
//! A caching HTTP request relay. Callers POST a JSON description of a
//! request (`{"method", "url", "headers"}`); relayd performs it once over a
//! fresh connection and answers with a summary of the upstream response
//! (`{"id", "status", "headers", "length"}`). The raw bytes of the POSTed
//! body are the cache key: byte-identical bodies are served from memory
//! without a second outbound call, and concurrent identical bodies share a
//! single in-flight execution.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use relayd::client::UpstreamClient;
//! use relayd::{Relay, RelayConfig, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RelayConfig::default();
//!     let relay = Arc::new(Relay::new(UpstreamClient::new(config.upstream_timeout)));
//!     let server = Server::bind(&config.bind_addr).await?;
//!     server
//!         .run(move |request| {
//!             let relay = Arc::clone(&relay);
//!             async move { relay.handle(request).await }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod http;
pub mod relay;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::RelayConfig;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use relay::Relay;
pub use server::{Server, ServerError};
