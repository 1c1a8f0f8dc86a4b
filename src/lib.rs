//! Forward HTTP/HTTPS proxy with destination filtering and a response cache.
//!
//! Every client connection is checked twice before it is forwarded:
//!
//! - `static_filter` - resolved IP allow/deny list loaded at startup
//! - `trust_filter` - per-URL trust score, periodically re-verified by
//!   fetching the page and scanning it for banned phrases (`phrases`,
//!   `verifier`)
//!
//! Plain HTTP responses are kept in `cache` (LRU with a byte budget and a
//! TTL). CONNECT requests are tunnelled opaquely by `forward`; HTTPS is never
//! decrypted.

#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod error;
pub mod forward;
pub mod phrases;
pub mod request;
pub mod server;
pub mod static_filter;
pub mod stats;
pub mod trust_filter;
pub mod verifier;

pub use cache::ResponseCache;
pub use config::{FilterMode, ProxyConfig};
pub use error::{ProxyError, Result};
pub use server::{serve, ProxyState};
pub use static_filter::StaticFilter;
pub use trust_filter::{TrustDecision, TrustFilter};
