use std::fmt;
use std::time::Duration;

use clap::ValueEnum;

/// How the static destination list is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FilterMode {
    /// Only destinations on the list are reachable.
    Allowlist,
    /// Destinations on the list are refused.
    Denylist,
    /// The static list is not consulted.
    Disabled,
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterMode::Allowlist => "ALLOWLIST",
            FilterMode::Denylist => "DENYLIST",
            FilterMode::Disabled => "DISABLED",
        };
        f.write_str(name)
    }
}

/// Settings shared by every connection task, fixed at startup.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Read size for relay buffers.
    pub buffer_size: usize,
    /// Readiness window for the HTTP response relay.
    pub io_timeout: Duration,
    /// Idle window after which a CONNECT tunnel is torn down.
    pub tunnel_idle_timeout: Duration,
    /// Upper bound on establishing a destination connection.
    pub connect_timeout: Duration,
    /// Upper bound on receiving the client's request head.
    pub request_timeout: Duration,
    /// Largest request head accepted from a client.
    pub max_header_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            io_timeout: Duration::from_millis(250),
            tunnel_idle_timeout: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            max_header_size: 64 * 1024,
        }
    }
}
