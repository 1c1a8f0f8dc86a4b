use std::net::SocketAddr;

use thiserror::Error;

/// Failures that end a single client connection.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Malformed request: {0}")]
    Parse(String),

    #[error("Request headers exceed {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("Timed out waiting for the client request")]
    ReadTimeout,

    #[error("Could not resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("Could not connect to {addr}: {reason}")]
    Connect { addr: SocketAddr, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Disconnects that are part of normal proxy traffic and not worth logging.
pub fn is_expected_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}
