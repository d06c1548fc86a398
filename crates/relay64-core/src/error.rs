use std::path::PathBuf;
use thiserror::Error;

/// Process-level errors: startup, configuration and listener setup.
///
/// Per-connection failures never become a `RelayError`; they are
/// rejections local to the connection that produced them.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("config error: {0}")]
    Config(String),

    #[error("IPv6 is disabled on this host ({})", .0.display())]
    Ipv6Disabled(PathBuf),

    #[error("no listener could be bound")]
    NoListeners,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;
