//! Error types for Sealink.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed client request: {0}")]
    Parse(String),

    #[error("malformed wire frame: {0}")]
    Frame(String),

    #[error("offshore link unavailable: {0}")]
    Uplink(String),

    #[error("target fetch failed: {0}")]
    Fetch(String),

    #[error("tunnel rejected by offshore: status {0}")]
    TunnelRejected(u16),

    #[error("timed out waiting for tunnel acknowledgment")]
    TunnelTimeout,
}
