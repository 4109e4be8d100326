//! Error taxonomy shared by every acquisition component

use thiserror::Error;

/// Session-level and API-level failures.
///
/// Per-message parse problems never surface here; they are absorbed by the
/// reader loops (see [`crate::gps::ParseError`]).
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Socket, serial, I2C or device-open failure. The session stays disconnected.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Driver, executable or device node is missing altogether.
    #[error("hardware unavailable: {0}")]
    Unavailable(String),

    /// Another owner holds the resource, or the request contradicts the current mode.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TelemetryError {
    /// Map an open/spawn failure: a missing node or binary is `Unavailable`,
    /// anything else is a plain connect error.
    pub fn from_open(what: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::Unavailable(format!("{}: {}", what, err)),
            _ => Self::Connect(format!("{}: {}", what, err)),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, TelemetryError>;
