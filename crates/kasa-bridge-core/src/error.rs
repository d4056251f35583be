//! Error types for kasa-bridge-core.
//!
//! Transports report low-level failures (`Timeout`, `ConnectionFailed`,
//! `IoError`); the [`DeviceClient`](crate::DeviceClient) folds them into
//! [`Error::Unreachable`] once its retry budget is spent.

use thiserror::Error;

/// Error type for kasa-bridge-core operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// No usable reply from the device after all retries.
    #[error("device unreachable: {0}")]
    Unreachable(String),

    /// A single network round trip timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Connection to the device failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Handshake rejected: wrong or missing credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The device no longer accepts the session (KLAP).
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// Response could not be decrypted, verified or parsed.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Response schema not recognized.
    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    /// Protocol error (unexpected status, framing, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    IoError(String),

    /// Device returned an error response.
    #[error("device error: {0}")]
    DeviceError(String),

    /// A device address string could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl Error {
    /// Returns `true` for failures worth retrying after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ConnectionFailed(_) | Error::IoError(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}
