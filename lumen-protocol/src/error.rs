//! Error handling for the Lumen host.
//!
//! A single error enum covers every library operation. The variants map
//! onto the HTTP status codes the control plane ultimately emits:
//!
//! | Variant              | Gamestream | Admin API |
//! |----------------------|------------|-----------|
//! | `ProtocolViolation`  | 400        | 400       |
//! | `AuthFailure`        | XML 401    | 401       |
//! | `Forbidden`          | 403        | 403       |
//! | `NotFound`           | 404        | 404       |
//! | `Conflict`           | 400        | 400       |
//! | `TransientResource`  | 503        | 503       |
//! | everything else      | XML 400    | 500       |
//!
//! Underlying library errors convert automatically via `From`.

use thiserror::Error;

/// Result type for host operations.
pub type Result<T> = std::result::Result<T, HostError>;

/// Errors that can occur while running the host.
#[derive(Error, Debug)]
pub enum HostError {
    /// I/O error (file system, network, process spawning).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// OpenSSL error (TLS, ciphers, X.509 handling).
    #[error("crypto error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    /// Wire-protocol violation: out-of-order pairing phase, bad hex,
    /// wrong field length. The offending pairing session is dropped.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Missing or invalid credentials, unknown client certificate.
    #[error("authentication failure: {0}")]
    AuthFailure(String),

    /// The caller is known but not allowed to perform this operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Unknown app, client, or asset.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation conflicts with current host state, e.g. another
    /// app is already running.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A resource that may come back later is unavailable right now,
    /// e.g. the encoder probe failed or a display is not ready.
    #[error("transient resource failure: {0}")]
    TransientResource(String),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// A launched process or prep command failed.
    #[error("process error: {0}")]
    Process(String),
}

impl HostError {
    /// Shorthand for a [`HostError::ProtocolViolation`].
    pub fn protocol(msg: impl Into<String>) -> Self {
        HostError::ProtocolViolation(msg.into())
    }

    /// Whether retrying the operation may succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(self, HostError::TransientResource(_) | HostError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = HostError::protocol("out of order call to clientchallenge");
        assert_eq!(
            err.to_string(),
            "protocol violation: out of order call to clientchallenge"
        );

        let err = HostError::Conflict("an app is already running".into());
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: HostError = io.into();
        assert!(matches!(err, HostError::Io(_)));
        assert!(err.is_transient());
    }
}
