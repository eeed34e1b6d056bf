//! Error types for the gateway client core.

use thiserror::Error;

/// Core error type for gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Transport-level send/bind failures.
///
/// These are returned to the immediate caller of an outbound operation;
/// the gateway eventually flips to offline via the liveness timeout.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Could not resolve host: {0}")]
    UnresolvedHost(String),

    #[error("Send to {addr} failed: {source}")]
    SendFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to bind UDP port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Command-construction failures for encrypted write data.
///
/// Surfaced as warnings rather than aborting the command: the bridge stays
/// operational and the gateway rejects the payload on its side.
#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("No session token received from gateway yet")]
    MissingToken,

    #[error("No pre-shared key configured for gateway")]
    MissingKey,

    #[error("Pre-shared key is too short ({0} bytes, need 16)")]
    KeyTooShort(usize),

    #[error("Token length {0} is not a whole number of cipher blocks")]
    BadTokenLength(usize),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
