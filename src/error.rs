//! Error types for the client engine.

use thiserror::Error;

/// Library error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Private key bytes are not a valid secp256k1 scalar.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Malformed hex input (odd length, bad digit, wrong size).
    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// secp256k1 rejected an operation.
    #[error("Crypto error: {0}")]
    Crypto(#[from] secp256k1::Error),

    /// Transport could not be opened or written.
    #[error("Transport error: {0}")]
    Transport(String),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Operation requires an open relay connection.
    #[error("Not connected to relay")]
    NotConnected,

    /// Operation requires a key pair.
    #[error("Not logged in")]
    NotLoggedIn,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Key-value store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

/// Library result type
pub type Result<T> = std::result::Result<T, Error>;
