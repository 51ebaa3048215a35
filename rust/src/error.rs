//! Error type for engine operations.

/// Errors surfaced by [`crate::SyncEngine`] and its storage seams.
///
/// Malformed remote data never shows up here; it is logged and degraded to an
/// empty value where it is parsed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No private key is configured for this instance
    #[error("private key is not set")]
    PrivateKeyNotSet,
    /// Input is neither an `nsec1...` key nor 64 lowercase hex chars
    #[error("invalid private key")]
    InvalidPrivateKey,
    /// The engine has been disposed
    #[error("engine has been disposed")]
    Disposed,
    /// Secret store failure
    #[error("secret store error: {0}")]
    Secret(String),
    /// Error from rusqlite
    #[error("SQLite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    /// JSON (de)serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Relay client failure
    #[error("relay error: {0}")]
    Relay(String),
    /// Event could not be built or signed
    #[error("signing error: {0}")]
    Signing(String),
    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
