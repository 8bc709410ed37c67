//! Error types for credential persistence and token decoding

/// Errors from the key-value backends and the token decoder.
///
/// The credential store never returns these to its callers; they are handed
/// to the registered error sink instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("storage format error: {0}")]
    Format(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("token decode error: {0}")]
    TokenDecode(String),
}

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;
