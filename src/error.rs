//! Error types for peerbeam.

/// Main error type for relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Token generation error.
    #[error("token error: {0}")]
    Token(#[from] TokenError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Token generation errors.
///
/// Secure tokens are bearer capabilities, so entropy failure is fatal for
/// the request that needed the token. There is no fallback to the fast
/// generator.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Requested token length is below the guessability floor.
    #[error("token length {requested} is below the minimum of {minimum}")]
    TooShort {
        /// Requested length.
        requested: usize,
        /// Minimum allowed length.
        minimum: usize,
    },

    /// The OS entropy source was unavailable.
    #[error("entropy source unavailable: {0}")]
    Entropy(String),
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
