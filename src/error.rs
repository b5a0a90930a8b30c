use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by library construction, persistence and search.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input spectrum or query.
    #[error("invalid input: {0}")]
    Input(String),

    /// A requested operation contradicts the library configuration,
    /// e.g. neutral-loss search against an index built without
    /// neutral-loss arrays, or changing a frozen configuration.
    #[error("configuration mismatch: {0}")]
    ConfigMismatch(String),

    /// The library is in the wrong state for the operation,
    /// e.g. searching while spectra are still pending build.
    #[error("invalid state: {0}")]
    State(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Missing, truncated or version-incompatible on-disk data.
    #[error("corrupt index data: {0}")]
    Corrupt(String),

    /// The query was cancelled through its cancellation flag.
    #[error("search cancelled")]
    Cancelled,
}
