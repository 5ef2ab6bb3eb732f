use thiserror::Error;

/// Errors surfaced by every catalog, registry, store and boundary operation.
///
/// All variants are terminal for the request that produced them.
#[derive(Debug, Error)]
pub enum EntryError {
    /// Malformed upload, duplicate trait name or bad input value.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The target record lives outside the caller's location.
    #[error("scope violation: {0}")]
    Scope(String),

    /// Writing to a record whose status forbids it.
    #[error("invalid state: {0}")]
    State(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// The uploaded or exported file could not be read or written.
    #[error("grid error: {0}")]
    Grid(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EntryError>;

impl From<calamine::XlsxError> for EntryError {
    fn from(e: calamine::XlsxError) -> Self {
        EntryError::Grid(e.to_string())
    }
}

impl From<csv::Error> for EntryError {
    fn from(e: csv::Error) -> Self {
        EntryError::Grid(e.to_string())
    }
}

impl From<rust_xlsxwriter::XlsxError> for EntryError {
    fn from(e: rust_xlsxwriter::XlsxError) -> Self {
        EntryError::Grid(e.to_string())
    }
}

impl From<bincode::Error> for EntryError {
    fn from(e: bincode::Error) -> Self {
        EntryError::Snapshot(e.to_string())
    }
}
