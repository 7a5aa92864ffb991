use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Transient store failure: {0}")]
    Transient(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Invalid stream identifier: {0}")]
    InvalidStreamIdentifier(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

impl StoreError {
    /// Whether the failed call may succeed if simply issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}
