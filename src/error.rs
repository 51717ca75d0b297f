use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

/// Error kinds surfaced to collaborators; the handler layer maps these to
/// HTTP statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidKey,
    NotFound,
    Forbidden,
    QueueFull,
    WalFull,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidKey => "invalid_key",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::QueueFull => "queue_full",
            ErrorKind::WalFull => "wal_full",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("ingest queue full")]
    QueueFull,

    #[error("wal at capacity")]
    WalFull,

    #[error("wal record {0} not found")]
    WalNotFound(u64),

    #[error("init error: {0}")]
    InitError(String),

    #[error("bad state: {0}")]
    BadStateError(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error(transparent)]
    StoreError(#[from] fjall::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    EncodingError(#[from] serde_json::Error),

    #[error("background task died: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::InvalidKey(_) | StorageError::Validation(_) => ErrorKind::InvalidKey,
            StorageError::NotFound(_) | StorageError::WalNotFound(_) => ErrorKind::NotFound,
            StorageError::Forbidden(_) => ErrorKind::Forbidden,
            StorageError::QueueFull => ErrorKind::QueueFull,
            StorageError::WalFull => ErrorKind::WalFull,
            StorageError::InitError(_)
            | StorageError::BadStateError(_)
            | StorageError::StoreError(_)
            | StorageError::IoError(_)
            | StorageError::EncodingError(_)
            | StorageError::JoinError(_) => ErrorKind::Internal,
        }
    }

    /// Errors that poison only the op that carried them; the batch goes on.
    pub fn is_op_local(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Internal)
    }
}
