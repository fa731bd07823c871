use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum GcError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("memory limit of {0} bytes exceeded")]
    MemoryLimitExceeded(usize),

    #[error("cell is not an object")]
    NotAnObject,

    #[error("cell has already been freed")]
    DeadCell,

    #[error("garbage collection already in progress")]
    CollectionInProgress,

    #[error("value is not callable")]
    NotCallable,

    #[error("snapshot I/O error: {0}")]
    SnapshotIo(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for GcError {
    fn from(err: std::io::Error) -> Self {
        GcError::SnapshotIo(err.to_string())
    }
}

impl From<serde_json::Error> for GcError {
    fn from(err: serde_json::Error) -> Self {
        GcError::SnapshotIo(err.to_string())
    }
}
