/// Storage-level failures from the record store.
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Bincode(String),
    NotFound,
    /// Conditional write lost the race: stored bytes no longer match the
    /// snapshot the caller read.
    WriteConflict,
    Other(String),
}

impl Clone for StoreError {
    fn clone(&self) -> Self {
        match self {
            StoreError::Io(e) => StoreError::Io(std::io::Error::new(e.kind(), e.to_string())),
            StoreError::Bincode(s) => StoreError::Bincode(s.clone()),
            StoreError::NotFound => StoreError::NotFound,
            StoreError::WriteConflict => StoreError::WriteConflict,
            StoreError::Other(s) => StoreError::Other(s.clone()),
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::Bincode(e) => write!(f, "Serialization error: {}", e),
            StoreError::NotFound => write!(f, "Record not found"),
            StoreError::WriteConflict => write!(f, "Conditional write conflict"),
            StoreError::Other(e) => write!(f, "Other: {}", e),
        }
    }
}
impl std::error::Error for StoreError {}
impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

/// Mutation service failures, surfaced to API callers.
///
/// Every operation either fully succeeds or fails with one of these and no
/// side effect; batch operations are the exception (partial application is
/// success, not an error).
#[derive(Debug, Clone)]
pub enum ServiceError {
    /// Missing or invalid required field. No side effect.
    Validation(String),
    /// Operand id does not resolve to a live record.
    NotFound,
    /// Group deletion blocked by live note references.
    Conflict(String),
    Store(StoreError),
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::Validation(m) => write!(f, "{}", m),
            ServiceError::NotFound => write!(f, "not found"),
            ServiceError::Conflict(m) => write!(f, "{}", m),
            ServiceError::Store(e) => write!(f, "storage: {}", e),
        }
    }
}
impl std::error::Error for ServiceError {}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ServiceError::NotFound,
            other => ServiceError::Store(other),
        }
    }
}
