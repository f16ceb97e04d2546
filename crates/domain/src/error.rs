use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("trip not found")]
    NotFound,
    #[error("trip already exists")]
    AlreadyExists,
    #[error("invalid trip state transition")]
    InvalidTransition,
    #[error("driver does not match trip assignment")]
    DriverMismatch,
    #[error("trip version conflict")]
    VersionConflict,
    #[error("no candidate driver available")]
    NoCandidate,
    #[error("store error: {0}")]
    Store(String),
    #[error("bus error: {0}")]
    Bus(String),
}
