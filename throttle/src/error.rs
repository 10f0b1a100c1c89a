use crate::limiter::TrackerKind;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid tracker parameters: {0}")]
    InvalidParams(String),
    #[error("reservation amount must be positive")]
    ZeroAmount,
    #[error("{0:?} is not a valid tracker for this operation")]
    UnknownTracker(TrackerKind),
    #[error(transparent)]
    Interrupted(#[from] common::Interrupted),
    #[error("failed to read disk statistics: {0}")]
    DiskStats(#[from] std::io::Error),
}

impl Error {
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Semaphore counts observed when a reservation finished, successfully or not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct Available {
    pub bytes: i64,
    pub files: i64,
}

/// A failed reservation, still reporting how much room was left.
///
/// Nothing is held when this is returned.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct ReserveError {
    #[source]
    pub source: Error,
    pub available: Available,
}

impl ReserveError {
    #[must_use]
    pub fn new(source: Error, available: Available) -> Self {
        ReserveError { source, available }
    }
}
