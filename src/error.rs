use crate::retry::{RetryError, Transient};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("could not acquire lock for {resource} within {timeout:?}")]
pub struct LockTimeout {
    pub resource: String,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database is busy")]
    Busy,
    #[error("database table is locked")]
    Locked,
    #[error("no pooled connection became available within {0:?}")]
    PoolExhausted(Duration),
    #[error("sqlite: {0}")]
    Sqlite(rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) => StorageError::Busy,
            Some(rusqlite::ErrorCode::DatabaseLocked) => StorageError::Locked,
            _ => StorageError::Sqlite(err),
        }
    }
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Busy | StorageError::Locked | StorageError::PoolExhausted(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("event {0} not found")]
    NotFound(i64),
    #[error("participant {0} not found")]
    ParticipantNotFound(i64),
    #[error("event {0} is full")]
    EventFull(i64),
    #[error("participant {participant_id} is already registered for event {event_id}")]
    AlreadyRegistered { event_id: i64, participant_id: i64 },
    #[error(transparent)]
    LockTimeout(#[from] LockTimeout),
    #[error("storage still failing after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: usize, last: StorageError },
    #[error(transparent)]
    Storage(StorageError),
}

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("only administrators may modify events")]
    PermissionDenied,
    #[error("event {0} not found")]
    NotFound(i64),
    #[error("invalid event: {0}")]
    Invalid(String),
    #[error("event {event_id} was modified concurrently (expected version {expected})")]
    VersionConflict { event_id: i64, expected: i64 },
    #[error(transparent)]
    LockTimeout(#[from] LockTimeout),
    #[error("storage still failing after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: usize, last: StorageError },
    #[error(transparent)]
    Storage(StorageError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("task queue is full (capacity {0})")]
    QueueFull(usize),
}

impl From<RetryError<StorageError>> for AdmissionError {
    fn from(err: RetryError<StorageError>) -> Self {
        match err {
            RetryError::Fatal(err) => AdmissionError::Storage(err),
            RetryError::Exhausted { attempts, last } => {
                AdmissionError::RetriesExhausted { attempts, last }
            }
        }
    }
}

impl From<RetryError<StorageError>> for MutationError {
    fn from(err: RetryError<StorageError>) -> Self {
        match err {
            RetryError::Fatal(err) => MutationError::Storage(err),
            RetryError::Exhausted { attempts, last } => {
                MutationError::RetriesExhausted { attempts, last }
            }
        }
    }
}
