pub mod pool;
pub mod schema;
pub mod store;

use crate::error::StorageError;
use crate::model::{Event, Registration, RegistrationStatus};

pub use store::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    Serializable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Admitted(Registration),
    EventMissing,
    ParticipantMissing,
    Full { capacity: i64, confirmed: i64 },
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionedWrite {
    Applied { new_version: i64 },
    Stale,
    Missing,
}

pub trait EventStorage: Send + Sync {
    fn get_event(&self, event_id: i64) -> Result<Option<Event>, StorageError>;

    fn admit(
        &self,
        event_id: i64,
        participant_id: i64,
        status: RegistrationStatus,
        isolation: IsolationLevel,
    ) -> Result<AdmissionOutcome, StorageError>;

    fn remove_registration(
        &self,
        event_id: i64,
        participant_id: i64,
    ) -> Result<bool, StorageError>;

    fn update_event_if_version(&self, event: &Event) -> Result<VersionedWrite, StorageError>;

    fn delete_event(&self, event_id: i64) -> Result<bool, StorageError>;
}
