#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use turnstile::admission::Registrar;
use turnstile::coordination::Coordination;
use turnstile::error::StorageError;
use turnstile::lock::ResourceLockRegistry;
use turnstile::model::{Event, NewEvent, NewParticipant, RegistrationStatus};
use turnstile::mutation::Mutator;
use turnstile::notify::NotificationBus;
use turnstile::retry::RetryPolicy;
use turnstile::storage::{
    AdmissionOutcome, EventStorage, IsolationLevel, SqliteStore, VersionedWrite,
};

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
}

pub fn open_store(dir: &Path) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open(&dir.join("turnstile.db"), 8, Duration::from_secs(5)).unwrap())
}

pub fn coordination(lock_timeout: Duration) -> Coordination {
    Coordination::new(
        Arc::new(ResourceLockRegistry::new()),
        Arc::new(NotificationBus::new(2)),
        fast_retry(),
        lock_timeout,
    )
}

/// A store, a coordination context, and the two services built on them.
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<SqliteStore>,
    pub ctx: Coordination,
    pub registrar: Arc<Registrar>,
    pub mutator: Mutator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_lock_timeout(Duration::from_secs(5))
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let storage: Arc<dyn EventStorage> = store.clone();
        Self::build(dir, store, storage, coordination(lock_timeout))
    }

    /// Same store, but every call goes through `flaky` first.
    pub fn with_flaky(flaky: impl FnOnce(Arc<SqliteStore>) -> Arc<FlakyStorage>) -> (Self, Arc<FlakyStorage>) {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let flaky = flaky(Arc::clone(&store));
        let storage: Arc<dyn EventStorage> = flaky.clone();
        (
            Self::build(dir, store, storage, coordination(Duration::from_secs(5))),
            flaky,
        )
    }

    fn build(
        dir: TempDir,
        store: Arc<SqliteStore>,
        storage: Arc<dyn EventStorage>,
        ctx: Coordination,
    ) -> Self {
        let registrar = Arc::new(Registrar::new(Arc::clone(&storage), ctx.clone()));
        let mutator = Mutator::new(storage, ctx.clone());
        Self {
            dir,
            store,
            ctx,
            registrar,
            mutator,
        }
    }

    pub fn event(&self, title: &str, capacity: i64) -> Event {
        self.store
            .create_event(&NewEvent::simple(title, capacity))
            .unwrap()
    }

    pub fn participants(&self, n: usize) -> Vec<i64> {
        (0..n)
            .map(|i| {
                self.store
                    .create_participant(&NewParticipant {
                        first_name: format!("P{i}"),
                        last_name: "Tester".to_string(),
                        email: format!("p{i}@example.com"),
                        phone: None,
                        identifier: format!("ID-{i}"),
                    })
                    .unwrap()
                    .participant_id
            })
            .collect()
    }

    /// Counts notifications of `kind` delivered from now on.
    pub fn count_notifications(&self, kind: &str) -> Arc<AtomicUsize> {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        self.ctx.bus.subscribe(kind, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        seen
    }

    pub fn capture_notifications(&self, kind: &str) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        self.ctx.bus.subscribe(kind, move |n| {
            sink.lock().push(n.payload.clone());
            Ok(())
        });
        seen
    }

    pub fn drain_notifications(&self) {
        assert!(self.ctx.bus.wait_idle(Duration::from_secs(5)));
    }
}

/// Wraps the SQLite store and fails the first N calls of an operation with
/// a transient busy error before touching the database.
pub struct FlakyStorage {
    inner: Arc<SqliteStore>,
    admit_failures: AtomicUsize,
    update_failures: AtomicUsize,
    pub admit_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    fatal_admit: bool,
}

impl FlakyStorage {
    pub fn new(inner: Arc<SqliteStore>) -> Self {
        Self {
            inner,
            admit_failures: AtomicUsize::new(0),
            update_failures: AtomicUsize::new(0),
            admit_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            fatal_admit: false,
        }
    }

    pub fn failing_admits(self, n: usize) -> Self {
        self.admit_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn failing_updates(self, n: usize) -> Self {
        self.update_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Admissions fail with a non-transient error.
    pub fn broken_admits(mut self) -> Self {
        self.fatal_admit = true;
        self
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl EventStorage for FlakyStorage {
    fn get_event(&self, event_id: i64) -> Result<Option<Event>, StorageError> {
        self.inner.get_event(event_id)
    }

    fn admit(
        &self,
        event_id: i64,
        participant_id: i64,
        status: RegistrationStatus,
        isolation: IsolationLevel,
    ) -> Result<AdmissionOutcome, StorageError> {
        self.admit_calls.fetch_add(1, Ordering::SeqCst);
        if self.fatal_admit {
            return Err(StorageError::Io(std::io::Error::other("disk on fire")));
        }
        if Self::take_failure(&self.admit_failures) {
            return Err(StorageError::Busy);
        }
        self.inner
            .admit(event_id, participant_id, status, isolation)
    }

    fn remove_registration(
        &self,
        event_id: i64,
        participant_id: i64,
    ) -> Result<bool, StorageError> {
        self.inner.remove_registration(event_id, participant_id)
    }

    fn update_event_if_version(&self, event: &Event) -> Result<VersionedWrite, StorageError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.update_failures) {
            return Err(StorageError::Locked);
        }
        self.inner.update_event_if_version(event)
    }

    fn delete_event(&self, event_id: i64) -> Result<bool, StorageError> {
        self.inner.delete_event(event_id)
    }
}
