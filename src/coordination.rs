use crate::error::LockTimeout;
use crate::lock::ResourceLockRegistry;
use crate::notify::NotificationBus;
use crate::retry::RetryPolicy;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct Coordination {
    pub locks: Arc<ResourceLockRegistry>,
    pub bus: Arc<NotificationBus>,
    pub retry: RetryPolicy,
    pub lock_timeout: Duration,
}

impl Coordination {
    pub fn new(
        locks: Arc<ResourceLockRegistry>,
        bus: Arc<NotificationBus>,
        retry: RetryPolicy,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            locks,
            bus,
            retry,
            lock_timeout,
        }
    }

    /// Runs `f` holding the lock for `resource`. The lock is released when
    /// `f` returns, fails, or unwinds. Never call this from inside `f` for a
    /// different resource.
    pub fn locked<T, E>(&self, resource: &str, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<LockTimeout>,
    {
        let lock = self.locks.get_lock(resource);
        let _guard = lock.acquire_or_timeout(self.lock_timeout)?;
        f()
    }

    pub fn publish(&self, kind: &str, payload: Value) {
        self.bus.publish(kind, payload);
    }
}
