use crate::error::LockTimeout;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

pub fn event_resource(event_id: i64) -> String {
    format!("event_{event_id}")
}

pub struct ResourceLock {
    resource: String,
    mutex: ReentrantMutex<()>,
}

impl ResourceLock {
    fn new(resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            mutex: ReentrantMutex::new(()),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn acquire(&self, timeout: Duration) -> Option<ResourceGuard<'_>> {
        let guard = self.mutex.try_lock_for(timeout)?;
        trace!(resource = %self.resource, "lock acquired");
        Some(ResourceGuard {
            resource: &self.resource,
            guard: Some(guard),
        })
    }

    pub fn acquire_or_timeout(&self, timeout: Duration) -> Result<ResourceGuard<'_>, LockTimeout> {
        self.acquire(timeout).ok_or_else(|| {
            debug!(resource = %self.resource, ?timeout, "lock acquire timed out");
            LockTimeout {
                resource: self.resource.clone(),
                timeout,
            }
        })
    }

    pub fn is_locked(&self) -> bool {
        self.mutex.is_locked()
    }
}

/// Held lock. Released on drop; `release` may be called early and is a
/// no-op once the lock is already gone.
pub struct ResourceGuard<'a> {
    resource: &'a str,
    guard: Option<ReentrantMutexGuard<'a, ()>>,
}

impl ResourceGuard<'_> {
    pub fn release(&mut self) {
        if self.guard.take().is_some() {
            trace!(resource = %self.resource, "lock released");
        }
    }

    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }
}

impl Drop for ResourceGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Default)]
pub struct ResourceLockRegistry {
    locks: RwLock<HashMap<String, Arc<ResourceLock>>>,
}

impl ResourceLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_lock(&self, resource: &str) -> Arc<ResourceLock> {
        if let Some(lock) = self.locks.read().get(resource) {
            return Arc::clone(lock);
        }
        let mut locks = self.locks.write();
        // Another thread may have created it between the two guards.
        Arc::clone(
            locks
                .entry(resource.to_string())
                .or_insert_with(|| Arc::new(ResourceLock::new(resource))),
        )
    }

    pub fn with_lock<T>(
        &self,
        resource: &str,
        timeout: Duration,
        f: impl FnOnce() -> T,
    ) -> Result<T, LockTimeout> {
        let lock = self.get_lock(resource);
        let _guard = lock.acquire_or_timeout(timeout)?;
        Ok(f())
    }

    pub fn is_locked(&self, resource: &str) -> bool {
        self.locks
            .read()
            .get(resource)
            .is_some_and(|lock| lock.is_locked())
    }

    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
