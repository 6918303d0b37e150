use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notification {
    pub kind: String,
    pub payload: Value,
    pub published_at: DateTime<Utc>,
}

pub type Callback = Arc<dyn Fn(&Notification) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Job = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    drained: Condvar,
}

impl InFlight {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }
}

pub struct NotificationBus {
    subscribers: RwLock<HashMap<String, Vec<(SubscriptionId, Callback)>>>,
    next_id: AtomicU64,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    in_flight: Arc<InFlight>,
}

impl NotificationBus {
    pub fn new(workers: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        for i in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let spawned = thread::Builder::new()
                .name(format!("notify-{i}"))
                .spawn(move || {
                    loop {
                        let job = rx.lock().recv();
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    }
                });
            if let Err(err) = spawned {
                warn!("failed to spawn notification dispatcher {i}: {err}");
            }
        }
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            jobs: Mutex::new(Some(tx)),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn subscribe<F>(&self, kind: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Notification) -> Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(kind.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        debug!(kind, ?id, "subscribed");
        id
    }

    pub fn unsubscribe(&self, kind: &str, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write();
        let Some(list) = subs.get_mut(kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub, _)| *sub != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subs.remove(kind);
        }
        removed
    }

    pub fn subscriber_count(&self, kind: &str) -> usize {
        self.subscribers.read().get(kind).map_or(0, Vec::len)
    }

    pub fn publish(&self, kind: &str, payload: Value) -> usize {
        let callbacks = match self.subscribers.read().get(kind) {
            Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect::<Vec<_>>(),
            None => return 0,
        };
        let notification = Arc::new(Notification {
            kind: kind.to_string(),
            payload,
            published_at: Utc::now(),
        });

        let jobs = self.jobs.lock();
        let Some(tx) = jobs.as_ref() else {
            warn!(kind, "notification bus closed, dropping notification");
            return 0;
        };
        let mut dispatched = 0;
        for callback in callbacks {
            let notification = Arc::clone(&notification);
            let in_flight = Arc::clone(&self.in_flight);
            in_flight.add();
            let job: Job = Box::new(move || {
                match catch_unwind(AssertUnwindSafe(|| callback(notification.as_ref()))) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        error!(kind = %notification.kind, "notification callback failed: {err:#}")
                    }
                    Err(_) => error!(kind = %notification.kind, "notification callback panicked"),
                }
                in_flight.done();
            });
            if tx.send(job).is_err() {
                self.in_flight.done();
                warn!(kind, "notification dispatcher gone, dropping notification");
                break;
            }
            dispatched += 1;
        }
        dispatched
    }

    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.in_flight.count.lock();
        while *count > 0 {
            if self
                .in_flight
                .drained
                .wait_until(&mut count, deadline)
                .timed_out()
            {
                return *count == 0;
            }
        }
        true
    }

    pub fn close(&self) {
        self.jobs.lock().take();
    }
}

impl Drop for NotificationBus {
    fn drop(&mut self) {
        self.close();
    }
}
