use crate::notify::{ALL_KINDS, Notification, NotificationBus, SubscriptionId};
use anyhow::Result;
use parking_lot::Mutex;
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub fn mirror_notification(path: &Path, n: &Notification) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    let line = json!({
        "ts": n.published_at.to_rfc3339(),
        "event": n.kind,
        "payload": n.payload
    });
    writeln!(f, "{}", line)?;
    Ok(())
}

pub fn attach(bus: &NotificationBus, path: &Path) -> Vec<(&'static str, SubscriptionId)> {
    let path = Arc::new(PathBuf::from(path));
    let write_guard = Arc::new(Mutex::new(()));
    ALL_KINDS
        .iter()
        .map(|kind| {
            let path = Arc::clone(&path);
            let write_guard = Arc::clone(&write_guard);
            let id = bus.subscribe(kind, move |n| {
                let _serialized = write_guard.lock();
                mirror_notification(&path, n)
            });
            (*kind, id)
        })
        .collect()
}
