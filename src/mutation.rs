use crate::coordination::Coordination;
use crate::error::MutationError;
use crate::lock::event_resource;
use crate::model::{Event, Role};
use crate::notify::{EVENT_DELETED, EVENT_UPDATED};
use crate::storage::{EventStorage, VersionedWrite};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Version-checked edits to event records. A stale version is reported as
/// a conflict and never retried.
pub struct Mutator {
    storage: Arc<dyn EventStorage>,
    ctx: Coordination,
}

impl Mutator {
    pub fn new(storage: Arc<dyn EventStorage>, ctx: Coordination) -> Self {
        Self { storage, ctx }
    }

    pub fn update(&self, role: Role, event: &Event) -> Result<Event, MutationError> {
        if !role.is_admin() {
            return Err(MutationError::PermissionDenied);
        }
        validate(event)?;

        let resource = event_resource(event.event_id);
        let write = self.ctx.locked(&resource, || {
            self.ctx
                .retry
                .run("update_event", |_| self.storage.update_event_if_version(event))
                .map_err(MutationError::from)
        })?;

        match write {
            VersionedWrite::Applied { new_version } => {
                info!(event_id = event.event_id, version = new_version, "event updated");
                self.ctx.publish(
                    EVENT_UPDATED,
                    json!({
                        "event_id": event.event_id,
                        "version": new_version,
                        "title": event.title,
                        "capacity": event.capacity,
                        "status": event.status.as_str()
                    }),
                );
                Ok(Event {
                    version: new_version,
                    ..event.clone()
                })
            }
            VersionedWrite::Stale => {
                warn!(
                    event_id = event.event_id,
                    expected = event.version,
                    "version conflict on event update"
                );
                Err(MutationError::VersionConflict {
                    event_id: event.event_id,
                    expected: event.version,
                })
            }
            VersionedWrite::Missing => Err(MutationError::NotFound(event.event_id)),
        }
    }

    pub fn delete(&self, role: Role, event_id: i64) -> Result<bool, MutationError> {
        if !role.is_admin() {
            return Err(MutationError::PermissionDenied);
        }
        let resource = event_resource(event_id);
        let removed = self.ctx.locked(&resource, || {
            self.ctx
                .retry
                .run("delete_event", |_| self.storage.delete_event(event_id))
                .map_err(MutationError::from)
        })?;
        if removed {
            info!(event_id, "event deleted");
            self.ctx
                .publish(EVENT_DELETED, json!({"event_id": event_id}));
        }
        Ok(removed)
    }
}

fn validate(event: &Event) -> Result<(), MutationError> {
    if event.title.trim().is_empty() {
        return Err(MutationError::Invalid("title must not be empty".to_string()));
    }
    if event.capacity <= 0 {
        return Err(MutationError::Invalid(format!(
            "capacity must be positive, got {}",
            event.capacity
        )));
    }
    if event.version < 0 {
        return Err(MutationError::Invalid("version must not be negative".to_string()));
    }
    if let (Some(start), Some(end)) = (event.start_at, event.end_at)
        && end < start
    {
        return Err(MutationError::Invalid("event ends before it starts".to_string()));
    }
    Ok(())
}
