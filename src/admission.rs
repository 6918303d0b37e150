use crate::coordination::Coordination;
use crate::error::AdmissionError;
use crate::lock::event_resource;
use crate::model::{Registration, RegistrationStatus};
use crate::notify::{REGISTRATION_CANCELLED, REGISTRATION_CREATED};
use crate::storage::{AdmissionOutcome, EventStorage, IsolationLevel};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

pub struct Registrar {
    storage: Arc<dyn EventStorage>,
    ctx: Coordination,
}

impl Registrar {
    pub fn new(storage: Arc<dyn EventStorage>, ctx: Coordination) -> Self {
        Self { storage, ctx }
    }

    pub fn register(
        &self,
        event_id: i64,
        participant_id: i64,
    ) -> Result<Registration, AdmissionError> {
        self.register_with_status(event_id, participant_id, RegistrationStatus::Confirmed)
    }

    pub fn register_with_status(
        &self,
        event_id: i64,
        participant_id: i64,
        status: RegistrationStatus,
    ) -> Result<Registration, AdmissionError> {
        let resource = event_resource(event_id);
        let registration = self.ctx.locked(&resource, || -> Result<Registration, AdmissionError> {
            let outcome = self.ctx.retry.run("register", |_| {
                self.storage
                    .admit(event_id, participant_id, status, IsolationLevel::Serializable)
            })?;
            match outcome {
                AdmissionOutcome::Admitted(registration) => Ok(registration),
                AdmissionOutcome::EventMissing => Err(AdmissionError::NotFound(event_id)),
                AdmissionOutcome::ParticipantMissing => {
                    Err(AdmissionError::ParticipantNotFound(participant_id))
                }
                AdmissionOutcome::Full {
                    capacity,
                    confirmed,
                } => {
                    debug!(event_id, participant_id, capacity, confirmed, "event full");
                    Err(AdmissionError::EventFull(event_id))
                }
                AdmissionOutcome::Duplicate => Err(AdmissionError::AlreadyRegistered {
                    event_id,
                    participant_id,
                }),
            }
        })?;

        info!(
            event_id,
            participant_id,
            registration_id = registration.registration_id,
            "participant registered"
        );
        self.ctx.publish(
            REGISTRATION_CREATED,
            json!({
                "event_id": event_id,
                "participant_id": participant_id,
                "registration_id": registration.registration_id,
                "status": registration.status.as_str()
            }),
        );
        Ok(registration)
    }

    pub fn unregister(&self, event_id: i64, participant_id: i64) -> Result<bool, AdmissionError> {
        let resource = event_resource(event_id);
        let removed = self.ctx.locked(&resource, || {
            self.ctx
                .retry
                .run("unregister", |_| {
                    self.storage.remove_registration(event_id, participant_id)
                })
                .map_err(AdmissionError::from)
        })?;
        if removed {
            info!(event_id, participant_id, "registration removed");
            self.ctx.publish(
                REGISTRATION_CANCELLED,
                json!({"event_id": event_id, "participant_id": participant_id}),
            );
        }
        Ok(removed)
    }
}
