use crate::admission::Registrar;
use crate::error::AdmissionError;
use crate::model::{Registration, RegistrationStatus};
use crate::workers::pool::{Task, TaskFailure, WorkerPool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type RegistrationPool = WorkerPool<Registration, AdmissionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRequest {
    pub event_id: i64,
    pub participant_id: i64,
    pub status: RegistrationStatus,
}

impl BatchRequest {
    pub fn confirmed(event_id: i64, participant_id: i64) -> Self {
        Self {
            event_id,
            participant_id,
            status: RegistrationStatus::Confirmed,
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub accepted: usize,
    pub rejected: Vec<BatchRequest>,
    pub completed: Vec<(BatchRequest, Result<Registration, TaskFailure<AdmissionError>>)>,
    pub unfinished: Vec<BatchRequest>,
}

impl BatchReport {
    pub fn admitted(&self) -> impl Iterator<Item = &Registration> {
        self.completed.iter().filter_map(|(_, r)| r.as_ref().ok())
    }
}

/// Runs every request through `registrar` on the pool and pairs each result
/// with its request by task id. Submission stops at the first full-queue
/// rejection. Expects to be the only submitter on `pool` while it runs.
pub fn register_batch(
    pool: &RegistrationPool,
    registrar: &Arc<Registrar>,
    requests: &[BatchRequest],
    timeout: Duration,
) -> BatchReport {
    pool.start();

    let ids = requests.iter().map(|_| Uuid::new_v4()).collect::<Vec<_>>();
    let tasks = requests.iter().zip(&ids).map(|(req, id)| {
        let registrar = Arc::clone(registrar);
        let req = *req;
        Task::with_id(*id, move || {
            registrar.register_with_status(req.event_id, req.participant_id, req.status)
        })
    });
    let accepted = pool.submit_batch(tasks);
    let rejected = requests[accepted..].to_vec();
    if !rejected.is_empty() {
        warn!(accepted, rejected = rejected.len(), "batch partially admitted to queue");
    }
    let mut pending = ids[..accepted]
        .iter()
        .copied()
        .zip(requests[..accepted].iter().copied())
        .collect::<HashMap<_, _>>();

    let mut report = BatchReport {
        accepted,
        rejected,
        ..BatchReport::default()
    };
    // Results left over from an earlier batch that timed out share the
    // channel; they are skipped and do not count toward this batch.
    let deadline = Instant::now() + timeout;
    while !pending.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let results = pool.wait_for_results(pending.len(), remaining);
        if results.is_empty() {
            break;
        }
        for result in results {
            match pending.remove(&result.task_id) {
                Some(req) => report.completed.push((req, result.outcome)),
                None => debug!(task = %result.task_id, "discarding result from an earlier batch"),
            }
        }
    }
    report.unfinished = pending.into_values().collect();
    info!(
        accepted = report.accepted,
        admitted = report.admitted().count(),
        unfinished = report.unfinished.len(),
        "batch registration finished"
    );
    report
}
