use crate::admission::Registrar;
use crate::config::{Config, load_config};
use crate::coordination::Coordination;
use crate::lock::ResourceLockRegistry;
use crate::model::{Event, EventStatus, NewEvent, NewParticipant, RegistrationStatus, Role};
use crate::mutation::Mutator;
use crate::notify::{NotificationBus, ndjson};
use crate::storage::{EventStorage, SqliteStore};
use crate::workers::{BatchRequest, RegistrationPool, register_batch};
use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Turnstile {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub ctx: Coordination,
    pub registrar: Arc<Registrar>,
    pub mutator: Mutator,
    pub batch: RegistrationPool,
}

impl Turnstile {
    pub fn open(config: Config) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(
            &config.storage.path,
            config.storage.pool_size,
            config.storage.busy_timeout,
        )?);
        let storage: Arc<dyn EventStorage> = store.clone();
        let ctx = Coordination::new(
            Arc::new(ResourceLockRegistry::new()),
            Arc::new(NotificationBus::new(config.concurrency.notification_workers)),
            config.concurrency.retry_policy(),
            config.concurrency.lock_timeout,
        );
        let registrar = Arc::new(Registrar::new(Arc::clone(&storage), ctx.clone()));
        let mutator = Mutator::new(storage, ctx.clone());
        let batch = RegistrationPool::new(
            config.concurrency.subscription_workers,
            config.concurrency.max_queue_size,
        );
        info!(db = %config.storage.path.display(), "turnstile opened");
        Ok(Self {
            config,
            store,
            ctx,
            registrar,
            mutator,
            batch,
        })
    }

    pub fn close(&self) {
        if self.batch.is_running() {
            self.batch.stop(SHUTDOWN_GRACE);
        }
        if !self.ctx.bus.wait_idle(SHUTDOWN_GRACE) {
            warn!("notifications still in flight at shutdown");
        }
        self.ctx.bus.close();
    }
}

#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub db: Option<PathBuf>,
    pub log: Option<PathBuf>,
}

pub fn open(overrides: &Overrides) -> Result<Turnstile> {
    let mut config = load_config(overrides.config.as_deref())?;
    if let Some(db) = &overrides.db {
        config.storage.path = db.clone();
    }
    let app = Turnstile::open(config)?;
    if let Some(log) = &overrides.log {
        ndjson::attach(&app.ctx.bus, log);
    }
    Ok(app)
}

pub fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("invalid RFC 3339 timestamp: {raw}"))
}

#[derive(Debug, Clone, Default)]
pub struct EventFields {
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_at: Option<String>,
    pub end_at: Option<String>,
    pub capacity: Option<i64>,
    pub status: Option<EventStatus>,
}

pub fn create_event(app: &Turnstile, fields: EventFields) -> Result<()> {
    let new = NewEvent {
        title: fields.title.ok_or_else(|| anyhow!("--title is required"))?,
        description: fields.description.unwrap_or_default(),
        location: fields.location.unwrap_or_default(),
        start_at: fields.start_at.as_deref().map(parse_time).transpose()?,
        end_at: fields.end_at.as_deref().map(parse_time).transpose()?,
        capacity: fields.capacity.ok_or_else(|| anyhow!("--capacity is required"))?,
        status: fields.status.unwrap_or_default(),
    };
    new.validate()?;
    let event = app.store.create_event(&new).context("create event")?;
    println!("event_id: {}", event.event_id);
    println!("version: {}", event.version);
    Ok(())
}

pub fn show_event(app: &Turnstile, event_id: i64) -> Result<()> {
    let event = load_event(app, event_id)?;
    let confirmed = app.store.confirmed_count(event_id)?;
    print_event(&event);
    println!("confirmed: {confirmed}/{}", event.capacity);
    Ok(())
}

pub fn list_events(app: &Turnstile, search: Option<&str>) -> Result<()> {
    let events = match search {
        Some(term) => app.store.search_events(term)?,
        None => app.store.list_events()?,
    };
    if events.is_empty() {
        println!("no events");
    }
    for ev in events {
        println!(
            "{}\t{}\tcapacity={}\tstatus={}\tversion={}",
            ev.event_id, ev.title, ev.capacity, ev.status, ev.version
        );
    }
    Ok(())
}

pub fn update_event(
    app: &Turnstile,
    role: Role,
    event_id: i64,
    expected_version: Option<i64>,
    fields: EventFields,
) -> Result<()> {
    let mut event = load_event(app, event_id)?;
    if let Some(version) = expected_version {
        event.version = version;
    }
    if let Some(title) = fields.title {
        event.title = title;
    }
    if let Some(description) = fields.description {
        event.description = description;
    }
    if let Some(location) = fields.location {
        event.location = location;
    }
    if let Some(start) = fields.start_at {
        event.start_at = Some(parse_time(&start)?);
    }
    if let Some(end) = fields.end_at {
        event.end_at = Some(parse_time(&end)?);
    }
    if let Some(capacity) = fields.capacity {
        event.capacity = capacity;
    }
    if let Some(status) = fields.status {
        event.status = status;
    }
    let updated = app.mutator.update(role, &event)?;
    println!("event_id: {}", updated.event_id);
    println!("version: {}", updated.version);
    Ok(())
}

pub fn delete_event(app: &Turnstile, role: Role, event_id: i64) -> Result<()> {
    if !app.mutator.delete(role, event_id)? {
        bail!("event not found: {event_id}");
    }
    println!("deleted event {event_id}");
    Ok(())
}

pub fn add_participant(app: &Turnstile, new: NewParticipant) -> Result<()> {
    if new.email.trim().is_empty() {
        bail!("participant email must not be empty");
    }
    let p = app
        .store
        .create_participant(&new)
        .with_context(|| format!("add participant {}", new.email))?;
    println!("participant_id: {}", p.participant_id);
    Ok(())
}

pub fn list_participants(app: &Turnstile) -> Result<()> {
    let participants = app.store.list_participants()?;
    if participants.is_empty() {
        println!("no participants");
    }
    for p in participants {
        println!("{}\t{}\t{}", p.participant_id, p.full_name(), p.email);
    }
    Ok(())
}

pub fn register(
    app: &Turnstile,
    event_id: i64,
    participant_id: i64,
    status: RegistrationStatus,
) -> Result<()> {
    let reg = app
        .registrar
        .register_with_status(event_id, participant_id, status)?;
    println!("registration_id: {}", reg.registration_id);
    println!("status: {}", reg.status);
    Ok(())
}

pub fn unregister(app: &Turnstile, event_id: i64, participant_id: i64) -> Result<()> {
    if !app.registrar.unregister(event_id, participant_id)? {
        bail!("participant {participant_id} is not registered for event {event_id}");
    }
    println!("unregistered participant {participant_id} from event {event_id}");
    Ok(())
}

pub fn batch_register(
    app: &Turnstile,
    event_id: i64,
    participants: &[i64],
    timeout: Duration,
) -> Result<()> {
    let requests = participants
        .iter()
        .map(|pid| BatchRequest::confirmed(event_id, *pid))
        .collect::<Vec<_>>();
    let report = register_batch(&app.batch, &app.registrar, &requests, timeout);

    for (req, outcome) in &report.completed {
        match outcome {
            Ok(reg) => println!(
                "participant {}: registered (registration_id={})",
                req.participant_id, reg.registration_id
            ),
            Err(err) => println!("participant {}: {err}", req.participant_id),
        }
    }
    for req in &report.rejected {
        println!("participant {}: rejected, queue full", req.participant_id);
    }
    for req in &report.unfinished {
        println!("participant {}: no result before timeout", req.participant_id);
    }
    println!("admitted: {}/{}", report.admitted().count(), requests.len());
    Ok(())
}

pub fn roster(app: &Turnstile, event_id: i64) -> Result<()> {
    let event = load_event(app, event_id)?;
    let entries = app.store.event_roster(event_id)?;
    println!("event: {} ({})", event.title, event.event_id);
    println!("registrations: {}", entries.len());
    for entry in entries {
        println!(
            "  - {}\t{}\t{}\t{}",
            entry.participant.participant_id,
            entry.participant.full_name(),
            entry.status,
            entry.registered_at.to_rfc3339()
        );
    }
    Ok(())
}

fn load_event(app: &Turnstile, event_id: i64) -> Result<Event> {
    app.store
        .get_event(event_id)?
        .ok_or_else(|| anyhow!("event not found: {event_id}"))
}

fn print_event(event: &Event) {
    println!("event_id: {}", event.event_id);
    println!("title: {}", event.title);
    println!("description: {}", event.description);
    println!("location: {}", event.location);
    println!("start_at: {}", fmt_time(event.start_at));
    println!("end_at: {}", fmt_time(event.end_at));
    println!("capacity: {}", event.capacity);
    println!("status: {}", event.status);
    println!("version: {}", event.version);
}

fn fmt_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
}
