use crate::error::StorageError;
use crate::model::{
    Event, EventStatus, NewEvent, NewParticipant, Participant, Registration, RegistrationStatus,
    RosterEntry,
};
use crate::storage::pool::ConnectionPool;
use crate::storage::{AdmissionOutcome, EventStorage, IsolationLevel, VersionedWrite, schema};
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

type StoreResult<T> = std::result::Result<T, StorageError>;

const EVENT_COLUMNS: &str =
    "event_id, title, description, location, start_at, end_at, capacity, status, version";
const PARTICIPANT_COLUMNS: &str =
    "p.participant_id, p.first_name, p.last_name, p.email, p.phone, p.identifier";

impl ToSql for EventStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for EventStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: anyhow::Error| FromSqlError::Other(e.into()))
    }
}

impl ToSql for RegistrationStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RegistrationStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: anyhow::Error| FromSqlError::Other(e.into()))
    }
}

fn behavior(isolation: IsolationLevel) -> TransactionBehavior {
    match isolation {
        IsolationLevel::ReadCommitted => TransactionBehavior::Deferred,
        IsolationLevel::Serializable => TransactionBehavior::Immediate,
    }
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        event_id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        location: row.get(3)?,
        start_at: row.get(4)?,
        end_at: row.get(5)?,
        capacity: row.get(6)?,
        status: row.get(7)?,
        version: row.get(8)?,
    })
}

fn participant_from_row(row: &Row<'_>) -> rusqlite::Result<Participant> {
    Ok(Participant {
        participant_id: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        email: row.get(3)?,
        phone: row.get(4)?,
        identifier: row.get(5)?,
    })
}

pub struct SqliteStore {
    pool: ConnectionPool,
}

impl SqliteStore {
    pub fn open(path: &Path, pool_size: usize, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create db parent dir {}", parent.display()))?;
        }
        let pool = ConnectionPool::new(path, pool_size, busy_timeout);
        {
            let conn = pool
                .get()
                .with_context(|| format!("open sqlite db {}", path.display()))?;
            schema::migrate(&conn).with_context(|| format!("migrate {}", path.display()))?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn create_event(&self, ev: &NewEvent) -> StoreResult<Event> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO events (title, description, location, start_at, end_at, capacity, status, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                ev.title,
                ev.description,
                ev.location,
                ev.start_at,
                ev.end_at,
                ev.capacity,
                ev.status
            ],
        )?;
        let event_id = conn.last_insert_rowid();
        Ok(Event {
            event_id,
            title: ev.title.clone(),
            description: ev.description.clone(),
            location: ev.location.clone(),
            start_at: ev.start_at,
            end_at: ev.end_at,
            capacity: ev.capacity,
            status: ev.status,
            version: 0,
        })
    }

    pub fn list_events(&self) -> StoreResult<Vec<Event>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events ORDER BY start_at DESC, event_id ASC"
        ))?;
        let rows = stmt
            .query_map([], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn search_events(&self, term: &str) -> StoreResult<Vec<Event>> {
        let conn = self.pool.get()?;
        let pattern = format!("%{}%", term.trim());
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE title LIKE ?1 OR description LIKE ?1 OR location LIKE ?1
             ORDER BY start_at DESC, event_id ASC"
        ))?;
        let rows = stmt
            .query_map(params![pattern], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn create_participant(&self, p: &NewParticipant) -> StoreResult<Participant> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO participants (first_name, last_name, email, phone, identifier)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![p.first_name, p.last_name, p.email, p.phone, p.identifier],
        )?;
        Ok(Participant {
            participant_id: conn.last_insert_rowid(),
            first_name: p.first_name.clone(),
            last_name: p.last_name.clone(),
            email: p.email.clone(),
            phone: p.phone.clone(),
            identifier: p.identifier.clone(),
        })
    }

    pub fn get_participant(&self, participant_id: i64) -> StoreResult<Option<Participant>> {
        let conn = self.pool.get()?;
        conn.query_row(
            &format!("SELECT {PARTICIPANT_COLUMNS} FROM participants p WHERE p.participant_id = ?1"),
            params![participant_id],
            participant_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_participants(&self) -> StoreResult<Vec<Participant>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants p ORDER BY p.last_name, p.first_name"
        ))?;
        let rows = stmt
            .query_map([], participant_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_registration(
        &self,
        event_id: i64,
        participant_id: i64,
    ) -> StoreResult<Option<Registration>> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT registration_id, event_id, participant_id, status, registered_at
             FROM registrations WHERE event_id = ?1 AND participant_id = ?2",
            params![event_id, participant_id],
            |row| {
                Ok(Registration {
                    registration_id: row.get(0)?,
                    event_id: row.get(1)?,
                    participant_id: row.get(2)?,
                    status: row.get(3)?,
                    registered_at: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn confirmed_count(&self, event_id: i64) -> StoreResult<i64> {
        let conn = self.pool.get()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM registrations WHERE event_id = ?1 AND status = 'confirmed'",
            params![event_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn registration_count(&self, event_id: i64, participant_id: i64) -> StoreResult<i64> {
        let conn = self.pool.get()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM registrations WHERE event_id = ?1 AND participant_id = ?2",
            params![event_id, participant_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn event_roster(&self, event_id: i64) -> StoreResult<Vec<RosterEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PARTICIPANT_COLUMNS}, r.status, r.registered_at
             FROM participants p
             INNER JOIN registrations r ON p.participant_id = r.participant_id
             WHERE r.event_id = ?1
             ORDER BY r.registered_at DESC, r.registration_id DESC"
        ))?;
        let rows = stmt
            .query_map(params![event_id], |row| {
                Ok(RosterEntry {
                    participant: participant_from_row(row)?,
                    status: row.get(6)?,
                    registered_at: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn participant_events(
        &self,
        participant_id: i64,
    ) -> StoreResult<Vec<(Event, RegistrationStatus)>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT e.event_id, e.title, e.description, e.location, e.start_at, e.end_at,
                    e.capacity, e.status, e.version, r.status
             FROM events e
             INNER JOIN registrations r ON e.event_id = r.event_id
             WHERE r.participant_id = ?1
             ORDER BY e.start_at DESC, e.event_id ASC",
        )?;
        let rows = stmt
            .query_map(params![participant_id], |row| {
                Ok((event_from_row(row)?, row.get(9)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl EventStorage for SqliteStore {
    fn get_event(&self, event_id: i64) -> StoreResult<Option<Event>> {
        let conn = self.pool.get()?;
        conn.query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id = ?1"),
            params![event_id],
            event_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    fn admit(
        &self,
        event_id: i64,
        participant_id: i64,
        status: RegistrationStatus,
        isolation: IsolationLevel,
    ) -> StoreResult<AdmissionOutcome> {
        let mut conn = self.pool.get()?;
        // Dropping `tx` without commit rolls back.
        let tx = conn.transaction_with_behavior(behavior(isolation))?;

        let seats = tx
            .query_row(
                "SELECT capacity,
                        (SELECT COUNT(*) FROM registrations
                         WHERE event_id = ?1 AND status = 'confirmed')
                 FROM events WHERE event_id = ?1",
                params![event_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        let Some((capacity, confirmed)) = seats else {
            return Ok(AdmissionOutcome::EventMissing);
        };
        if confirmed >= capacity {
            return Ok(AdmissionOutcome::Full {
                capacity,
                confirmed,
            });
        }

        let existing = tx
            .query_row(
                "SELECT registration_id FROM registrations WHERE event_id = ?1 AND participant_id = ?2",
                params![event_id, participant_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(AdmissionOutcome::Duplicate);
        }

        let participant_exists = tx
            .query_row(
                "SELECT 1 FROM participants WHERE participant_id = ?1",
                params![participant_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !participant_exists {
            return Ok(AdmissionOutcome::ParticipantMissing);
        }

        let registered_at = Utc::now();
        tx.execute(
            "INSERT INTO registrations (event_id, participant_id, status, registered_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![event_id, participant_id, status, registered_at],
        )?;
        let registration_id = tx.last_insert_rowid();
        tx.commit()?;
        debug!(event_id, participant_id, registration_id, confirmed, capacity, "registration committed");

        Ok(AdmissionOutcome::Admitted(Registration {
            registration_id,
            event_id,
            participant_id,
            status,
            registered_at,
        }))
    }

    fn remove_registration(&self, event_id: i64, participant_id: i64) -> StoreResult<bool> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute(
            "DELETE FROM registrations WHERE event_id = ?1 AND participant_id = ?2",
            params![event_id, participant_id],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn update_event_if_version(&self, event: &Event) -> StoreResult<VersionedWrite> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE events
             SET title = ?1, description = ?2, location = ?3, start_at = ?4, end_at = ?5,
                 capacity = ?6, status = ?7, version = version + 1
             WHERE event_id = ?8 AND version = ?9",
            params![
                event.title,
                event.description,
                event.location,
                event.start_at,
                event.end_at,
                event.capacity,
                event.status,
                event.event_id,
                event.version
            ],
        )?;
        let outcome = if changed == 1 {
            VersionedWrite::Applied {
                new_version: event.version + 1,
            }
        } else {
            let exists = tx
                .query_row(
                    "SELECT 1 FROM events WHERE event_id = ?1",
                    params![event.event_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                VersionedWrite::Stale
            } else {
                VersionedWrite::Missing
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    fn delete_event(&self, event_id: i64) -> StoreResult<bool> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = tx.execute("DELETE FROM events WHERE event_id = ?1", params![event_id])?;
        tx.commit()?;
        Ok(removed > 0)
    }
}
