use rusqlite::{Connection, Result};

pub fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

pub fn migrate(conn: &Connection) -> Result<()> {
    configure(conn)?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS events (
            event_id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            location TEXT NOT NULL DEFAULT '',
            start_at TEXT,
            end_at TEXT,
            capacity INTEGER NOT NULL CHECK(capacity > 0),
            status TEXT NOT NULL CHECK(status IN ('active','planned','finished','cancelled')),
            version INTEGER NOT NULL DEFAULT 0 CHECK(version >= 0)
        );

        CREATE TABLE IF NOT EXISTS participants (
            participant_id INTEGER PRIMARY KEY AUTOINCREMENT,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL DEFAULT '',
            email TEXT NOT NULL UNIQUE,
            phone TEXT,
            identifier TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS registrations (
            registration_id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id INTEGER NOT NULL REFERENCES events(event_id) ON DELETE CASCADE,
            participant_id INTEGER NOT NULL REFERENCES participants(participant_id) ON DELETE CASCADE,
            status TEXT NOT NULL CHECK(status IN ('confirmed','cancelled','pending')),
            registered_at TEXT NOT NULL,
            UNIQUE(event_id, participant_id)
        );

        CREATE INDEX IF NOT EXISTS idx_registrations_event_status ON registrations(event_id, status);
        CREATE INDEX IF NOT EXISTS idx_registrations_participant ON registrations(participant_id);
        ",
    )?;

    Ok(())
}
