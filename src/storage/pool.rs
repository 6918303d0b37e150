use crate::error::StorageError;
use crate::storage::schema;
use parking_lot::{Condvar, Mutex};
use rusqlite::Connection;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct PoolState {
    idle: Vec<Connection>,
    open: usize,
}

pub struct ConnectionPool {
    path: PathBuf,
    max_size: usize,
    busy_timeout: Duration,
    checkout_timeout: Duration,
    state: Mutex<PoolState>,
    returned: Condvar,
}

impl ConnectionPool {
    pub fn new(path: &Path, max_size: usize, busy_timeout: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            max_size: max_size.max(1),
            busy_timeout,
            checkout_timeout: busy_timeout,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                open: 0,
            }),
            returned: Condvar::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().open
    }

    pub fn get(&self) -> Result<PooledConnection<'_>, StorageError> {
        let deadline = Instant::now() + self.checkout_timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(conn) = state.idle.pop() {
                return Ok(PooledConnection {
                    pool: self,
                    conn: Some(conn),
                });
            }
            if state.open < self.max_size {
                state.open += 1;
                drop(state);
                return match self.connect() {
                    Ok(conn) => Ok(PooledConnection {
                        pool: self,
                        conn: Some(conn),
                    }),
                    Err(err) => {
                        self.state.lock().open -= 1;
                        self.returned.notify_one();
                        Err(err)
                    }
                };
            }
            if self.returned.wait_until(&mut state, deadline).timed_out() && state.idle.is_empty()
            {
                warn!(
                    max_size = self.max_size,
                    "connection pool exhausted after {:?}", self.checkout_timeout
                );
                return Err(StorageError::PoolExhausted(self.checkout_timeout));
            }
        }
    }

    fn connect(&self) -> Result<Connection, StorageError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        schema::configure(&conn)?;
        debug!(path = %self.path.display(), "opened sqlite connection");
        Ok(conn)
    }

    fn put_back(&self, conn: Connection) {
        self.state.lock().idle.push(conn);
        self.returned.notify_one();
    }
}

pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `None` after drop has taken it.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }
}
