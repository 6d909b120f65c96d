//! Connection pool
//!
//! Every operation checks out its own connection. With WAL, readers keep
//! working while another connection holds the write lock, and writers on
//! unrelated keys only meet at SQLite's own lock, where they wait up to the
//! busy timeout. An in-memory database lives on a single connection, so its
//! pool holds exactly one.

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// How long a statement waits on a locked database file, and how long a
/// caller waits for a free connection, before giving up.
pub(crate) const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connections kept per on-disk database.
pub(crate) const POOL_SIZE: usize = 4;

pub(crate) struct ConnectionPool {
    /// `None` for in-memory databases, which cannot open a second connection
    path: Option<PathBuf>,
    capacity: usize,
    state: Mutex<PoolState>,
    returned: Condvar,
}

struct PoolState {
    idle: Vec<Connection>,
    /// Connections handed out or idle
    open: usize,
}

impl ConnectionPool {
    /// Pool over a database file. One connection is opened eagerly so a bad
    /// path fails here rather than on first use.
    pub(crate) fn file(path: PathBuf, capacity: usize) -> Result<Self> {
        let first = open_file(&path)?;
        Ok(Self {
            path: Some(path),
            capacity: capacity.max(1),
            state: Mutex::new(PoolState {
                idle: vec![first],
                open: 1,
            }),
            returned: Condvar::new(),
        })
    }

    /// Pool around one existing connection.
    pub(crate) fn single(conn: Connection) -> Self {
        Self {
            path: None,
            capacity: 1,
            state: Mutex::new(PoolState {
                idle: vec![conn],
                open: 1,
            }),
            returned: Condvar::new(),
        }
    }

    /// Run `f` on a checked-out connection and return it to the pool.
    pub(crate) fn with<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.checkout()?;
        let result = f(&mut conn);
        self.checkin(conn);
        result
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolState>> {
        self.state.lock().map_err(|_| poisoned())
    }

    fn checkout(&self) -> Result<Connection> {
        let deadline = Instant::now() + BUSY_TIMEOUT;
        let mut state = self.lock()?;
        loop {
            if let Some(conn) = state.idle.pop() {
                return Ok(conn);
            }
            if let (Some(path), true) = (&self.path, state.open < self.capacity) {
                state.open += 1;
                drop(state);
                return open_file(path).map_err(|e| {
                    if let Ok(mut state) = self.state.lock() {
                        state.open -= 1;
                    }
                    e
                });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::StorageUnavailable(
                    "no database connection became free in time".to_string(),
                ));
            }
            state = self
                .returned
                .wait_timeout(state, remaining)
                .map_err(|_| poisoned())?
                .0;
        }
    }

    fn checkin(&self, conn: Connection) {
        // A poisoned pool drops the connection; later checkouts fail anyway.
        if let Ok(mut state) = self.state.lock() {
            state.idle.push(conn);
            self.returned.notify_one();
        }
    }
}

fn poisoned() -> Error {
    Error::StorageUnavailable("database connection pool poisoned".to_string())
}

fn open_file(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        ",
    )?;
    Ok(conn)
}
