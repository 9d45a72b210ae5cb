//! Backing database handle
//!
//! One lazily-opened read/write connection used by writers, plus a small pool
//! of read-only connections so concurrent readers never queue behind each
//! other. The handle may be closed by the controller's idle policy at any
//! time between operations, and a file swapped out from under an open
//! connection leaves it stale. `with_conn` and `with_read_conn` hide both:
//! they reopen on demand and retry a stale operation a bounded number of
//! times.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};

/// How long SQLite waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle read-only connections kept for reuse.
const MAX_IDLE_READERS: usize = 4;

/// Lazily opened connection to the backing file.
pub struct DbHandle {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
    /// Idle read-only connections
    readers: Mutex<Vec<Connection>>,
    /// Bumped by `close`; readers opened before it are not returned to the pool
    generation: AtomicU64,
    max_attempts: AtomicU32,
    /// Number of times a connection has been opened
    opens: AtomicU64,
}

impl DbHandle {
    pub fn new<P: AsRef<Path>>(path: P, max_attempts: u32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            conn: Mutex::new(None),
            readers: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            max_attempts: AtomicU32::new(max_attempts.max(1)),
            opens: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().is_some() || !self.readers.lock().is_empty()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.load(Ordering::Relaxed)
    }

    pub fn set_max_attempts(&self, attempts: u32) {
        self.max_attempts.store(attempts.max(1), Ordering::Relaxed);
    }

    /// Connections opened since the handle was created.
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    /// Drop every connection. The next operation reopens.
    pub(crate) fn close(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let writer = self.conn.lock().take();
        let readers = std::mem::take(&mut *self.readers.lock());
        if writer.is_some() || !readers.is_empty() {
            debug!(path = %self.path.display(), readers = readers.len(), "closed database handle");
        }
    }

    /// Create the database file if it does not exist and return a connection to it.
    pub(crate) fn create(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&self.path)?;
        configure(&conn)?;
        Ok(conn)
    }

    /// Run `f` against the open connection, reopening and retrying while the
    /// failure is a stale-handle error.
    pub fn with_conn<T, F>(&self, mut f: F) -> StoreResult<T>
    where
        F: FnMut(&mut Connection) -> StoreResult<T>,
    {
        let attempts = self.max_attempts();
        let mut slot = self.conn.lock();

        for attempt in 1..=attempts {
            if slot.is_none() {
                match self.open() {
                    Ok(conn) => *slot = Some(conn),
                    Err(e) if e.is_stale_handle() => {
                        warn!(attempt, error = %e, "could not open database handle");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let Some(conn) = slot.as_mut() else { continue };
            match f(conn) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_stale_handle() => {
                    warn!(attempt, error = %e, "stale database handle, reopening");
                    *slot = None;
                }
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::StaleHandle { attempts })
    }

    /// Run `f` against a read-only connection of its own, with the same
    /// retry policy as `with_conn`. Never touches the writer connection.
    pub fn with_read_conn<T, F>(&self, mut f: F) -> StoreResult<T>
    where
        F: FnMut(&Connection) -> StoreResult<T>,
    {
        let attempts = self.max_attempts();

        for attempt in 1..=attempts {
            let generation = self.generation.load(Ordering::Acquire);
            let pooled = self.readers.lock().pop();
            let conn = match pooled {
                Some(conn) => conn,
                None => match self.open_reader() {
                    Ok(conn) => conn,
                    Err(e) if e.is_stale_handle() => {
                        warn!(attempt, error = %e, "could not open read handle");
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };

            match f(&conn) {
                Ok(value) => {
                    self.park_reader(conn, generation);
                    return Ok(value);
                }
                Err(e) if e.is_stale_handle() => {
                    warn!(attempt, error = %e, "stale read handle, reopening");
                }
                Err(e) => {
                    self.park_reader(conn, generation);
                    return Err(e);
                }
            }
        }

        Err(StoreError::StaleHandle { attempts })
    }

    fn park_reader(&self, conn: Connection, generation: u64) {
        let mut pool = self.readers.lock();
        if self.generation.load(Ordering::Acquire) == generation && pool.len() < MAX_IDLE_READERS {
            pool.push(conn);
        }
    }

    fn open_reader(&self) -> StoreResult<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.path, flags)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        self.opens.fetch_add(1, Ordering::Relaxed);
        debug!(path = %self.path.display(), "opened read handle");
        Ok(conn)
    }

    fn open(&self) -> StoreResult<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.path, flags)?;
        configure(&conn)?;
        self.opens.fetch_add(1, Ordering::Relaxed);
        debug!(path = %self.path.display(), "opened database handle");
        Ok(conn)
    }
}

/// Rollback-journal mode keeps every committed change in the main file,
/// which is what the watcher fingerprints.
fn configure(conn: &Connection) -> StoreResult<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update(None, "journal_mode", "DELETE")?;
    Ok(())
}
