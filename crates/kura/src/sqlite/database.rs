use kura_core::{Result, WorldError};
use rusqlite::{Connection, ErrorCode};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    run_id   TEXT    NOT NULL,
    sequence INTEGER NOT NULL,
    kind     TEXT    NOT NULL,
    body     BLOB    NOT NULL,
    PRIMARY KEY (run_id, sequence)
);
CREATE TABLE IF NOT EXISTS stream_chunks (
    name  TEXT    NOT NULL,
    idx   INTEGER NOT NULL,
    owner TEXT    NOT NULL,
    data  BLOB    NOT NULL,
    eof   INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (name, idx)
);
CREATE INDEX IF NOT EXISTS stream_chunks_owner ON stream_chunks (owner, name);
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A SQLite connection shared by the log and streamer of one world.
///
/// Statements run on the blocking pool so async callers never block the
/// runtime on disk I/O.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl fmt::Debug for SqliteDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteDatabase")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteDatabase {
    /// Opens (or creates) the database file in WAL mode and applies the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(sql_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(sql_err)?;
        debug!("Opened sqlite world at {}", path.display());
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// A private database that disappears with the last clone.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| WorldError::transient("sqlite connection lock poisoned"))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| WorldError::transient(format!("sqlite task failed: {e}")))?
    }
}

pub(crate) fn sql_err(error: rusqlite::Error) -> WorldError {
    WorldError::transient(format!("sqlite: {error}"))
}

pub(crate) fn is_constraint_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::ConstraintViolation
    )
}

pub(crate) fn to_sql_index(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| WorldError::Codec(format!("index {value} out of range")))
}
