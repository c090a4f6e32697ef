use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::sync::Arc;
use std::time::Duration;
use tideway_core::{
    config::SqliteConfig,
    error::{Result, TidewayError},
};

use crate::schema;

/// SQLite-backed implementation of every tideway store trait
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    config: Arc<SqliteConfig>,
}

impl SqliteStore {
    /// Open (or create) the database at `cfg.path` and initialize the schema
    pub fn open(cfg: SqliteConfig) -> Result<Self> {
        if let Some(parent) = cfg.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            &cfg.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(map_sqlite_err)?;

        Self::configure_connection(&conn, &cfg)?;
        schema::init(&conn)?;

        tracing::debug!(path = %cfg.path.display(), "Opened SQLite store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config: Arc::new(cfg),
        })
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    pub fn schema_version(&self) -> Result<u32> {
        let conn = self.conn.lock();
        schema::schema_version(&conn)
    }

    fn configure_connection(conn: &Connection, cfg: &SqliteConfig) -> Result<()> {
        if cfg.wal_mode {
            // journal_mode returns a row, so pragma_update_and_check is required
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
                .map_err(|e| TidewayError::Config(e.to_string()))?;
        }

        conn.pragma_update(None, "synchronous", cfg.synchronous.as_pragma())
            .map_err(|e| TidewayError::Config(e.to_string()))?;

        conn.busy_timeout(Duration::from_millis(cfg.busy_timeout_ms))
            .map_err(|e| TidewayError::Config(e.to_string()))?;

        Ok(())
    }

    /// Run `f` against the connection on the blocking thread pool
    pub(crate) async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| TidewayError::InvalidState(format!("SQLite task failed: {}", e)))?
    }
}

/// Map a rusqlite error onto the tideway taxonomy
///
/// Lock contention is transient; everything else is a store error.
pub(crate) fn map_sqlite_err(err: rusqlite::Error) -> TidewayError {
    match &err {
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(inner.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            TidewayError::Transient(err.to_string())
        }
        _ => TidewayError::Store(err.to_string()),
    }
}

/// Convert a stored millisecond timestamp back to UTC
pub(crate) fn from_millis(ms: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(ms).unwrap_or(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH)
}
