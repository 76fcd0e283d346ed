use log::{debug, error, warn};
use pathmap_lib::{PathDbError, PathDbResult};
use rusqlite::{Connection, ErrorCode};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::config::PathDbConfig;
use crate::store::SCHEMA_DDL;

/// Guard around the index-store connection.
///
/// Every statement funnels through [`StoreSession::execute`]: a missing
/// session is re-established lazily, and a transient engine failure tears
/// the session down, re-establishes, and retries the statement exactly
/// once. A second failure propagates. Closing the session only parks it;
/// the next call reopens from configuration.
pub(crate) struct StoreSession {
    db_path: PathBuf,
    busy_timeout_ms: u64,
    conn: Mutex<Option<Connection>>,
}

impl StoreSession {
    pub fn open(config: &PathDbConfig) -> PathDbResult<Self> {
        let session = Self {
            db_path: config.db_path.clone(),
            busy_timeout_ms: config.busy_timeout_ms,
            conn: Mutex::new(None),
        };
        // Establish eagerly so a bad configuration surfaces at startup.
        let conn = session.establish()?;
        *session.lock_conn()? = Some(conn);
        Ok(session)
    }

    fn lock_conn(&self) -> PathDbResult<std::sync::MutexGuard<'_, Option<Connection>>> {
        self.conn
            .lock()
            .map_err(|e| PathDbError::Internal(format!("session lock poisoned: {}", e)))
    }

    fn establish(&self) -> PathDbResult<Connection> {
        debug!("open index db: {}", self.db_path.display());
        let conn = Connection::open(&self.db_path).map_err(|e| {
            error!("open index db failed: {}", e);
            PathDbError::DbError(e.to_string())
        })?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = {};",
            self.busy_timeout_ms
        ))
        .map_err(|e| PathDbError::DbError(format!("pragma failed: {}", e)))?;
        // The DDL is idempotent and re-runs on every re-establishment.
        conn.execute_batch(SCHEMA_DDL)
            .map_err(|e| PathDbError::DbError(format!("create schema failed: {}", e)))?;
        Ok(conn)
    }

    pub fn execute<T>(&self, op: impl Fn(&Connection) -> rusqlite::Result<T>) -> PathDbResult<T> {
        let mut guard = self.lock_conn()?;
        if guard.is_none() {
            *guard = Some(self.establish()?);
        }
        let first = {
            let Some(conn) = guard.as_ref() else {
                return Err(PathDbError::Internal("session not established".to_string()));
            };
            op(conn)
        };
        match first {
            Ok(value) => Ok(value),
            Err(e) if is_transient(&e) => {
                warn!("index store unavailable, reopening session and retrying once: {}", e);
                *guard = None;
                let conn = self.establish()?;
                let retried = op(&conn);
                *guard = Some(conn);
                retried.map_err(|e| {
                    error!("retry after session reopen failed: {}", e);
                    PathDbError::DbError(e.to_string())
                })
            }
            Err(e) => Err(PathDbError::DbError(e.to_string())),
        }
    }

    pub fn close(&self) {
        if let Ok(mut guard) = self.conn.lock() {
            if guard.take().is_some() {
                debug!("index db session closed");
            }
        }
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.conn.lock().map(|g| g.is_some()).unwrap_or(false)
    }
}

fn is_transient(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
        ),
        _ => false,
    }
}
