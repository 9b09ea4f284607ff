//! SQLite database shared by the audit log and the permission store.

use crate::{AuditLog, Error, PermissionStore, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS audit_log (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        timestamp TEXT NOT NULL,
        client TEXT NOT NULL,
        plugin TEXT NOT NULL,
        path TEXT NOT NULL,
        action TEXT NOT NULL,
        decision TEXT,
        detail TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_audit_order
        ON audit_log(timestamp, seq);
    CREATE INDEX IF NOT EXISTS idx_audit_client
        ON audit_log(client, timestamp, seq);
    CREATE TRIGGER IF NOT EXISTS audit_log_no_update
        BEFORE UPDATE ON audit_log
        BEGIN SELECT RAISE(ABORT, 'audit log is append-only'); END;
    CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
        BEFORE DELETE ON audit_log
        BEGIN SELECT RAISE(ABORT, 'audit log is append-only'); END;

    CREATE TABLE IF NOT EXISTS grants (
        client TEXT NOT NULL,
        plugin TEXT NOT NULL,
        path TEXT NOT NULL,
        decision TEXT NOT NULL,
        revision INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        last_used_at TEXT,
        session_epoch INTEGER,
        consumed INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (client, plugin, path)
    );
"#;

/// SQLite-backed store for grants and the audit log.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        Ok(Self {
            db: Arc::new(Database::new(conn)?),
        })
    }

    pub fn audit(&self) -> AuditLog {
        AuditLog::new(self.db.clone())
    }

    pub fn permissions(&self) -> PermissionStore {
        PermissionStore::new(self.audit())
    }
}

pub(crate) struct Database {
    state: Mutex<State>,
}

struct State {
    conn: Connection,
    clock: AuditClock,
}

/// Hands out non-decreasing audit timestamps, even if the wall clock steps
/// backwards. Ties are broken by insertion sequence.
pub(crate) struct AuditClock {
    last: DateTime<Utc>,
}

impl AuditClock {
    pub(crate) fn stamp(&mut self, at: DateTime<Utc>) -> DateTime<Utc> {
        let at = truncate_micros(at);
        if at > self.last {
            self.last = at;
        }
        self.last
    }
}

impl Database {
    fn new(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;

        let last: Option<String> =
            conn.query_row("SELECT MAX(timestamp) FROM audit_log", [], |row| row.get(0))?;
        let last = match last {
            Some(ts) => parse_timestamp(&ts)?,
            None => DateTime::<Utc>::MIN_UTC,
        };

        Ok(Self {
            state: Mutex::new(State {
                conn,
                clock: AuditClock { last },
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Unavailable("store lock poisoned".to_string()))
    }

    /// Run a read-only query.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let state = self.lock()?;
        f(&state.conn)
    }

    /// Run `f` inside an immediate transaction. Commits on `Ok`, rolls back
    /// on `Err`.
    pub(crate) fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>, &mut AuditClock) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock()?;
        let State { conn, clock } = &mut *state;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx, clock)?;
        tx.commit()?;
        Ok(value)
    }

    #[cfg(any(test, feature = "test-util"))]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.lock()?.conn.execute_batch(sql)?;
        Ok(())
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Store {
    /// Run raw SQL against the underlying connection. For breaking the
    /// database on purpose in tests.
    #[doc(hidden)]
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.db.execute_batch(sql)
    }
}

pub(crate) fn truncate_micros(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(at.timestamp_micros()).unwrap_or(at)
}

/// Fixed-width RFC 3339, so text order is time order.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn clock_never_goes_backwards() {
        let now = Utc::now();
        let mut clock = AuditClock {
            last: DateTime::<Utc>::MIN_UTC,
        };
        let first = clock.stamp(now);
        let second = clock.stamp(now - Duration::seconds(30));
        assert_eq!(first, second);
        assert!(clock.stamp(now + Duration::seconds(1)) > second);
    }

    #[test]
    fn timestamps_sort_as_text() {
        let a = DateTime::from_timestamp(1_700_000_000, 5_000).unwrap();
        let b = DateTime::from_timestamp(1_700_000_000, 120_000_000).unwrap();
        assert!(format_timestamp(a) < format_timestamp(b));
        assert_eq!(parse_timestamp(&format_timestamp(a)).unwrap(), a);
    }
}
