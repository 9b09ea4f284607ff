//! Append-only audit log.

use crate::store::{AuditClock, Database, format_timestamp, parse_timestamp};
use crate::{AuditAction, AuditEvent, Error, GrantKey, Result};
use policy::{ClientIdentity, EndpointRef};
use rusqlite::{Connection, Params, params};
use std::sync::Arc;

const EVENT_COLUMNS: &str = "seq, id, timestamp, client, plugin, path, action, decision, detail";

/// The audit trail. Events are never updated or deleted; ordering is by
/// timestamp, then insertion sequence.
#[derive(Clone)]
pub struct AuditLog {
    db: Arc<Database>,
}

impl AuditLog {
    pub(crate) fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    /// Append an event and return it as stored (sequence assigned, timestamp
    /// clamped to be non-decreasing).
    ///
    /// Errors always propagate: a caller must not treat its operation as
    /// durable unless this succeeds.
    pub fn append(&self, event: AuditEvent) -> Result<AuditEvent> {
        self.db.write(|tx, clock| append_in(tx, clock, event))
    }

    /// All events in order.
    pub fn events(&self) -> Result<Vec<AuditEvent>> {
        self.db.read(|conn| {
            query_events(
                conn,
                &format!("SELECT {EVENT_COLUMNS} FROM audit_log ORDER BY timestamp, seq"),
                [],
            )
        })
    }

    pub fn events_for_client(&self, client: &ClientIdentity) -> Result<Vec<AuditEvent>> {
        self.db.read(|conn| {
            query_events(
                conn,
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM audit_log WHERE client = ?1 ORDER BY timestamp, seq"
                ),
                [client.key()],
            )
        })
    }

    pub fn events_for(&self, key: &GrantKey) -> Result<Vec<AuditEvent>> {
        self.db.read(|conn| {
            query_events(
                conn,
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM audit_log
                     WHERE client = ?1 AND plugin = ?2 AND path = ?3
                     ORDER BY timestamp, seq"
                ),
                params![key.client.key(), key.endpoint.plugin, key.endpoint.path],
            )
        })
    }

    /// The last `limit` events, oldest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db.read(|conn| {
            query_events(
                conn,
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM (
                         SELECT {EVENT_COLUMNS} FROM audit_log
                         ORDER BY timestamp DESC, seq DESC LIMIT ?1
                     ) ORDER BY timestamp, seq"
                ),
                [limit],
            )
        })
    }

    pub fn len(&self) -> Result<u64> {
        self.db.read(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |r| r.get(0))?;
            Ok(count as u64)
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Insert an event inside the caller's transaction.
pub(crate) fn append_in(
    conn: &Connection,
    clock: &mut AuditClock,
    mut event: AuditEvent,
) -> Result<AuditEvent> {
    event.timestamp = clock.stamp(event.timestamp);
    let detail = event
        .detail
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO audit_log (id, timestamp, client, plugin, path, action, decision, detail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.id.to_string(),
            format_timestamp(event.timestamp),
            event.client.key(),
            event.endpoint.plugin,
            event.endpoint.path,
            event.action.as_str(),
            event.decision.map(|d| d.as_str()),
            detail,
        ],
    )?;
    event.seq = conn.last_insert_rowid();
    Ok(event)
}

struct RawEvent {
    seq: i64,
    id: String,
    timestamp: String,
    client: String,
    plugin: String,
    path: String,
    action: String,
    decision: Option<String>,
    detail: Option<String>,
}

impl RawEvent {
    fn decode(self) -> Result<AuditEvent> {
        Ok(AuditEvent {
            id: self
                .id
                .parse()
                .map_err(|e| Error::Corrupt(format!("bad event id {:?}: {e}", self.id)))?,
            seq: self.seq,
            timestamp: parse_timestamp(&self.timestamp)?,
            client: ClientIdentity::from_key(self.client),
            endpoint: EndpointRef::new(self.plugin, self.path),
            action: AuditAction::parse(&self.action)?,
            decision: self
                .decision
                .map(|d| d.parse().map_err(|e| Error::Corrupt(format!("{e}"))))
                .transpose()?,
            detail: self.detail.map(|d| serde_json::from_str(&d)).transpose()?,
        })
    }
}

fn query_events(conn: &Connection, sql: &str, params: impl Params) -> Result<Vec<AuditEvent>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok(RawEvent {
            seq: row.get(0)?,
            id: row.get(1)?,
            timestamp: row.get(2)?,
            client: row.get(3)?,
            plugin: row.get(4)?,
            path: row.get(5)?,
            action: row.get(6)?,
            decision: row.get(7)?,
            detail: row.get(8)?,
        })
    })?;

    let events = rows
        .map(|row| row.map_err(Error::from).and_then(RawEvent::decode))
        .collect::<Result<Vec<_>>>()?;
    Ok(events)
}
