//! Grant table, kept in lockstep with the audit log.
//!
//! Every mutation here commits its grant change and the matching audit event
//! in one SQLite transaction: a grant write without its audit event is never
//! observable, and if the audit insert fails the grant change rolls back.

use crate::audit::append_in;
use crate::store::{AuditClock, format_timestamp, parse_timestamp, truncate_micros};
use crate::{AuditAction, AuditEvent, AuditLog, Error, Grant, GrantKey, Result};
use chrono::{DateTime, Utc};
use policy::{ClientIdentity, ConsentDecision, EndpointRef};
use rusqlite::{Connection, OptionalExtension, Params, params};
use serde_json::{Value, json};

const GRANT_COLUMNS: &str =
    "client, plugin, path, decision, revision, created_at, last_used_at, session_epoch, consumed";

/// Result of trying to use up an `AllowOnce` grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consumption {
    /// This call won; the grant is now spent.
    Consumed(Grant),
    /// Someone else already used it.
    AlreadyConsumed,
    /// The stored grant is no longer the one the caller read.
    Stale,
}

/// Durable table of current grants, keyed by (client, endpoint).
#[derive(Clone)]
pub struct PermissionStore {
    audit: AuditLog,
}

impl PermissionStore {
    pub(crate) fn new(audit: AuditLog) -> Self {
        Self { audit }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn get(&self, client: &ClientIdentity, endpoint: &EndpointRef) -> Result<Option<Grant>> {
        self.audit.db().read(|conn| select_grant(conn, client, endpoint))
    }

    pub fn get_key(&self, key: &GrantKey) -> Result<Option<Grant>> {
        self.get(&key.client, &key.endpoint)
    }

    /// Store a decision, superseding any previous grant for the key, and
    /// record a `Decided` event. Returns the grant as stored.
    pub fn put(&self, grant: Grant) -> Result<Grant> {
        self.put_with_detail(grant, None)
    }

    pub fn put_with_detail(&self, grant: Grant, detail: Option<Value>) -> Result<Grant> {
        self.audit.db().write(|tx, clock| {
            let stored = upsert(tx, grant)?;
            let mut event = AuditEvent::decided(&stored.client, &stored.endpoint, stored.decision)
                .with_timestamp(stored.created_at);
            event.detail = detail;
            append_in(tx, clock, event)?;
            Ok(stored)
        })
    }

    /// Replace every grant the client holds with a `Deny` tombstone, one
    /// `Revoked` event per endpoint, all in one transaction.
    pub fn revoke(&self, client: &ClientIdentity) -> Result<Vec<Grant>> {
        let tombstones = self.audit.db().write(|tx, clock| {
            let held = query_grants(
                tx,
                &format!(
                    "SELECT {GRANT_COLUMNS} FROM grants WHERE client = ?1 ORDER BY plugin, path"
                ),
                [client.key()],
            )?;
            let now = Utc::now();
            held.into_iter()
                .map(|grant| tombstone(tx, clock, grant, now))
                .collect::<Result<Vec<_>>>()
        })?;

        tracing::info!(client = %client, endpoints = tombstones.len(), "revoked client");
        Ok(tombstones)
    }

    /// Revoke a single endpoint. `None` if the client never held a grant for it.
    pub fn revoke_endpoint(
        &self,
        client: &ClientIdentity,
        endpoint: &EndpointRef,
    ) -> Result<Option<Grant>> {
        let tombstone = self.audit.db().write(|tx, clock| {
            select_grant(tx, client, endpoint)?
                .map(|grant| tombstone(tx, clock, grant, Utc::now()))
                .transpose()
        })?;

        if tombstone.is_some() {
            tracing::info!(client = %client, endpoint = %endpoint, "revoked endpoint");
        }
        Ok(tombstone)
    }

    /// Every grant, ordered by client then endpoint.
    pub fn list(&self) -> Result<Vec<Grant>> {
        self.audit.db().read(|conn| {
            query_grants(
                conn,
                &format!("SELECT {GRANT_COLUMNS} FROM grants ORDER BY client, plugin, path"),
                [],
            )
        })
    }

    pub fn list_client(&self, client: &ClientIdentity) -> Result<Vec<Grant>> {
        self.audit.db().read(|conn| {
            query_grants(
                conn,
                &format!(
                    "SELECT {GRANT_COLUMNS} FROM grants WHERE client = ?1 ORDER BY plugin, path"
                ),
                [client.key()],
            )
        })
    }

    /// Record a use of a reusable grant: bump `last_used_at` and append a
    /// `Validated` event. `None` if the stored grant moved on from `grant`.
    pub fn touch(&self, grant: &Grant, at: DateTime<Utc>) -> Result<Option<Grant>> {
        let at = truncate_micros(at);
        self.audit.db().write(|tx, clock| {
            let Some(mut current) = select_grant(tx, &grant.client, &grant.endpoint)? else {
                return Ok(None);
            };
            if current.revision != grant.revision {
                return Ok(None);
            }

            tx.execute(
                "UPDATE grants SET last_used_at = ?4
                 WHERE client = ?1 AND plugin = ?2 AND path = ?3",
                params![
                    current.client.key(),
                    current.endpoint.plugin,
                    current.endpoint.path,
                    format_timestamp(at),
                ],
            )?;
            current.last_used_at = Some(at);

            append_in(
                tx,
                clock,
                AuditEvent::validated(&current.client, &current.endpoint, current.decision)
                    .with_timestamp(at),
            )?;
            Ok(Some(current))
        })
    }

    /// Spend an `AllowOnce` grant. Of any number of concurrent callers, at
    /// most one observes [`Consumption::Consumed`].
    pub fn consume(&self, grant: &Grant, at: DateTime<Utc>) -> Result<Consumption> {
        let at = truncate_micros(at);
        self.audit.db().write(|tx, clock| {
            let Some(mut current) = select_grant(tx, &grant.client, &grant.endpoint)? else {
                return Ok(Consumption::Stale);
            };
            if current.revision != grant.revision
                || current.decision != ConsentDecision::AllowOnce
            {
                return Ok(Consumption::Stale);
            }
            if current.consumed {
                return Ok(Consumption::AlreadyConsumed);
            }

            let changed = tx.execute(
                "UPDATE grants SET consumed = 1, last_used_at = ?4
                 WHERE client = ?1 AND plugin = ?2 AND path = ?3 AND consumed = 0",
                params![
                    current.client.key(),
                    current.endpoint.plugin,
                    current.endpoint.path,
                    format_timestamp(at),
                ],
            )?;
            if changed != 1 {
                return Ok(Consumption::AlreadyConsumed);
            }
            current.consumed = true;
            current.last_used_at = Some(at);

            append_in(
                tx,
                clock,
                AuditEvent::validated(&current.client, &current.endpoint, current.decision)
                    .with_detail(json!({ "use": "once" }))
                    .with_timestamp(at),
            )?;
            Ok(Consumption::Consumed(current))
        })
    }
}

fn upsert(conn: &Connection, mut grant: Grant) -> Result<Grant> {
    let previous: Option<i64> = conn
        .query_row(
            "SELECT revision FROM grants WHERE client = ?1 AND plugin = ?2 AND path = ?3",
            params![grant.client.key(), grant.endpoint.plugin, grant.endpoint.path],
            |row| row.get(0),
        )
        .optional()?;

    grant.revision = previous.map_or(1, |r| r + 1);
    grant.created_at = truncate_micros(grant.created_at);
    grant.last_used_at = grant.last_used_at.map(truncate_micros);

    conn.execute(
        "INSERT OR REPLACE INTO grants
         (client, plugin, path, decision, revision, created_at, last_used_at, session_epoch, consumed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            grant.client.key(),
            grant.endpoint.plugin,
            grant.endpoint.path,
            grant.decision.as_str(),
            grant.revision,
            format_timestamp(grant.created_at),
            grant.last_used_at.map(format_timestamp),
            grant.session_epoch.map(|e| e as i64),
            grant.consumed,
        ],
    )?;
    Ok(grant)
}

fn tombstone(
    conn: &Connection,
    clock: &mut AuditClock,
    grant: Grant,
    now: DateTime<Utc>,
) -> Result<Grant> {
    let tombstone = upsert(
        conn,
        Grant {
            decision: ConsentDecision::Deny,
            created_at: now,
            session_epoch: None,
            consumed: false,
            ..grant
        },
    )?;
    append_in(
        conn,
        clock,
        AuditEvent::new(&tombstone.client, &tombstone.endpoint, AuditAction::Revoked)
            .with_decision(ConsentDecision::Deny)
            .with_timestamp(now),
    )?;
    Ok(tombstone)
}

fn select_grant(
    conn: &Connection,
    client: &ClientIdentity,
    endpoint: &EndpointRef,
) -> Result<Option<Grant>> {
    let mut grants = query_grants(
        conn,
        &format!(
            "SELECT {GRANT_COLUMNS} FROM grants WHERE client = ?1 AND plugin = ?2 AND path = ?3"
        ),
        params![client.key(), endpoint.plugin, endpoint.path],
    )?;
    Ok(grants.pop())
}

struct RawGrant {
    client: String,
    plugin: String,
    path: String,
    decision: String,
    revision: i64,
    created_at: String,
    last_used_at: Option<String>,
    session_epoch: Option<i64>,
    consumed: bool,
}

impl RawGrant {
    fn decode(self) -> Result<Grant> {
        Ok(Grant {
            client: ClientIdentity::from_key(self.client),
            endpoint: EndpointRef::new(self.plugin, self.path),
            decision: self
                .decision
                .parse()
                .map_err(|e| Error::Corrupt(format!("{e}")))?,
            revision: self.revision,
            created_at: parse_timestamp(&self.created_at)?,
            last_used_at: self.last_used_at.as_deref().map(parse_timestamp).transpose()?,
            session_epoch: self.session_epoch.map(|e| e as u64),
            consumed: self.consumed,
        })
    }
}

fn query_grants(conn: &Connection, sql: &str, params: impl Params) -> Result<Vec<Grant>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok(RawGrant {
            client: row.get(0)?,
            plugin: row.get(1)?,
            path: row.get(2)?,
            decision: row.get(3)?,
            revision: row.get(4)?,
            created_at: row.get(5)?,
            last_used_at: row.get(6)?,
            session_epoch: row.get(7)?,
            consumed: row.get(8)?,
        })
    })?;

    let grants = rows
        .map(|row| row.map_err(Error::from).and_then(RawGrant::decode))
        .collect::<Result<Vec<_>>>()?;
    Ok(grants)
}
