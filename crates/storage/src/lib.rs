//! SQLite-backed persistence for grants and the audit trail.
//!
//! This crate holds the two durable pieces of the authorization engine:
//!
//! 1. **Audit Log**: the append-only record of every prompt, decision,
//!    validation, revocation and expiry. It is the source of truth for "who
//!    was allowed what, and when". Rows are never edited or deleted; the
//!    schema enforces this with triggers.
//!
//! 2. **Permission Store**: the table of current grants keyed by
//!    (client, endpoint), built on top of the audit log: each grant mutation
//!    and its audit event commit in the same transaction.
//!
//! # Core Concepts
//!
//! ## Store
//!
//! The [`Store`] opens the database and hands out [`AuditLog`] and
//! [`PermissionStore`] handles that share one connection.
//!
//! ## Grant
//!
//! A [`Grant`] is the authoritative decision for a [`GrantKey`]. Overwrites
//! bump its `revision`; revocation writes a `Deny` tombstone rather than
//! deleting the row.
//!
//! ## AuditEvent
//!
//! An [`AuditEvent`] records one [`AuditAction`]. Events are ordered by
//! timestamp, then insertion sequence.
//!
//! # Example
//!
//! ```no_run
//! use policy::{ClientIdentity, ConsentDecision, EndpointRef};
//! use storage::{Grant, Store};
//!
//! let store = Store::open("gatehouse.db")?;
//! let permissions = store.permissions();
//!
//! let client = ClientIdentity::named("app-a");
//! let endpoint = EndpointRef::new("vault", "/secret");
//! permissions.put(Grant::new(&client, &endpoint, ConsentDecision::AllowAlways, 0))?;
//!
//! for grant in permissions.list()? {
//!     println!("{} {} {}", grant.client, grant.endpoint, grant.decision);
//! }
//!
//! permissions.revoke(&client)?;
//! for event in store.audit().events()? {
//!     println!("{}: {:?}", event.timestamp, event.action);
//! }
//! # Ok::<(), storage::Error>(())
//! ```

mod audit;
mod error;
mod event;
mod grant;
mod permissions;
mod store;

pub use audit::AuditLog;
pub use error::{Error, Result};
pub use event::{AuditAction, AuditEvent};
pub use grant::{Grant, GrantKey};
pub use permissions::{Consumption, PermissionStore};
pub use store::Store;
