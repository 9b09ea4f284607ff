//! Caller identity.
//!
//! Identities are derived from hints the caller supplies about itself. They
//! are labels used to key grants, not proof of who is calling: the consent
//! prompt is the control, not identity verification.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Name used when a caller supplies no usable hint.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// How identities compare.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityScope {
    /// Exact, case-sensitive name match.
    #[default]
    Name,
    /// Name plus process id; each process of a program is a separate client.
    Process,
}

/// Self-reported caller information, as supplied by the transport.
#[derive(Debug, Clone, Default)]
pub struct ClientHints {
    /// Explicit client id (takes precedence over the process name).
    pub client_id: Option<String>,
    pub process_name: Option<String>,
    pub pid: Option<u32>,
}

impl ClientHints {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            client_id: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn process(name: impl Into<String>, pid: u32) -> Self {
        Self {
            client_id: None,
            process_name: Some(name.into()),
            pid: Some(pid),
        }
    }
}

/// A client label. Equality and hashing use [`ClientIdentity::key`] only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientIdentity {
    key: String,
    name: String,
    pid: Option<u32>,
}

impl ClientIdentity {
    /// An identity compared by name.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            key: name.clone(),
            name,
            pid: None,
        }
    }

    /// Rebuild an identity from a stored key.
    pub fn from_key(key: impl Into<String>) -> Self {
        Self::named(key)
    }

    pub fn from_hints(hints: &ClientHints, scope: IdentityScope) -> Self {
        let name = hints
            .client_id
            .as_deref()
            .or(hints.process_name.as_deref())
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(UNKNOWN_CLIENT)
            .to_string();

        let key = match (scope, hints.pid) {
            (IdentityScope::Process, Some(pid)) => format!("{name}:{pid}"),
            _ => name.clone(),
        };

        Self {
            key,
            name,
            pid: hints.pid,
        }
    }

    /// The string grants are keyed by.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Human-readable name, shown in consent prompts.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl PartialEq for ClientIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for ClientIdentity {}

impl Hash for ClientIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl PartialOrd for ClientIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClientIdentity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_client_id_wins() {
        let hints = ClientHints {
            client_id: Some("app-a".into()),
            process_name: Some("python3".into()),
            pid: Some(42),
        };
        let id = ClientIdentity::from_hints(&hints, IdentityScope::Name);
        assert_eq!(id.key(), "app-a");
        assert_eq!(id.pid(), Some(42));
    }

    #[test]
    fn name_scope_ignores_pid() {
        let a = ClientIdentity::from_hints(&ClientHints::process("app-a", 1), IdentityScope::Name);
        let b = ClientIdentity::from_hints(&ClientHints::process("app-a", 2), IdentityScope::Name);
        assert_eq!(a, b);
    }

    #[test]
    fn process_scope_includes_pid() {
        let a = ClientIdentity::from_hints(&ClientHints::process("app-a", 1), IdentityScope::Process);
        let b = ClientIdentity::from_hints(&ClientHints::process("app-a", 2), IdentityScope::Process);
        assert_ne!(a, b);
        assert_eq!(a.key(), "app-a:1");
        assert_eq!(a.name(), "app-a");
    }

    #[test]
    fn names_are_case_sensitive() {
        assert_ne!(ClientIdentity::named("App-A"), ClientIdentity::named("app-a"));
    }

    #[test]
    fn missing_hints_fall_back_to_unknown() {
        let id = ClientIdentity::from_hints(&ClientHints::default(), IdentityScope::Name);
        assert_eq!(id.key(), UNKNOWN_CLIENT);

        let blank = ClientHints::named("   ");
        assert_eq!(
            ClientIdentity::from_hints(&blank, IdentityScope::Name).key(),
            UNKNOWN_CLIENT
        );
    }
}
