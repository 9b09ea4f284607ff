//! Persisted permission records.

use chrono::{DateTime, Utc};
use policy::{ClientIdentity, ConsentDecision, EndpointRef};
use serde::{Deserialize, Serialize};

/// The (client, endpoint) pair a grant, a token and a pending prompt are
/// keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GrantKey {
    pub client: ClientIdentity,
    pub endpoint: EndpointRef,
}

impl GrantKey {
    pub fn new(client: &ClientIdentity, endpoint: &EndpointRef) -> Self {
        Self {
            client: client.clone(),
            endpoint: endpoint.clone(),
        }
    }
}

impl std::fmt::Display for GrantKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.client, self.endpoint)
    }
}

/// The authoritative permission record for a (client, endpoint) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub client: ClientIdentity,
    pub endpoint: EndpointRef,
    pub decision: ConsentDecision,
    /// Bumped by the store on every overwrite. Tokens snapshot it, so a token
    /// issued before a revoke stays dead after a later re-grant.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Set only for `AllowSession`: the epoch of the run that granted it.
    pub session_epoch: Option<u64>,
    /// Set once an `AllowOnce` grant has been used.
    pub consumed: bool,
}

impl Grant {
    /// A fresh grant. `epoch` is recorded only for session grants.
    pub fn new(
        client: &ClientIdentity,
        endpoint: &EndpointRef,
        decision: ConsentDecision,
        epoch: u64,
    ) -> Self {
        Self {
            client: client.clone(),
            endpoint: endpoint.clone(),
            decision,
            revision: 0,
            created_at: Utc::now(),
            last_used_at: None,
            session_epoch: (decision == ConsentDecision::AllowSession).then_some(epoch),
            consumed: false,
        }
    }

    pub fn key(&self) -> GrantKey {
        GrantKey::new(&self.client, &self.endpoint)
    }

    /// Whether the grant currently permits a request in the run with the
    /// given session epoch.
    pub fn is_usable(&self, epoch: u64) -> bool {
        match self.decision {
            ConsentDecision::AllowAlways => true,
            ConsentDecision::AllowSession => self.session_epoch == Some(epoch),
            ConsentDecision::AllowOnce => !self.consumed,
            ConsentDecision::Deny => false,
        }
    }
}
