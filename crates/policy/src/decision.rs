//! Consent decisions.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The answer a human gave to a consent prompt.
///
/// Exactly one decision is active per (client, endpoint) pair; a newer
/// decision supersedes the older one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentDecision {
    /// Valid for exactly one successful use.
    AllowOnce,
    /// Valid until the daemon restarts.
    AllowSession,
    /// Valid until revoked.
    AllowAlways,
    Deny,
}

impl ConsentDecision {
    pub fn is_allow(self) -> bool {
        !matches!(self, ConsentDecision::Deny)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConsentDecision::AllowOnce => "allow_once",
            ConsentDecision::AllowSession => "allow_session",
            ConsentDecision::AllowAlways => "allow_always",
            ConsentDecision::Deny => "deny",
        }
    }
}

impl fmt::Display for ConsentDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsentDecision {
    type Err = Error;

    /// Accepts the stored snake_case names plus the short CLI forms
    /// (`once`, `session`, `always`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow_once" | "once" => Ok(ConsentDecision::AllowOnce),
            "allow_session" | "session" => Ok(ConsentDecision::AllowSession),
            "allow_always" | "always" => Ok(ConsentDecision::AllowAlways),
            "deny" => Ok(ConsentDecision::Deny),
            other => Err(Error::UnknownDecision(other.to_string())),
        }
    }
}
