//! Audit event types.

use chrono::{DateTime, Utc};
use policy::{ClientIdentity, ConsentDecision, EndpointRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{Error, Result};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A consent prompt was put in front of the approver.
    PromptShown,
    /// A decision was recorded (human answer, timeout, or operator grant).
    Decided,
    /// A token or grant was honored for a request.
    Validated,
    /// A grant was replaced by a deny tombstone.
    Revoked,
    /// A token was presented after its expiry.
    Expired,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::PromptShown => "prompt_shown",
            AuditAction::Decided => "decided",
            AuditAction::Validated => "validated",
            AuditAction::Revoked => "revoked",
            AuditAction::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "prompt_shown" => Ok(AuditAction::PromptShown),
            "decided" => Ok(AuditAction::Decided),
            "validated" => Ok(AuditAction::Validated),
            "revoked" => Ok(AuditAction::Revoked),
            "expired" => Ok(AuditAction::Expired),
            other => Err(Error::Corrupt(format!("unknown audit action {other:?}"))),
        }
    }
}

/// An immutable record of a security-relevant decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    /// Insertion sequence; assigned by the log on append, zero before.
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
    pub client: ClientIdentity,
    pub endpoint: EndpointRef,
    pub action: AuditAction,
    pub decision: Option<ConsentDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl AuditEvent {
    pub fn new(client: &ClientIdentity, endpoint: &EndpointRef, action: AuditAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            timestamp: Utc::now(),
            client: client.clone(),
            endpoint: endpoint.clone(),
            action,
            decision: None,
            detail: None,
        }
    }

    pub fn with_decision(mut self, decision: ConsentDecision) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn prompt_shown(client: &ClientIdentity, endpoint: &EndpointRef) -> Self {
        Self::new(client, endpoint, AuditAction::PromptShown)
    }

    pub fn decided(
        client: &ClientIdentity,
        endpoint: &EndpointRef,
        decision: ConsentDecision,
    ) -> Self {
        Self::new(client, endpoint, AuditAction::Decided).with_decision(decision)
    }

    pub fn validated(
        client: &ClientIdentity,
        endpoint: &EndpointRef,
        decision: ConsentDecision,
    ) -> Self {
        Self::new(client, endpoint, AuditAction::Validated).with_decision(decision)
    }

    pub fn expired(client: &ClientIdentity, endpoint: &EndpointRef) -> Self {
        Self::new(client, endpoint, AuditAction::Expired)
    }

    /// The `reason` field of the detail, if any.
    pub fn reason(&self) -> Option<&str> {
        self.detail.as_ref()?.get("reason")?.as_str()
    }
}
