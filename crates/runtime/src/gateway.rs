//! The per-request entry point for the transport layer.

use crate::consent::{ConsentOrchestrator, ConsentOutcome};
use crate::token::{InvalidReason, Redemption, Token, TokenService, Validation};
use crate::{Context, Result};
use policy::{ClientHints, ClientIdentity, ConsentDecision, EndpointRef, Visibility};
use std::fmt;
use std::sync::Arc;

/// One request as seen by the transport.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub hints: ClientHints,
    pub endpoint: EndpointRef,
    pub token: Option<Token>,
}

impl AuthRequest {
    pub fn new(hints: ClientHints, endpoint: EndpointRef) -> Self {
        Self {
            hints,
            endpoint,
            token: None,
        }
    }

    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// The grant behind the presented token was revoked and the revoke is
    /// still in force.
    Revoked,
    /// A once-grant was already used.
    Consumed,
    /// Nobody answered the prompt in time. The caller may retry.
    Timeout,
    Denied,
    /// The daemon is shutting down.
    Cancelled,
    UnknownEndpoint,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::Revoked => "revoked",
            RejectReason::Consumed => "consumed",
            RejectReason::Timeout => "timeout",
            RejectReason::Denied => "denied",
            RejectReason::Cancelled => "cancelled",
            RejectReason::UnknownEndpoint => "unknown_endpoint",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow {
        /// `None` for public endpoints.
        decision: Option<ConsentDecision>,
        /// Token to hand back to the caller. Absent for public endpoints and
        /// for once-grants, which are spent by this request.
        token: Option<Token>,
    },
    Reject {
        reason: RejectReason,
        /// Why the presented token, if any, was not accepted.
        token: Option<InvalidReason>,
    },
}

impl Verdict {
    fn public() -> Self {
        Verdict::Allow {
            decision: None,
            token: None,
        }
    }

    fn reject(reason: RejectReason, token: Option<InvalidReason>) -> Self {
        Verdict::Reject { reason, token }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow { .. })
    }

    pub fn token(&self) -> Option<&Token> {
        match self {
            Verdict::Allow { token, .. } => token.as_ref(),
            Verdict::Reject { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            Verdict::Allow { .. } => None,
            Verdict::Reject { reason, .. } => Some(*reason),
        }
    }
}

/// Decides every request: cached token first, then the stored grant, and
/// only then a consent prompt.
#[derive(Debug, Clone)]
pub struct Gateway {
    ctx: Arc<Context>,
    tokens: TokenService,
    consent: Arc<ConsentOrchestrator>,
}

impl Gateway {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            tokens: TokenService::new(ctx.clone()),
            consent: ConsentOrchestrator::new(ctx.clone()),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn consent(&self) -> &Arc<ConsentOrchestrator> {
        &self.consent
    }

    /// Authorize one request.
    ///
    /// Blocks while a consent prompt is pending. An `Err` means the store
    /// failed and the request must be rejected with the error surfaced.
    pub async fn authorize(&self, request: AuthRequest) -> Result<Verdict> {
        let AuthRequest {
            hints,
            endpoint,
            token,
        } = request;

        match self.ctx.registry().classify(&endpoint) {
            Some(Visibility::Public) => return Ok(Verdict::public()),
            Some(Visibility::Protected) => {}
            None => {
                tracing::warn!(%endpoint, "request for unknown endpoint");
                return Ok(Verdict::reject(RejectReason::UnknownEndpoint, None));
            }
        }

        let client = ClientIdentity::from_hints(&hints, self.ctx.settings().identity_scope);

        let mut token_failure = None;
        if let Some(token) = token {
            match self.tokens.validate_for(&token, &client, &endpoint).await? {
                Validation::Valid(claims) => {
                    tracing::debug!(%client, %endpoint, decision = %claims.decision, "token accepted");
                    let token = (claims.decision != ConsentDecision::AllowOnce).then_some(token);
                    return Ok(Verdict::Allow {
                        decision: Some(claims.decision),
                        token,
                    });
                }
                Validation::Invalid(reason) => {
                    tracing::debug!(%client, %endpoint, %reason, "token not accepted");
                    token_failure = Some(reason);
                }
            }
        }

        match self.tokens.redeem(&client, &endpoint).await? {
            Redemption::Used { decision, token } => {
                tracing::debug!(%client, %endpoint, %decision, "allowed by stored grant");
                return Ok(Verdict::Allow {
                    decision: Some(decision),
                    token,
                });
            }
            Redemption::Denied => {
                let reason = if token_failure == Some(InvalidReason::Revoked) {
                    RejectReason::Revoked
                } else {
                    RejectReason::Denied
                };
                tracing::info!(%client, %endpoint, %reason, "rejected by stored deny");
                return Ok(Verdict::reject(reason, token_failure));
            }
            Redemption::Spent => {
                return Ok(Verdict::reject(RejectReason::Consumed, token_failure));
            }
            Redemption::Missing => {}
        }

        let verdict = match self.consent.request(&client, &endpoint).await? {
            ConsentOutcome::Resolved(ConsentDecision::Deny) => {
                Verdict::reject(RejectReason::Denied, token_failure)
            }
            ConsentOutcome::Resolved(decision) => {
                match self.tokens.redeem(&client, &endpoint).await? {
                    Redemption::Used { decision, token } => Verdict::Allow {
                        decision: Some(decision),
                        token,
                    },
                    Redemption::Denied => Verdict::reject(RejectReason::Denied, token_failure),
                    Redemption::Spent => Verdict::reject(RejectReason::Consumed, token_failure),
                    // Another waiter on the same prompt used the once-grant.
                    Redemption::Missing if decision == ConsentDecision::AllowOnce => {
                        Verdict::reject(RejectReason::Consumed, token_failure)
                    }
                    // Revoked between the answer and this request's turn.
                    Redemption::Missing => Verdict::reject(RejectReason::Revoked, token_failure),
                }
            }
            ConsentOutcome::TimedOut => Verdict::reject(RejectReason::Timeout, token_failure),
            ConsentOutcome::Cancelled => Verdict::reject(RejectReason::Cancelled, token_failure),
        };

        if let Some(reason) = verdict.reason() {
            tracing::info!(%client, %endpoint, %reason, "request rejected");
        }
        Ok(verdict)
    }

    /// Stop prompting and release every waiting request.
    pub async fn shutdown(&self) {
        self.consent.shutdown().await;
    }
}
