//! Token issue and validation.
//!
//! A token is a sealed snapshot of a grant: the client, the endpoint, the
//! decision, the grant revision and, for session grants, the epoch it was
//! issued in. A token is only as good as the grant behind it; validation
//! always re-reads the store, so revoking or overwriting a grant kills every
//! token issued from it.

use crate::{Context, Error, Result};
use chrono::{DateTime, Duration, Utc};
use policy::{ClientIdentity, ConsentDecision, EndpointRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use storage::{AuditEvent, Consumption, Grant, GrantKey};
use uuid::Uuid;

/// Session tokens are bounded by the epoch, not by time.
const SESSION_LIFETIME_DAYS: i64 = 365 * 100;

/// An opaque bearer token.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(..)")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Token {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// The sealed contents of a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub id: Uuid,
    pub client: ClientIdentity,
    pub endpoint: EndpointRef,
    pub decision: ConsentDecision,
    pub revision: i64,
    pub session_epoch: Option<u64>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Why a token was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidReason {
    /// Not sealed by this daemon's key, altered, or not a token at all.
    Malformed,
    Expired,
    /// The grant behind it was revoked, overwritten, or belongs to an
    /// earlier run of the daemon.
    Revoked,
    /// A once-token that has already been used.
    Consumed,
    /// Sealed for a different client or endpoint than the request.
    Mismatch,
}

impl InvalidReason {
    pub fn as_str(self) -> &'static str {
        match self {
            InvalidReason::Malformed => "malformed",
            InvalidReason::Expired => "expired",
            InvalidReason::Revoked => "revoked",
            InvalidReason::Consumed => "consumed",
            InvalidReason::Mismatch => "mismatch",
        }
    }
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid(TokenClaims),
    Invalid(InvalidReason),
}

impl Validation {
    pub fn decision(&self) -> Option<ConsentDecision> {
        match self {
            Validation::Valid(claims) => Some(claims.decision),
            Validation::Invalid(_) => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid(_))
    }
}

/// Outcome of using the stored grant for a request directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redemption {
    /// The grant allowed the request. Once-grants are spent and carry no
    /// token.
    Used {
        decision: ConsentDecision,
        token: Option<Token>,
    },
    /// A remembered deny.
    Denied,
    /// The once-grant was spent by a concurrent request first.
    Spent,
    /// Nothing usable is stored; the human has to be asked.
    Missing,
}

/// Issues and validates tokens against the permission store.
#[derive(Debug, Clone)]
pub struct TokenService {
    ctx: Arc<Context>,
}

impl TokenService {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Issue a token bound to the stored grant for `(client, endpoint)`.
    ///
    /// The token snapshots the current grant revision. If no grant with this
    /// decision is stored the token is still issued, but it will never
    /// validate.
    pub fn issue(
        &self,
        client: &ClientIdentity,
        endpoint: &EndpointRef,
        decision: ConsentDecision,
    ) -> Result<Token> {
        let stored = self.ctx.permissions().get(client, endpoint)?;
        let grant = match stored {
            Some(grant) if grant.decision == decision => grant,
            _ => Grant::new(client, endpoint, decision, self.ctx.epoch().get()),
        };
        self.issue_at(&grant, Utc::now())
    }

    /// Issue a token for a grant as it is stored now.
    pub fn issue_for(&self, grant: &Grant) -> Result<Token> {
        self.issue_at(grant, Utc::now())
    }

    pub fn issue_at(&self, grant: &Grant, now: DateTime<Utc>) -> Result<Token> {
        let lifetime = match grant.decision {
            ConsentDecision::AllowSession => Duration::days(SESSION_LIFETIME_DAYS),
            _ => Duration::from_std(self.ctx.settings().token_expiry)
                .map_err(|_| Error::Settings("token expiry out of range".into()))?,
        };
        let expires_at = now.checked_add_signed(lifetime).ok_or_else(|| {
            Error::Settings(format!("token expiry of {lifetime} overflows the clock"))
        })?;

        let claims = TokenClaims {
            id: Uuid::new_v4(),
            client: grant.client.clone(),
            endpoint: grant.endpoint.clone(),
            decision: grant.decision,
            revision: grant.revision,
            session_epoch: grant.session_epoch,
            issued_at: now,
            expires_at,
        };

        let payload =
            serde_json::to_vec(&claims).map_err(|e| Error::Crypto(e.to_string()))?;
        Ok(Token(self.ctx.codec().seal(&payload)?))
    }

    /// Open a token without checking it against the store.
    pub fn inspect(&self, token: &Token) -> Option<TokenClaims> {
        let payload = self.ctx.codec().open(token.as_str())?;
        serde_json::from_slice(&payload).ok()
    }

    /// Validate a token and record the use.
    ///
    /// A valid once-token is consumed by this call.
    pub async fn validate(&self, token: &Token) -> Result<Validation> {
        let Some(claims) = self.inspect(token) else {
            return Ok(Validation::Invalid(InvalidReason::Malformed));
        };
        self.check(claims, Utc::now()).await
    }

    /// Validate a token presented for a specific request. A token sealed for
    /// another client or endpoint is a `Mismatch` and is not consumed.
    pub async fn validate_for(
        &self,
        token: &Token,
        client: &ClientIdentity,
        endpoint: &EndpointRef,
    ) -> Result<Validation> {
        self.validate_for_at(token, client, endpoint, Utc::now())
            .await
    }

    pub async fn validate_for_at(
        &self,
        token: &Token,
        client: &ClientIdentity,
        endpoint: &EndpointRef,
        now: DateTime<Utc>,
    ) -> Result<Validation> {
        let Some(claims) = self.inspect(token) else {
            return Ok(Validation::Invalid(InvalidReason::Malformed));
        };
        if claims.client != *client || claims.endpoint != *endpoint {
            return Ok(Validation::Invalid(InvalidReason::Mismatch));
        }
        self.check(claims, now).await
    }

    async fn check(&self, claims: TokenClaims, now: DateTime<Utc>) -> Result<Validation> {
        if now > claims.expires_at {
            self.ctx
                .audit()
                .append(AuditEvent::expired(&claims.client, &claims.endpoint))?;
            return Ok(Validation::Invalid(InvalidReason::Expired));
        }

        let key = GrantKey::new(&claims.client, &claims.endpoint);
        let _guard = self.ctx.locks.lock(&key).await;

        let permissions = self.ctx.permissions();
        let Some(grant) = permissions.get_key(&key)? else {
            return Ok(Validation::Invalid(InvalidReason::Revoked));
        };
        if !self.matches(&grant, &claims) {
            return Ok(Validation::Invalid(InvalidReason::Revoked));
        }

        if grant.decision == ConsentDecision::AllowOnce {
            return Ok(match permissions.consume(&grant, now)? {
                Consumption::Consumed(_) => Validation::Valid(claims),
                Consumption::AlreadyConsumed => Validation::Invalid(InvalidReason::Consumed),
                Consumption::Stale => Validation::Invalid(InvalidReason::Revoked),
            });
        }

        Ok(match permissions.touch(&grant, now)? {
            Some(_) => Validation::Valid(claims),
            None => Validation::Invalid(InvalidReason::Revoked),
        })
    }

    /// Whether the stored grant is still the one the token was issued from.
    fn matches(&self, grant: &Grant, claims: &TokenClaims) -> bool {
        if grant.decision != claims.decision
            || grant.revision != claims.revision
            || !grant.decision.is_allow()
        {
            return false;
        }
        if grant.decision == ConsentDecision::AllowSession {
            let epoch = Some(self.ctx.epoch().get());
            return grant.session_epoch == epoch && claims.session_epoch == epoch;
        }
        true
    }

    /// Use the stored grant for a request that has no valid token.
    ///
    /// Allowing grants are recorded as used; a once-grant is consumed and a
    /// reusable grant yields a fresh token.
    pub async fn redeem(
        &self,
        client: &ClientIdentity,
        endpoint: &EndpointRef,
    ) -> Result<Redemption> {
        let key = GrantKey::new(client, endpoint);
        let _guard = self.ctx.locks.lock(&key).await;

        let permissions = self.ctx.permissions();
        let Some(grant) = permissions.get_key(&key)? else {
            return Ok(Redemption::Missing);
        };
        let now = Utc::now();

        match grant.decision {
            ConsentDecision::Deny => Ok(Redemption::Denied),
            ConsentDecision::AllowOnce if grant.consumed => Ok(Redemption::Missing),
            ConsentDecision::AllowOnce => Ok(match permissions.consume(&grant, now)? {
                Consumption::Consumed(_) => Redemption::Used {
                    decision: ConsentDecision::AllowOnce,
                    token: None,
                },
                Consumption::AlreadyConsumed => Redemption::Spent,
                Consumption::Stale => Redemption::Missing,
            }),
            _ if !grant.is_usable(self.ctx.epoch().get()) => Ok(Redemption::Missing),
            decision => match permissions.touch(&grant, now)? {
                Some(current) => Ok(Redemption::Used {
                    decision,
                    token: Some(self.issue_at(&current, now)?),
                }),
                None => Ok(Redemption::Missing),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TokenCodec;
    use crate::context::SessionEpoch;
    use storage::{AuditAction, Store};

    fn setup() -> (Arc<Context>, TokenService) {
        let ctx = Context::builder(Store::in_memory().unwrap(), TokenCodec::ephemeral())
            .prompt(Arc::new(crate::testing::NeverPrompt))
            .build();
        (ctx.clone(), TokenService::new(ctx))
    }

    fn app_a() -> ClientIdentity {
        ClientIdentity::named("app-a")
    }

    fn execute() -> EndpointRef {
        EndpointRef::new("demo", "/execute")
    }

    fn grant(ctx: &Context, decision: ConsentDecision) -> Grant {
        ctx.permissions()
            .put(Grant::new(&app_a(), &execute(), decision, ctx.epoch().get()))
            .unwrap()
    }

    #[test]
    fn unrepresentable_expiry_is_an_error() {
        let ctx = Context::builder(Store::in_memory().unwrap(), TokenCodec::ephemeral())
            .settings(crate::Settings {
                token_expiry: std::time::Duration::from_secs(10_000_000_000 * 3600),
                ..Default::default()
            })
            .prompt(Arc::new(crate::testing::NeverPrompt))
            .build();
        let tokens = TokenService::new(ctx.clone());
        let always = grant(&ctx, ConsentDecision::AllowAlways);

        assert!(matches!(tokens.issue_for(&always), Err(Error::Settings(_))));
    }

    #[tokio::test]
    async fn issued_token_validates() {
        let (ctx, tokens) = setup();
        grant(&ctx, ConsentDecision::AllowAlways);

        let token = tokens
            .issue(&app_a(), &execute(), ConsentDecision::AllowAlways)
            .unwrap();
        let validation = tokens.validate(&token).await.unwrap();
        assert_eq!(validation.decision(), Some(ConsentDecision::AllowAlways));

        // Still valid on reuse, and each use is audited.
        assert!(tokens.validate(&token).await.unwrap().is_valid());
        let validated = ctx
            .audit()
            .events()
            .unwrap()
            .into_iter()
            .filter(|e| e.action == AuditAction::Validated)
            .count();
        assert_eq!(validated, 2);
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let (_ctx, tokens) = setup();
        let validation = tokens.validate(&Token::new("gh1.AAAA")).await.unwrap();
        assert_eq!(validation, Validation::Invalid(InvalidReason::Malformed));

        let foreign = TokenCodec::ephemeral().seal(b"{}").unwrap();
        let validation = tokens.validate(&Token::new(foreign)).await.unwrap();
        assert_eq!(validation, Validation::Invalid(InvalidReason::Malformed));
    }

    #[tokio::test]
    async fn expiry_is_checked_and_audited() {
        let (ctx, tokens) = setup();
        let stored = grant(&ctx, ConsentDecision::AllowAlways);

        let issued_at = Utc::now() - Duration::hours(25);
        let token = tokens.issue_at(&stored, issued_at).unwrap();
        assert_eq!(
            tokens.validate(&token).await.unwrap(),
            Validation::Invalid(InvalidReason::Expired)
        );

        let last = ctx.audit().recent(1).unwrap().remove(0);
        assert_eq!(last.action, AuditAction::Expired);
    }

    #[tokio::test]
    async fn revoke_invalidates_and_regrant_does_not_revive() {
        let (ctx, tokens) = setup();
        let stored = grant(&ctx, ConsentDecision::AllowAlways);
        let token = tokens.issue_for(&stored).unwrap();

        ctx.permissions().revoke(&app_a()).unwrap();
        assert_eq!(
            tokens.validate(&token).await.unwrap(),
            Validation::Invalid(InvalidReason::Revoked)
        );

        grant(&ctx, ConsentDecision::AllowAlways);
        assert_eq!(
            tokens.validate(&token).await.unwrap(),
            Validation::Invalid(InvalidReason::Revoked)
        );
    }

    #[tokio::test]
    async fn once_token_is_single_use() {
        let (ctx, tokens) = setup();
        let stored = grant(&ctx, ConsentDecision::AllowOnce);
        let token = tokens.issue_for(&stored).unwrap();

        assert!(tokens.validate(&token).await.unwrap().is_valid());
        assert_eq!(
            tokens.validate(&token).await.unwrap(),
            Validation::Invalid(InvalidReason::Consumed)
        );
    }

    #[tokio::test]
    async fn concurrent_once_validation_has_one_winner() {
        let (ctx, tokens) = setup();
        let stored = grant(&ctx, ConsentDecision::AllowOnce);
        let token = tokens.issue_for(&stored).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tokens = tokens.clone();
                let token = token.clone();
                tokio::spawn(async move { tokens.validate(&token).await.unwrap() })
            })
            .collect();

        let mut valid = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Validation::Valid(_) => valid += 1,
                Validation::Invalid(reason) => assert_eq!(reason, InvalidReason::Consumed),
            }
        }
        assert_eq!(valid, 1);
    }

    #[tokio::test]
    async fn session_tokens_die_with_the_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("gatehouse.db");
        let key = dir.path().join(".secret");

        let first = Context::builder(Store::open(&db).unwrap(), TokenCodec::load_or_create(&key).unwrap())
            .prompt(Arc::new(crate::testing::NeverPrompt))
            .epoch(SessionEpoch::from_raw(1))
            .build();
        let stored = grant(&first, ConsentDecision::AllowSession);
        let token = TokenService::new(first.clone()).issue_for(&stored).unwrap();
        assert!(TokenService::new(first.clone()).validate(&token).await.unwrap().is_valid());
        drop(first);

        let second = Context::builder(Store::open(&db).unwrap(), TokenCodec::load_or_create(&key).unwrap())
            .prompt(Arc::new(crate::testing::NeverPrompt))
            .epoch(SessionEpoch::from_raw(2))
            .build();
        let tokens = TokenService::new(second);
        assert_eq!(
            tokens.validate(&token).await.unwrap(),
            Validation::Invalid(InvalidReason::Revoked)
        );
        assert_eq!(
            tokens.redeem(&app_a(), &execute()).await.unwrap(),
            Redemption::Missing
        );
    }

    #[tokio::test]
    async fn mismatched_binding_is_not_consumed() {
        let (ctx, tokens) = setup();
        let stored = grant(&ctx, ConsentDecision::AllowOnce);
        let token = tokens.issue_for(&stored).unwrap();

        let other = ClientIdentity::named("app-b");
        assert_eq!(
            tokens.validate_for(&token, &other, &execute()).await.unwrap(),
            Validation::Invalid(InvalidReason::Mismatch)
        );
        assert!(
            tokens
                .validate_for(&token, &app_a(), &execute())
                .await
                .unwrap()
                .is_valid()
        );
    }

    #[tokio::test]
    async fn redeem_follows_the_stored_decision() {
        let (ctx, tokens) = setup();
        assert_eq!(
            tokens.redeem(&app_a(), &execute()).await.unwrap(),
            Redemption::Missing
        );

        grant(&ctx, ConsentDecision::AllowAlways);
        let Redemption::Used { decision, token } = tokens.redeem(&app_a(), &execute()).await.unwrap()
        else {
            panic!("expected the grant to be used");
        };
        assert_eq!(decision, ConsentDecision::AllowAlways);
        assert!(tokens.validate(&token.unwrap()).await.unwrap().is_valid());

        grant(&ctx, ConsentDecision::AllowOnce);
        assert_eq!(
            tokens.redeem(&app_a(), &execute()).await.unwrap(),
            Redemption::Used {
                decision: ConsentDecision::AllowOnce,
                token: None
            }
        );
        assert_eq!(
            tokens.redeem(&app_a(), &execute()).await.unwrap(),
            Redemption::Missing
        );

        grant(&ctx, ConsentDecision::Deny);
        assert_eq!(
            tokens.redeem(&app_a(), &execute()).await.unwrap(),
            Redemption::Denied
        );
    }

    #[tokio::test]
    async fn store_failure_is_an_error() {
        let (ctx, tokens) = setup();
        let stored = grant(&ctx, ConsentDecision::AllowAlways);
        let token = tokens.issue_for(&stored).unwrap();

        ctx.store().execute_batch("DROP TABLE grants;").unwrap();
        assert!(matches!(
            tokens.validate(&token).await,
            Err(Error::StoreUnavailable(_))
        ));
    }
}
