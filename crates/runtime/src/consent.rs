//! Consent orchestration.
//!
//! At most one prompt is outstanding per (client, endpoint). Concurrent
//! requests for the same pair join the pending prompt and all receive the
//! one answer. A pending prompt ends exactly once: by the human's answer,
//! by the timeout, by an operator answer, or by shutdown. Whichever claims
//! it first wins and the rest are no-ops.

use crate::prompt::PromptRequest;
use crate::{Context, Error, Result};
use chrono::{DateTime, Utc};
use policy::{ClientIdentity, ConsentDecision, EndpointRef};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use storage::{AuditEvent, Grant, GrantKey};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// How a consent request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentOutcome {
    /// The human (or an operator) answered. The answer is already persisted.
    Resolved(ConsentDecision),
    /// Nobody answered in time. Nothing was persisted.
    TimedOut,
    /// The daemon shut down first.
    Cancelled,
}

/// A prompt currently waiting for an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSummary {
    pub client: ClientIdentity,
    pub endpoint: EndpointRef,
    pub created_at: DateTime<Utc>,
    pub waiters: usize,
}

#[derive(Debug, Clone, Copy)]
enum Resolution {
    Answered(ConsentDecision),
    NoAnswer(&'static str),
    Cancelled,
}

impl Resolution {
    fn outcome(self) -> ConsentOutcome {
        match self {
            Resolution::Answered(decision) => ConsentOutcome::Resolved(decision),
            Resolution::NoAnswer(_) => ConsentOutcome::TimedOut,
            Resolution::Cancelled => ConsentOutcome::Cancelled,
        }
    }
}

type Waiter = oneshot::Sender<std::result::Result<ConsentOutcome, String>>;

struct PendingConsent {
    id: u64,
    created_at: DateTime<Utc>,
    waiters: Vec<Waiter>,
    /// Set once some path has claimed the right to resolve.
    resolving: bool,
    /// Stops the prompt driver once the entry is resolved elsewhere.
    cancel: CancellationToken,
}

/// Deduplicates consent prompts and persists their answers.
pub struct ConsentOrchestrator {
    ctx: Arc<Context>,
    pending: Mutex<HashMap<GrantKey, PendingConsent>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ConsentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentOrchestrator")
            .field("pending", &self.table().len())
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl ConsentOrchestrator {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    /// Ask for consent, or join the prompt already pending for this pair.
    ///
    /// Returns once the prompt is resolved. A `Resolved` answer has been
    /// persisted by the time this returns; if persisting failed every waiter
    /// gets the error.
    pub async fn request(
        self: &Arc<Self>,
        client: &ClientIdentity,
        endpoint: &EndpointRef,
    ) -> Result<ConsentOutcome> {
        let key = GrantKey::new(client, endpoint);
        let (tx, rx) = oneshot::channel();

        let started = {
            let mut table = self.table();
            // Checked under the table lock so shutdown cannot miss a new entry.
            if self.shutdown.is_cancelled() {
                return Ok(ConsentOutcome::Cancelled);
            }

            match table.get_mut(&key) {
                Some(pending) => {
                    tracing::debug!(%key, waiters = pending.waiters.len() + 1, "joined pending consent");
                    pending.waiters.push(tx);
                    None
                }
                None => {
                    // A prompt may have resolved between the caller's own
                    // grant lookup and here.
                    if let Some(grant) = self.ctx.permissions().get_key(&key)?
                        && grant.is_usable(self.ctx.epoch().get())
                    {
                        return Ok(ConsentOutcome::Resolved(grant.decision));
                    }

                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let cancel = self.shutdown.child_token();
                    table.insert(
                        key.clone(),
                        PendingConsent {
                            id,
                            created_at: Utc::now(),
                            waiters: vec![tx],
                            resolving: false,
                            cancel: cancel.clone(),
                        },
                    );
                    Some((id, cancel))
                }
            }
        };

        if let Some((id, cancel)) = started {
            self.start(key, id, cancel);
        }

        match rx.await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(message)) => Err(Error::store(message)),
            Err(_) => Ok(ConsentOutcome::Cancelled),
        }
    }

    /// Record the prompt and hand it to a driver task.
    fn start(self: &Arc<Self>, key: GrantKey, id: u64, cancel: CancellationToken) {
        let shown = AuditEvent::prompt_shown(&key.client, &key.endpoint);
        if let Err(e) = self.ctx.audit().append(shown) {
            tracing::error!(%key, error = %e, "failed to record consent prompt");
            self.release(&key, id, Err(e.to_string()));
            return;
        }

        tracing::info!(%key, "prompting for consent");
        let this = Arc::clone(self);
        tokio::spawn(async move { this.drive(key, id, cancel).await });
    }

    async fn drive(self: Arc<Self>, key: GrantKey, id: u64, cancel: CancellationToken) {
        let request = self.prompt_request(&key);
        let timeout = self.ctx.settings().consent_timeout;

        let resolution = tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(timeout) => Resolution::NoAnswer("timeout"),
            answer = self.ctx.prompt().prompt_user(&request) => match answer {
                Ok(Some(decision)) => Resolution::Answered(decision),
                Ok(None) => Resolution::NoAnswer("timeout"),
                Err(e) => {
                    tracing::warn!(%key, error = %e, "consent prompt failed");
                    Resolution::NoAnswer("prompt_failed")
                }
            },
        };

        self.resolve(&key, id, resolution).await;
    }

    fn prompt_request(&self, key: &GrantKey) -> PromptRequest {
        let spec = self.ctx.registry().describe(&key.endpoint);
        PromptRequest {
            client: key.client.clone(),
            endpoint: key.endpoint.clone(),
            description: spec.map(|s| s.description.clone()).unwrap_or_default(),
            permissions: spec.map(|s| s.permissions.clone()).unwrap_or_default(),
            timeout: self.ctx.settings().consent_timeout,
        }
    }

    /// Resolve pending prompt `id` for `key`. Returns false if it was already
    /// resolved or claimed by another path.
    async fn resolve(&self, key: &GrantKey, id: u64, resolution: Resolution) -> bool {
        {
            let mut table = self.table();
            match table.get_mut(key) {
                Some(pending) if pending.id == id && !pending.resolving => {
                    pending.resolving = true;
                    pending.cancel.cancel();
                }
                _ => return false,
            }
        }

        let persisted = self.persist(key, resolution).await;
        match &persisted {
            Ok(()) => tracing::info!(%key, outcome = ?resolution.outcome(), "consent resolved"),
            Err(e) => tracing::error!(%key, error = %e, "failed to persist consent outcome"),
        }

        self.release(
            key,
            id,
            persisted
                .map(|()| resolution.outcome())
                .map_err(|e| e.to_string()),
        );
        true
    }

    async fn persist(&self, key: &GrantKey, resolution: Resolution) -> Result<()> {
        let _guard = self.ctx.locks.lock(key).await;
        match resolution {
            Resolution::Answered(decision) => {
                let grant = Grant::new(&key.client, &key.endpoint, decision, self.ctx.epoch().get());
                self.ctx.permissions().put(grant)?;
            }
            Resolution::NoAnswer(reason) => self.record_deny(key, reason)?,
            Resolution::Cancelled => self.record_deny(key, "cancelled")?,
        }
        Ok(())
    }

    /// Transient denies are audited but never stored as grants.
    fn record_deny(&self, key: &GrantKey, reason: &str) -> Result<()> {
        let event = AuditEvent::decided(&key.client, &key.endpoint, ConsentDecision::Deny)
            .with_detail(json!({ "reason": reason }));
        self.ctx.audit().append(event)?;
        Ok(())
    }

    fn release(
        &self,
        key: &GrantKey,
        id: u64,
        result: std::result::Result<ConsentOutcome, String>,
    ) {
        let waiters = {
            let mut table = self.table();
            match table.get(key) {
                Some(pending) if pending.id == id => table
                    .remove(key)
                    .map(|pending| pending.waiters)
                    .unwrap_or_default(),
                _ => Vec::new(),
            }
        };
        for waiter in waiters {
            // A waiter whose caller went away is fine to skip.
            let _ = waiter.send(result.clone());
        }
    }

    /// Answer a pending prompt out of band, as an operator. Returns false if
    /// nothing was pending for this pair.
    pub async fn answer(
        &self,
        client: &ClientIdentity,
        endpoint: &EndpointRef,
        decision: ConsentDecision,
    ) -> bool {
        let key = GrantKey::new(client, endpoint);
        let id = {
            let table = self.table();
            match table.get(&key) {
                Some(pending) if !pending.resolving => pending.id,
                _ => return false,
            }
        };
        self.resolve(&key, id, Resolution::Answered(decision)).await
    }

    /// Prompts currently waiting, oldest first.
    pub fn pending(&self) -> Vec<PendingSummary> {
        let mut all: Vec<_> = self
            .table()
            .iter()
            .map(|(key, pending)| PendingSummary {
                client: key.client.clone(),
                endpoint: key.endpoint.clone(),
                created_at: pending.created_at,
                waiters: pending.waiters.len(),
            })
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Release every pending prompt as cancelled and refuse new ones.
    pub async fn shutdown(&self) {
        let claimable: Vec<(GrantKey, u64)> = {
            let table = self.table();
            self.shutdown.cancel();
            table
                .iter()
                .filter(|(_, pending)| !pending.resolving)
                .map(|(key, pending)| (key.clone(), pending.id))
                .collect()
        };

        tracing::info!(pending = claimable.len(), "consent orchestrator shutting down");
        for (key, id) in claimable {
            self.resolve(&key, id, Resolution::Cancelled).await;
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<GrantKey, PendingConsent>> {
        // Entries are only inserted or removed whole, so a poisoned table is
        // still consistent.
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
