//! Daemon-lifetime state shared by every component.

use crate::codec::TokenCodec;
use crate::locks::KeyLocks;
use crate::prompt::{ConsentPrompt, platform_prompt};
use policy::{EndpointRegistry, IdentityScope};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use storage::{AuditLog, PermissionStore, Store};

/// Engine settings, resolved by the caller from whatever configuration it
/// reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Lifetime of `AllowAlways` and `AllowOnce` tokens.
    pub token_expiry: Duration,
    /// How long a consent prompt may stay unanswered.
    pub consent_timeout: Duration,
    pub identity_scope: IdentityScope,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            token_expiry: Duration::from_secs(24 * 60 * 60),
            consent_timeout: Duration::from_secs(60),
            identity_scope: IdentityScope::default(),
        }
    }
}

/// Identifies one run of the daemon. Session grants and tokens are bound to
/// it and stop working once the daemon restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionEpoch(u64);

impl SessionEpoch {
    pub fn random() -> Self {
        Self(rand::thread_rng().gen_range(1..=u64::MAX))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Everything the engine needs for the lifetime of the daemon.
pub struct Context {
    settings: Settings,
    epoch: SessionEpoch,
    codec: TokenCodec,
    store: Store,
    registry: EndpointRegistry,
    prompt: Arc<dyn ConsentPrompt>,
    pub(crate) locks: KeyLocks,
}

impl Context {
    pub fn builder(store: Store, codec: TokenCodec) -> ContextBuilder {
        ContextBuilder {
            store,
            codec,
            settings: Settings::default(),
            registry: None,
            prompt: None,
            epoch: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn epoch(&self) -> SessionEpoch {
        self.epoch
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn permissions(&self) -> PermissionStore {
        self.store.permissions()
    }

    pub fn audit(&self) -> AuditLog {
        self.store.audit()
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn prompt(&self) -> &Arc<dyn ConsentPrompt> {
        &self.prompt
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &Store {
        &self.store
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("settings", &self.settings)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

pub struct ContextBuilder {
    store: Store,
    codec: TokenCodec,
    settings: Settings,
    registry: Option<EndpointRegistry>,
    prompt: Option<Arc<dyn ConsentPrompt>>,
    epoch: Option<SessionEpoch>,
}

impl ContextBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Defaults to the built-in plugins.
    pub fn registry(mut self, registry: EndpointRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Defaults to the native dialog for this platform.
    pub fn prompt(mut self, prompt: Arc<dyn ConsentPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Defaults to a fresh random epoch.
    pub fn epoch(mut self, epoch: SessionEpoch) -> Self {
        self.epoch = Some(epoch);
        self
    }

    pub fn build(self) -> Arc<Context> {
        Arc::new(Context {
            settings: self.settings,
            epoch: self.epoch.unwrap_or_else(SessionEpoch::random),
            codec: self.codec,
            store: self.store,
            registry: self.registry.unwrap_or_else(EndpointRegistry::with_builtins),
            prompt: self.prompt.unwrap_or_else(platform_prompt),
            locks: KeyLocks::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epochs_are_never_zero() {
        for _ in 0..64 {
            assert_ne!(SessionEpoch::random().get(), 0);
        }
    }

    #[test]
    fn builder_defaults() {
        let ctx = Context::builder(Store::in_memory().unwrap(), TokenCodec::ephemeral()).build();
        assert_eq!(ctx.settings(), &Settings::default());
        assert!(ctx.registry().plugins().any(|p| p.name == "demo"));
        assert_ne!(ctx.epoch().get(), 0);
    }
}
