//! Gatehouse runtime: the consent and token engine.
//!
//! Every protected request goes through the [`Gateway`], which tries the
//! cheapest source of truth first:
//!
//! - **Token**: a sealed, short-lived snapshot of a grant the caller already
//!   holds ([`TokenService`]). Always re-checked against the store, so
//!   revocation is immediate.
//! - **Stored grant**: an earlier `AllowAlways` or same-run `AllowSession`
//!   answer, or a remembered deny.
//! - **Consent**: a prompt shown to the human ([`ConsentOrchestrator`]),
//!   deduplicated per (client, endpoint) and bounded by a timeout.
//!
//! All state the components share lives in one [`Context`] created at
//! startup: settings, the token key, the session epoch, the store, the
//! endpoint registry and the prompt.
//!
//! # Example
//!
//! ```no_run
//! use policy::{ClientHints, EndpointRef};
//! use runtime::{AuthRequest, Context, Gateway, TokenCodec};
//! use storage::Store;
//!
//! # async fn example() -> runtime::Result<()> {
//! let store = Store::open("gatehouse.db")?;
//! let codec = TokenCodec::load_or_create(".secret")?;
//! let gateway = Gateway::new(Context::builder(store, codec).build());
//!
//! let request = AuthRequest::new(
//!     ClientHints::named("app-a"),
//!     EndpointRef::new("demo", "/execute"),
//! );
//! let verdict = gateway.authorize(request).await?;
//! println!("allowed: {}", verdict.is_allowed());
//! # Ok(())
//! # }
//! ```

mod codec;
mod consent;
mod context;
mod error;
mod gateway;
mod locks;
pub mod prompt;
mod token;

#[cfg(test)]
mod testing;

pub use codec::{KEY_LEN, TokenCodec};
pub use consent::{ConsentOrchestrator, ConsentOutcome, PendingSummary};
pub use context::{Context, ContextBuilder, SessionEpoch, Settings};
pub use error::{Error, Result};
pub use gateway::{AuthRequest, Gateway, RejectReason, Verdict};
pub use prompt::{ConsentPrompt, PromptError, PromptRequest, platform_prompt};
pub use token::{InvalidReason, Redemption, Token, TokenClaims, TokenService, Validation};
