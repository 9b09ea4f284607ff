//! Domain vocabulary for the authorization engine.
//!
//! This crate names the things consent is about: which client is asking
//! ([`ClientIdentity`]), what it is asking for ([`EndpointRef`]), whether
//! that endpoint needs consent at all ([`Visibility`], [`EndpointRegistry`]),
//! and what the human answered ([`ConsentDecision`]).
//!
//! Plugins are plain data ([`PluginManifest`]): the engine only needs the
//! list of endpoints and their classification, never the plugin object.

mod capability;
mod decision;
mod error;
mod identity;
mod registry;

pub use capability::{EndpointRef, EndpointSpec, PluginManifest, Visibility};
pub use decision::ConsentDecision;
pub use error::{Error, Result};
pub use identity::{ClientHints, ClientIdentity, IdentityScope, UNKNOWN_CLIENT};
pub use registry::EndpointRegistry;
