//! Policy error types.

use thiserror::Error;

/// Policy errors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A plugin manifest is structurally invalid.
    #[error("invalid manifest: {0}")]
    Invalid(String),

    /// Failed to parse a plugin manifest.
    #[error("failed to parse manifest: {0}")]
    Parse(String),

    /// A plugin with the same name is already registered.
    #[error("plugin already registered: {0}")]
    DuplicatePlugin(String),

    /// Two endpoints resolve to the same reference.
    #[error("endpoint declared twice: {0}")]
    DuplicateEndpoint(String),

    /// A consent decision name was not recognized.
    #[error("unknown consent decision: {0}")]
    UnknownDecision(String),

    /// An I/O error occurred while reading manifests.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
