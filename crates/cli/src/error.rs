//! CLI error types.

use crate::config::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

/// CLI errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The database file does not exist yet.
    #[error("database not found at {path}. Run 'gatehouse authorize' first")]
    DatabaseNotFound { path: PathBuf },

    #[error("invalid endpoint '{0}': expected /<plugin>/<path>")]
    InvalidEndpoint(String),

    #[error("unknown endpoint '{0}'. Run 'gatehouse endpoints' to list them")]
    UnknownEndpoint(String),

    #[error("{0}")]
    Usage(String),

    #[error("request rejected: {0}")]
    Rejected(runtime::RejectReason),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Runtime(#[from] runtime::Error),

    #[error(transparent)]
    Storage(#[from] storage::Error),

    #[error(transparent)]
    Policy(#[from] policy::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
