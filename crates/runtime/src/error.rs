use thiserror::Error;

/// Runtime errors.
///
/// Token rejections are not errors; see [`crate::InvalidReason`] and
/// [`crate::RejectReason`]. An `Err` from the engine means the request could
/// not be decided safely and must be rejected with the error surfaced.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Persistence failed, including audit appends. Never an implicit allow
    /// and never an unaudited deny.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] storage::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("invalid key material: {0}")]
    KeyMaterial(String),

    /// A setting the engine cannot honour, such as a token lifetime past the
    /// end of representable time.
    #[error("invalid settings: {0}")]
    Settings(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn store(message: impl Into<String>) -> Self {
        Error::StoreUnavailable(storage::Error::Unavailable(message.into()))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
