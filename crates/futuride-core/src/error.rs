//! Error types for futuride-core

use crate::result::ErrorKind;
use thiserror::Error;

/// Message shown to callers for any infrastructure fault.
pub const INTERNAL_ERROR_MESSAGE: &str = "An internal error occurred. Please try again.";

#[derive(Error, Debug)]
pub enum FuturideError {
    #[error("rate limit exceeded")]
    RateLimited,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("validation rejected: {0}")]
    ValidationRejected(String),

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}

impl FuturideError {
    /// Boundary classification of this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited => ErrorKind::RateLimited,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::ValidationRejected(_) => ErrorKind::ValidationRejected,
            Self::Workspace(_)
            | Self::Runtime(_)
            | Self::Config(_)
            | Self::Protocol(_)
            | Self::Io(_)
            | Self::Nix(_) => ErrorKind::InternalError,
        }
    }

    /// Text safe to hand back to an untrusted caller.
    ///
    /// Internal faults collapse to a generic message so workspace paths and host
    /// details stay in the server log.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::RateLimited => "Rate limit exceeded. Please try again later.".into(),
            Self::InvalidInput(reason) | Self::ValidationRejected(reason) => reason.clone(),
            _ => INTERNAL_ERROR_MESSAGE.into(),
        }
    }
}
