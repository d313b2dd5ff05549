//! Error taxonomy shared by every dispatcher.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification used by the HTTP layer to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller can fix the request.
    Validation,
    /// The capability is not present in this deployment.
    Unavailable,
    /// Anything else: model loading, device memory, generation failures.
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    Validation(String),
    /// The pipeline returned something other than an image.
    #[error("unexpected pipeline output: {0}")]
    UnexpectedOutput(String),
    #[error("{0} is not available in this deployment")]
    CapabilityUnavailable(String),
    #[error("failed to load pipeline `{key}`: {source:#}")]
    Load {
        key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("generation failed: {0:#}")]
    Generation(#[source] anyhow::Error),
    #[error("pipeline worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::UnexpectedOutput(_) => ErrorKind::Validation,
            Self::CapabilityUnavailable(_) => ErrorKind::Unavailable,
            Self::Load { .. } | Self::Generation(_) | Self::Worker(_) => ErrorKind::Internal,
        }
    }

    /// Stable snake_case tag used in error bodies.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::UnexpectedOutput(_) => "unexpected_output",
            Self::CapabilityUnavailable(_) => "not_implemented",
            Self::Load { .. } => "load",
            Self::Generation(_) => "generation",
            Self::Worker(_) => "worker",
        }
    }
}

impl From<serde_plain::Error> for Error {
    fn from(e: serde_plain::Error) -> Self {
        Self::Validation(e.to_string())
    }
}
