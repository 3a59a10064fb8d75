use std::sync::Arc;

use thiserror::Error;

/// Outcome of a failed stream resolution.
///
/// The error is shared by every caller that awaited the same in-flight
/// resolution, so it has to be cheap to clone.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("content identifier must not be empty")]
    InvalidIdentifier,

    /// No candidate carried audio and video in a natively playable container.
    #[error("no playable stream found for {0}")]
    StreamNotFound(String),

    /// The extraction collaborator failed; its error is passed through verbatim.
    #[error("stream extraction failed: {0:#}")]
    Extraction(Arc<anyhow::Error>),

    /// The resolution task went away without producing an outcome.
    #[error("stream resolution for {0} was interrupted")]
    Interrupted(String),
}

impl ResolveError {
    pub fn extraction(err: anyhow::Error) -> Self {
        Self::Extraction(Arc::new(err))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::StreamNotFound(_))
    }
}
