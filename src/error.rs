use crate::types::{ContextId, DocumentId};
use thiserror::Error;

/// Problems with the metadata span of a reply stream. None of these touch the
/// visible text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeFault {
    #[error("metadata span was never terminated")]
    Unterminated,
    #[error("metadata span is malformed: {0}")]
    Malformed(String),
    #[error("additional metadata span ignored")]
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    /// Connection failed mid-stream. Partial content stays, an inline notice
    /// ends the turn.
    #[error("transport failed: {0}")]
    Transport(String),
    #[error(transparent)]
    Decode(#[from] DecodeFault),
    /// One body fetch in a pagination batch failed; its siblings are kept.
    #[error("failed to fetch message {id}: {reason}")]
    Pagination { id: DocumentId, reason: String },
    /// A result arrived for a context that is no longer active.
    #[error("dropped result for inactive context {0}")]
    StaleContext(ContextId),
}

impl Fault {
    /// Only faults that change what the user reads are rendered inline; the
    /// rest are logged and swallowed.
    pub fn surfaces_inline(&self) -> bool {
        matches!(self, Fault::Transport(_))
    }

    pub fn report(&self) {
        match self {
            Fault::Transport(_) | Fault::Pagination { .. } => {
                tracing::warn!(fault = %self, "degraded result");
            }
            Fault::Decode(_) | Fault::StaleContext(_) => {
                tracing::debug!(fault = %self, "ignored");
            }
        }
    }
}

/// Requests the engine refuses outright.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("a reply is still streaming for this context")]
    TurnInProgress,
    #[error("a {0} is already being created")]
    CreateInFlight(&'static str),
    #[error("no context is active")]
    NoActiveContext,
}
