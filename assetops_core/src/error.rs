use crate::automation::models::RunStatus;
use std::error::Error as StdError;
use uuid::Uuid;

/// Common error type for `assetops_core`.
///
/// Store implementations (Postgres, SQLite) should preserve the underlying
/// driver error chain via `Error::backend` or `Error::store_unavailable`.
/// Per-candidate failures are not represented here; they surface as
/// [`ItemError`](crate::automation::reconciler::ItemError) values and never
/// abort a run on their own.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Another run for the same scope is still `running`. No state was mutated.
    #[error("a run is already active for scope {scope}")]
    RunAlreadyActive {
        scope: String,
        active_run_id: Option<Uuid>,
    },

    #[error("run {run_id} cannot transition from {from} to {to}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },

    /// The source adapter could not open its candidate stream.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// The candidate stream failed after it was opened.
    #[error("source failed: {0}")]
    Source(String),

    #[error("store unavailable: {context}")]
    StoreUnavailable {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn store_unavailable(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::StoreUnavailable {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// True for errors raised by the durable store rather than by the caller.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. } | Self::Backend { .. } | Self::BackendMessage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
