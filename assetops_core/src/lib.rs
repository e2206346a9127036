//! AssetOps core library: run tracking, reconciliation and the stores behind them.

pub mod automation;
pub mod config;
pub mod error;
pub mod models;
pub mod o11y;
pub mod source;
pub mod store;

pub use automation::coordinator::{
    CancelOutcome, LocalRuns, RunCoordinator, RunHandle, cancel_in_store,
};
pub use automation::details::{FailureReason, RunFailure};
pub use automation::models::{
    AutomationRun, Candidate, OutcomeBucket, RunCounters, RunQuery, RunStatus, RunTrigger,
    SourceCursor, StoredRecord,
};
pub use automation::reconciler::{
    Comparison, Decision, FieldKind, FieldSpec, ItemError, ItemErrorKind, ItemOutcome,
    ReconcileSpec, Reconciler,
};
pub use automation::sweep::RecoverySweep;
pub use automation::traits::{
    CandidateStream, RecordPatch, RecordStore, RunStore, SourceAdapter, SourceContext,
};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use models::{SYSTEM_SCOPE, TenantId, scope_key};
