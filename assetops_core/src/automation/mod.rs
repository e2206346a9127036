//! Automation runs: the record of each engine execution and the machinery
//! that produces it.
//!
//! A run pulls candidates from a `SourceAdapter`, reconciles each one against
//! the `RecordStore` and tracks its lifecycle in a `RunStore`:
//! - at most one `running` run per tenant scope, enforced by the store
//! - counters flushed periodically, final counters written on the terminal transition
//! - stale runs failed by the `RecoverySweep`

pub mod coordinator;
pub mod details;
pub mod models;
pub mod reconciler;
pub mod sweep;
pub mod traits;
