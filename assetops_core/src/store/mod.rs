//! Run and record persistence backends.

pub mod config;
pub mod memory;
pub mod postgres;
pub mod sqlite;

use crate::{Error, Result};

/// Map a driver error, treating lost connectivity as `StoreUnavailable`.
pub(crate) fn db_err(context: &str, e: sqlx::Error) -> Error {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => Error::store_unavailable(context, e),
        other => Error::backend(context, other),
    }
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Run details are stored as text so that key order survives the round trip.
pub(crate) fn details_text(details: Option<&serde_json::Value>) -> Result<Option<String>> {
    details
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| Error::backend("serialize details", e))
}

pub(crate) fn parse_details(raw: Option<&str>) -> Result<Option<serde_json::Value>> {
    raw.map(serde_json::from_str)
        .transpose()
        .map_err(|e| Error::backend("details", e))
}

/// Bind value for a count, limit or offset; saturates instead of wrapping negative.
pub(crate) fn sql_int<T: TryInto<i64>>(n: T) -> i64 {
    n.try_into().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn details_keep_key_order_through_text() {
        let details = json!({ "reason": "cancelled", "errors": [], "cursor": 4, "at": "now" });
        let raw = details_text(Some(&details)).unwrap().unwrap();
        assert!(raw.starts_with(r#"{"reason":"#));

        let back = parse_details(Some(&raw)).unwrap().unwrap();
        let keys: Vec<_> = back.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, ["reason", "errors", "cursor", "at"]);
        assert_eq!(parse_details(None).unwrap(), None);
    }

    #[test]
    fn oversized_limits_saturate() {
        assert_eq!(sql_int(usize::MAX), i64::MAX);
        assert_eq!(sql_int(u64::MAX), i64::MAX);
        assert_eq!(sql_int(50usize), 50);
    }
}
