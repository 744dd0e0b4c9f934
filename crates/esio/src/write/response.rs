//! 🧾 response.rs: reading the cluster's verdict on a bulk request.
//!
//! A 200 from `/_bulk` means "I read your request", not "I did everything in it". The
//! per-item outcomes live in `items`, and `errors: true` is the hint to go looking.
//! Items whose error type is in the allowed set are forgiven. Everything else gets
//! rolled into one message and one [`ConnectorError::PartialBulkFailure`].

use std::collections::HashSet;
use std::fmt::Write as _;

use serde_json::Value;

use crate::error::{ConnectorError, Result};

/// ⚔️ The error type of a write that lost a version race.
pub const VERSION_CONFLICT_ERROR: &str = "version_conflict_engine_exception";

const FAILURE_PREAMBLE: &str =
    "Error writing to Elasticsearch, some elements could not be inserted:";

/// 📦 `{"index": {...}}` → `{...}`. Items carry exactly one key, the op name.
pub(crate) fn item_outcome(item: &Value) -> Option<&Value> {
    item.as_object().and_then(|object| object.values().next())
}

fn as_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// 🧾 Fail when any item carries an error that isn't allowed.
pub fn check_for_errors(response: &Value, allowed: &HashSet<String>) -> Result<()> {
    if !response.get("errors").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(());
    }

    let mut message = String::from(FAILURE_PREAMBLE);
    let items = response
        .get("items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    if items.is_empty() {
        // 🤷 errors flagged, nothing itemised: hand over the whole reply
        message.push_str(&response.to_string());
        return Err(ConnectorError::PartialBulkFailure(message));
    }

    let mut failures = 0usize;
    for item in items {
        let Some(outcome) = item_outcome(item) else {
            continue;
        };
        let Some(error) = outcome.get("error") else {
            continue;
        };
        let error_type = as_text(error.get("type"));
        if allowed.contains(&error_type) {
            continue;
        }
        failures += 1;
        let _ = write!(
            message,
            "\nDocument id {}: {} ({})",
            as_text(outcome.get("_id")),
            as_text(error.get("reason")),
            error_type
        );
        if let Some(caused_by) = error.get("caused_by") {
            let _ = write!(
                message,
                "\nCaused by: {} ({})",
                as_text(caused_by.get("reason")),
                as_text(caused_by.get("type"))
            );
        }
    }

    if failures > 0 {
        Err(ConnectorError::PartialBulkFailure(message))
    } else {
        Ok(())
    }
}
