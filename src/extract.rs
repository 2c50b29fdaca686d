//! Extraction of response-derived values into the iteration context.
use std::collections::BTreeMap;

use reqwest::header::HeaderMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::{get_path, set_path};

/// Applies the step's extraction rules to a received response.
///
/// Each rule maps a target context variable to a path expression:
///
/// - `.status` (exact) extracts the integer HTTP status;
/// - `headers.<name>` extracts a header value by case-insensitive name,
///   joining repeated headers with `", "`;
/// - `body` extracts the whole parsed body;
/// - `body.<path>` extracts a path within the parsed body;
/// - anything else is treated as an implicit body path.
///
/// Failed extractions assign null and log a warning tagged with the target
/// variable; they never abort the iteration.
pub fn apply_extract_rules(
    rules: &BTreeMap<String, String>,
    status: u16,
    headers: &HeaderMap,
    body: &Value,
    context: &mut Value,
) {
    for (target, path_expr) in rules {
        if target.is_empty() {
            warn!("Skipping extraction rule with empty variable name.");
            continue;
        }
        if path_expr.is_empty() {
            warn!("Skipping extraction rule for '{}' with empty path expression.", target);
            continue;
        }

        let extracted = extract_one(path_expr, status, headers, body);
        match extracted {
            Some(value) => {
                debug!("Extracted '{}' into context variable '{}'.", path_expr, target);
                store(context, target, value);
            }
            None => {
                warn!(
                    "Extraction failed for variable '{}': path '{}' not found in response.",
                    target, path_expr
                );
                store(context, target, Value::Null);
            }
        }
    }
}

fn extract_one(path_expr: &str, status: u16, headers: &HeaderMap, body: &Value) -> Option<Value> {
    if path_expr == ".status" {
        return Some(Value::from(status));
    }

    let lower = path_expr.to_ascii_lowercase();
    if let Some(header_name) = lower.strip_prefix("headers.") {
        if header_name.is_empty() {
            return None;
        }
        return extract_header(headers, header_name);
    }
    if lower == "body" {
        return Some(body.clone());
    }
    let body_path = lower
        .strip_prefix("body.")
        .map(|_| &path_expr["body.".len()..])
        .unwrap_or(path_expr);
    get_path(body, body_path).cloned()
}

/// Case-insensitive header lookup; repeated headers join RFC-style.
fn extract_header(headers: &HeaderMap, name: &str) -> Option<Value> {
    let mut values = Vec::new();
    for (key, value) in headers {
        if key.as_str().eq_ignore_ascii_case(name) {
            values.push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
    }
    if values.is_empty() {
        None
    } else {
        Some(Value::String(values.join(", ")))
    }
}

fn store(context: &mut Value, target: &str, value: Value) {
    if let Err(err) = set_path(context, target, value) {
        warn!("Failed to store extracted variable '{}': {}", target, err);
    }
}
