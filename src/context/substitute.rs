use serde_json::Value;
use tracing::warn;

use super::path::get_path;
use super::value_to_string;

const MARKER_PREFIX: &str = "##VAR:";
const MARKER_SUFFIX: &str = "##";

/// Recursively expands variable references in `data` against `context`.
///
/// Strings receive marker expansion (see [`substitute_string`]); object keys
/// and values and array elements are substituted recursively; all other
/// scalars pass through unchanged.
#[must_use]
pub fn substitute(data: &Value, context: &Value) -> Value {
    match data {
        Value::String(text) => substitute_string(text, context),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let substituted_key = match substitute_string(key, context) {
                        Value::String(text) => text,
                        other => value_to_string(&other),
                    };
                    (substituted_key, substitute(value, context))
                })
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| substitute(item, context)).collect())
        }
        other => other.clone(),
    }
}

/// Expands a single string template.
///
/// A string that is exactly `##VAR:unquoted:path##` yields the raw resolved
/// value of any type (null when the path is absent); this is how typed JSON
/// values enter request bodies. Otherwise every `##VAR:string:path##` and
/// `{{path}}` occurrence is replaced in place with the string form of the
/// resolved value, where null and missing both render as the empty string.
/// Malformed `##VAR:...##` forms stay as literal text.
fn substitute_string(text: &str, context: &Value) -> Value {
    if let Some((kind, path)) = parse_whole_marker(text) {
        let resolved = get_path(context, path);
        if resolved.is_none() {
            warn!("Variable path '{}' in marker '{}' not found in context.", path, text);
        }
        return match kind {
            MarkerKind::Unquoted => resolved.cloned().unwrap_or(Value::Null),
            MarkerKind::String => {
                Value::String(resolved.map(value_to_string).unwrap_or_default())
            }
        };
    }
    Value::String(expand_inline(text, context))
}

enum MarkerKind {
    String,
    Unquoted,
}

fn marker_kind(name: &str) -> Option<MarkerKind> {
    match name {
        "string" => Some(MarkerKind::String),
        "unquoted" => Some(MarkerKind::Unquoted),
        _ => None,
    }
}

/// Parses a string that consists solely of one `##VAR:kind:path##` marker.
fn parse_whole_marker(text: &str) -> Option<(MarkerKind, &str)> {
    let inner = text
        .strip_prefix(MARKER_PREFIX)?
        .strip_suffix(MARKER_SUFFIX)?;
    let (kind, path) = inner.split_once(':')?;
    if path.is_empty() || path.contains("##") {
        return None;
    }
    Some((marker_kind(kind)?, path))
}

/// Replaces `{{path}}` and embedded `##VAR:string:path##` occurrences with
/// string forms of the resolved values.
fn expand_inline(text: &str, context: &Value) -> String {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;

    loop {
        let next_brace = rest.find("{{");
        let next_marker = rest.find(MARKER_PREFIX);
        let (start, is_marker) = match (next_brace, next_marker) {
            (None, None) => {
                output.push_str(rest);
                return output;
            }
            (Some(b), None) => (b, false),
            (None, Some(m)) => (m, true),
            (Some(b), Some(m)) => {
                if b < m {
                    (b, false)
                } else {
                    (m, true)
                }
            }
        };

        let (before, tail) = rest.split_at(start);
        output.push_str(before);

        if is_marker {
            match split_inline_marker(tail) {
                Some((kind, path, after)) => {
                    match kind {
                        MarkerKind::String => {
                            match get_path(context, path) {
                                Some(value) => output.push_str(&value_to_string(value)),
                                None => warn!(
                                    "Variable path '{}' in inline marker not found in context.",
                                    path
                                ),
                            }
                            rest = after;
                        }
                        MarkerKind::Unquoted => {
                            // Inline unquoted markers have no string meaning;
                            // they stay literal.
                            let consumed = tail.len() - after.len();
                            output.push_str(&tail[..consumed]);
                            rest = after;
                        }
                    }
                }
                None => {
                    output.push_str(MARKER_PREFIX);
                    rest = &tail[MARKER_PREFIX.len()..];
                }
            }
        } else {
            let after_open = &tail[2..];
            match after_open.find("}}") {
                Some(close) => {
                    let path = after_open[..close].trim();
                    match get_path(context, path) {
                        Some(value) => output.push_str(&value_to_string(value)),
                        None => {
                            warn!("Variable '{{{{{}}}}}' not found in context.", path);
                        }
                    }
                    rest = &after_open[close + 2..];
                }
                None => {
                    output.push_str(tail);
                    return output;
                }
            }
        }
    }
}

/// Splits `##VAR:kind:path##rest` into its parts; `None` when the marker is
/// unterminated or malformed.
fn split_inline_marker(tail: &str) -> Option<(MarkerKind, &str, &str)> {
    let inner_start = MARKER_PREFIX.len();
    let body = &tail[inner_start..];
    let end = body.find(MARKER_SUFFIX)?;
    let inner = &body[..end];
    let (kind, path) = inner.split_once(':')?;
    if path.is_empty() {
        return None;
    }
    let after = &body[end + MARKER_SUFFIX.len()..];
    Some((marker_kind(kind)?, path, after))
}
