//! Typed condition evaluation over the iteration context.
//!
//! The comparison value authored in the flow is always a string; it is
//! coerced toward the type of the resolved context value before comparing.
use regex::Regex;
use serde_json::Value;
use tracing::{error, warn};

use crate::context::{get_path, value_to_string};
use crate::flow::ConditionData;

static NULL: Value = Value::Null;

/// Evaluates a structured condition against the context.
///
/// A missing variable resolves to null; malformed condition data (empty
/// variable or operator, or an unknown operator) evaluates to false with a
/// warning rather than failing the iteration.
#[must_use]
pub fn evaluate(condition: &ConditionData, context: &Value) -> bool {
    let variable = condition.variable.trim();
    let operator = condition.operator.trim();
    if variable.is_empty() || operator.is_empty() {
        warn!(
            "Condition missing required fields: variable='{}', operator='{}'. Defaulting to false.",
            variable, operator
        );
        return false;
    }

    let resolved = get_path(context, variable);
    if resolved.is_none() {
        warn!("Condition variable '{}' not found in context.", variable);
    }
    let left = resolved.unwrap_or(&NULL);
    let value = condition.value.as_str();

    match operator {
        "equals" => smart_equals(left, value),
        "not_equals" => !smart_equals(left, value),
        "greater_than" | "less_than" | "greater_equals" | "less_equals" => {
            match (coerce_number(left), value.trim().parse::<f64>().ok()) {
                (Some(lhs), Some(rhs)) => match operator {
                    "greater_than" => lhs > rhs,
                    "less_than" => lhs < rhs,
                    "greater_equals" => lhs >= rhs,
                    _ => lhs <= rhs,
                },
                _ => {
                    warn!(
                        "Numeric comparison '{}' failed: '{}' or '{}' is not a number.",
                        operator,
                        value_to_string(left),
                        value
                    );
                    false
                }
            }
        }
        "contains" | "starts_with" | "ends_with" => {
            if left.is_null() {
                return false;
            }
            let text = value_to_string(left);
            match operator {
                "contains" => text.contains(value),
                "starts_with" => text.starts_with(value),
                _ => text.ends_with(value),
            }
        }
        "matches_regex" => match Regex::new(value) {
            Ok(pattern) => pattern.is_match(&value_to_string(left)),
            Err(err) => {
                error!("Invalid regex pattern '{}' in condition: {}", value, err);
                false
            }
        },
        "exists" => !left.is_null(),
        "not_exists" => left.is_null(),
        "is_number" => left.is_number(),
        "is_text" => left.is_string(),
        "is_boolean" => left.is_boolean(),
        "is_array" => left.is_array(),
        "is_true" => *left == Value::Bool(true),
        "is_false" => *left == Value::Bool(false),
        unknown => {
            warn!("Unknown condition operator '{}'. Defaulting to false.", unknown);
            false
        }
    }
}

/// Smart equality: numeric context values compare numerically when the
/// comparison value parses, booleans compare against "true"/"false", null
/// equals the empty string, and everything else compares string forms.
fn smart_equals(left: &Value, value: &str) -> bool {
    match left {
        Value::Number(number) => {
            if let Some(lhs) = number.as_i64()
                && let Ok(rhs) = value.trim().parse::<i64>()
            {
                return lhs == rhs;
            }
            if let Some(lhs) = number.as_f64()
                && let Ok(rhs) = value.trim().parse::<f64>()
            {
                return lhs == rhs;
            }
            number.to_string() == value
        }
        Value::Bool(flag) => match value.to_ascii_lowercase().as_str() {
            "true" => *flag,
            "false" => !*flag,
            _ => flag.to_string() == value,
        },
        Value::Null => value.is_empty(),
        Value::String(text) => text == value,
        compound => value_to_string(compound) == value,
    }
}

/// Numeric coercion for ordering operators: numbers pass through, numeric
/// strings parse, everything else fails.
fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(variable: &str, operator: &str, value: &str) -> ConditionData {
        ConditionData {
            variable: variable.to_owned(),
            operator: operator.to_owned(),
            value: value.to_owned(),
        }
    }

    #[test]
    fn smart_equals_numeric_context() -> Result<(), String> {
        let ctx = json!({"status": 200, "ratio": 0.5});
        let cases = [
            (cond("status", "equals", "200"), true),
            (cond("status", "equals", "200x"), false),
            (cond("status", "equals", "201"), false),
            (cond("status", "not_equals", "201"), true),
            (cond("ratio", "equals", "0.5"), true),
            (cond("status", "equals", "200.0"), true),
        ];
        for (condition, expected) in cases {
            if evaluate(&condition, &ctx) != expected {
                return Err(format!(
                    "'{}' {} '{}' expected {}",
                    condition.variable, condition.operator, condition.value, expected
                ));
            }
        }
        Ok(())
    }

    #[test]
    fn smart_equals_bool_and_null() -> Result<(), String> {
        let ctx = json!({"on": true, "off": false, "gone": null});
        let cases = [
            (cond("on", "equals", "true"), true),
            (cond("on", "equals", "TRUE"), true),
            (cond("off", "equals", "false"), true),
            (cond("on", "equals", "yes"), false),
            (cond("gone", "equals", ""), true),
            (cond("missing", "equals", ""), true),
            (cond("gone", "equals", "null"), false),
        ];
        for (condition, expected) in cases {
            if evaluate(&condition, &ctx) != expected {
                return Err(format!(
                    "'{}' {} '{}' expected {}",
                    condition.variable, condition.operator, condition.value, expected
                ));
            }
        }
        Ok(())
    }

    #[test]
    fn ordering_operators_coerce_numbers() -> Result<(), String> {
        let ctx = json!({"count": 5, "count_text": "5", "word": "five"});
        let cases = [
            (cond("count", "greater_than", "4"), true),
            (cond("count", "less_than", "4"), false),
            (cond("count", "greater_equals", "5"), true),
            (cond("count", "less_equals", "5"), true),
            (cond("count_text", "greater_than", "4"), true),
            (cond("word", "greater_than", "4"), false),
            (cond("count", "greater_than", "many"), false),
        ];
        for (condition, expected) in cases {
            if evaluate(&condition, &ctx) != expected {
                return Err(format!(
                    "'{}' {} '{}' expected {}",
                    condition.variable, condition.operator, condition.value, expected
                ));
            }
        }
        Ok(())
    }

    #[test]
    fn string_operators() -> Result<(), String> {
        let ctx = json!({"name": "flow-runner", "count": 42, "gone": null});
        let cases = [
            (cond("name", "contains", "w-r"), true),
            (cond("name", "starts_with", "flow"), true),
            (cond("name", "ends_with", "runner"), true),
            (cond("name", "contains", "xyz"), false),
            (cond("count", "contains", "2"), true),
            (cond("gone", "contains", ""), false),
        ];
        for (condition, expected) in cases {
            if evaluate(&condition, &ctx) != expected {
                return Err(format!(
                    "'{}' {} '{}' expected {}",
                    condition.variable, condition.operator, condition.value, expected
                ));
            }
        }
        Ok(())
    }

    #[test]
    fn regex_operator_handles_invalid_patterns() -> Result<(), String> {
        let ctx = json!({"name": "user-123"});
        if !evaluate(&cond("name", "matches_regex", r"user-\d+"), &ctx) {
            return Err("expected regex match".to_owned());
        }
        if evaluate(&cond("name", "matches_regex", "user-("), &ctx) {
            return Err("invalid regex should evaluate false".to_owned());
        }
        Ok(())
    }

    #[test]
    fn existence_and_type_checks() -> Result<(), String> {
        let ctx = json!({
            "n": 3,
            "s": "text",
            "b": true,
            "list": [1],
            "gone": null
        });
        let cases = [
            (cond("n", "exists", ""), true),
            (cond("gone", "exists", ""), false),
            (cond("missing", "exists", ""), false),
            (cond("missing", "not_exists", ""), true),
            (cond("n", "is_number", ""), true),
            (cond("b", "is_number", ""), false),
            (cond("s", "is_text", ""), true),
            (cond("b", "is_boolean", ""), true),
            (cond("list", "is_array", ""), true),
            (cond("b", "is_true", ""), true),
            (cond("b", "is_false", ""), false),
            (cond("n", "is_true", ""), false),
        ];
        for (condition, expected) in cases {
            if evaluate(&condition, &ctx) != expected {
                return Err(format!(
                    "'{}' {} expected {}",
                    condition.variable, condition.operator, expected
                ));
            }
        }
        Ok(())
    }

    #[test]
    fn malformed_conditions_default_false() -> Result<(), String> {
        let ctx = json!({"n": 1});
        let cases = [
            cond("", "equals", "1"),
            cond("n", "", "1"),
            cond("n", "resembles", "1"),
        ];
        for condition in cases {
            if evaluate(&condition, &ctx) {
                return Err(format!(
                    "malformed condition '{}'/'{}' should be false",
                    condition.variable, condition.operator
                ));
            }
        }
        Ok(())
    }
}
