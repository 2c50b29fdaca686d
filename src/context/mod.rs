//! The per-iteration variable tree and the operations the interpreter
//! performs on it: path resolution, variable substitution, and branch
//! merge-back.
//!
//! Contexts are plain [`serde_json::Value`] trees. An absent path is
//! represented by `None` from [`path::get_path`], which is distinct from a
//! present JSON null.
mod path;
mod substitute;

pub use path::{PathError, get_path, set_path};
pub use substitute::substitute;

use serde_json::Value;

/// String form used by `{{...}}` expansion and condition string coercion:
/// null renders as the empty string, scalars as themselves, and compound
/// values as compact JSON.
#[must_use]
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        compound => serde_json::to_string(compound).unwrap_or_default(),
    }
}

/// Merges `branch` back into `parent` after a condition branch completes.
///
/// Nested objects merge key-wise; scalars and arrays replace the parent
/// value wholesale.
pub fn deep_merge(parent: &mut Value, branch: Value) {
    match (parent, branch) {
        (Value::Object(parent_map), Value::Object(branch_map)) => {
            for (key, branch_value) in branch_map {
                match parent_map.get_mut(&key) {
                    Some(parent_value) => deep_merge(parent_value, branch_value),
                    None => {
                        parent_map.insert(key, branch_value);
                    }
                }
            }
        }
        (parent_slot, branch_value) => *parent_slot = branch_value,
    }
}
