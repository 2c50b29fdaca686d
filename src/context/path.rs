use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("Empty or malformed path '{path}'.")]
    Malformed { path: String },
    #[error("Path '{path}' addresses a key on a non-object value.")]
    NotAnObject { path: String },
    #[error("Path '{path}' indexes a non-array value.")]
    NotAnArray { path: String },
    #[error("Index {index} out of bounds for path '{path}'.")]
    IndexOutOfBounds { path: String, index: usize },
    #[error("Path '{path}' requires an existing array at an intermediate key.")]
    MissingArray { path: String },
}

#[derive(Debug)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Splits `a.b[2].c` into `[Key(a), Key(b), Index(2), Key(c)]`.
///
/// Each dot-separated segment is a key name optionally followed by one or
/// more `[N]` indices. An empty path or an empty key name is malformed.
fn parse_path(path: &str) -> Option<Vec<Segment>> {
    if path.is_empty() {
        return None;
    }
    let mut segments = Vec::new();
    for part in path.split('.') {
        let (name, indices) = match part.find('[') {
            Some(bracket) => part.split_at(bracket),
            None => (part, ""),
        };
        if name.is_empty() {
            return None;
        }
        segments.push(Segment::Key(name.to_owned()));
        let mut rest = indices;
        while !rest.is_empty() {
            let inner = rest.strip_prefix('[')?;
            let close = inner.find(']')?;
            let index: usize = inner.get(..close)?.parse().ok()?;
            segments.push(Segment::Index(index));
            rest = inner.get(close + 1..)?;
        }
    }
    Some(segments)
}

/// Resolves `path` against `root`.
///
/// Returns `None` when the path is malformed or any link is missing: a key
/// absent from an object, a key addressed on a non-object, an index on a
/// non-array, or an index out of range. A present JSON null resolves to
/// `Some(&Value::Null)`, preserving the present/absent distinction.
#[must_use]
pub fn get_path<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    let segments = parse_path(path)?;
    let mut current = root;
    for segment in &segments {
        current = match segment {
            Segment::Key(name) => current.as_object()?.get(name)?,
            Segment::Index(index) => current.as_array()?.get(*index)?,
        };
    }
    Some(current)
}

/// Writes `value` at `path`, creating intermediate objects as needed.
///
/// Arrays are never created or grown: indexing past the end of an existing
/// array fails, as does a path that needs an array where none exists.
///
/// # Errors
///
/// Returns an error when the path is malformed or the existing structure is
/// incompatible with the path; `root` is left partially extended in that
/// case (created intermediate objects are not rolled back).
pub fn set_path(root: &mut Value, path: &str, value: Value) -> Result<(), PathError> {
    let segments = parse_path(path).ok_or_else(|| PathError::Malformed {
        path: path.to_owned(),
    })?;
    let Some((last, intermediate)) = segments.split_last() else {
        return Err(PathError::Malformed {
            path: path.to_owned(),
        });
    };

    let mut current = root;
    let mut upcoming = intermediate.iter().skip(1).chain(std::iter::once(last));
    for segment in intermediate {
        let next = upcoming.next();
        current = match segment {
            Segment::Key(name) => {
                let map = current.as_object_mut().ok_or_else(|| PathError::NotAnObject {
                    path: path.to_owned(),
                })?;
                if !map.contains_key(name) {
                    if matches!(next, Some(Segment::Index(_))) {
                        return Err(PathError::MissingArray {
                            path: path.to_owned(),
                        });
                    }
                    map.insert(name.clone(), Value::Object(Map::new()));
                }
                map.get_mut(name).ok_or_else(|| PathError::NotAnObject {
                    path: path.to_owned(),
                })?
            }
            Segment::Index(index) => {
                let array = current.as_array_mut().ok_or_else(|| PathError::NotAnArray {
                    path: path.to_owned(),
                })?;
                array.get_mut(*index).ok_or(PathError::IndexOutOfBounds {
                    path: path.to_owned(),
                    index: *index,
                })?
            }
        };
    }

    match last {
        Segment::Key(name) => {
            let map = current.as_object_mut().ok_or_else(|| PathError::NotAnObject {
                path: path.to_owned(),
            })?;
            map.insert(name.clone(), value);
        }
        Segment::Index(index) => {
            let array = current.as_array_mut().ok_or_else(|| PathError::NotAnArray {
                path: path.to_owned(),
            })?;
            let slot = array.get_mut(*index).ok_or(PathError::IndexOutOfBounds {
                path: path.to_owned(),
                index: *index,
            })?;
            *slot = value;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_keys_and_indices() -> Result<(), String> {
        let root = json!({"data": {"values": [{"id": 7}, {"id": 8}]}});
        match get_path(&root, "data.values[1].id") {
            Some(value) if *value == json!(8) => Ok(()),
            other => Err(format!("unexpected resolution: {:?}", other)),
        }
    }

    #[test]
    fn distinguishes_present_null_from_absent() -> Result<(), String> {
        let root = json!({"a": null});
        if get_path(&root, "a") != Some(&Value::Null) {
            return Err("present null should resolve".to_owned());
        }
        if get_path(&root, "b").is_some() {
            return Err("absent key should be None".to_owned());
        }
        Ok(())
    }

    #[test]
    fn misses_on_type_mismatches() -> Result<(), String> {
        let root = json!({"list": [1, 2], "scalar": 5});
        let misses = ["list.name", "scalar[0]", "list[2]", "scalar.x", ""];
        for path in misses {
            if get_path(&root, path).is_some() {
                return Err(format!("expected miss for '{}'", path));
            }
        }
        Ok(())
    }

    #[test]
    fn set_creates_intermediate_objects() -> Result<(), String> {
        let mut root = json!({});
        set_path(&mut root, "a.b.c", json!(1)).map_err(|err| err.to_string())?;
        if root != json!({"a": {"b": {"c": 1}}}) {
            return Err(format!("unexpected tree: {}", root));
        }
        Ok(())
    }

    #[test]
    fn set_writes_into_existing_array() -> Result<(), String> {
        let mut root = json!({"items": [{"x": 1}, {"x": 2}]});
        set_path(&mut root, "items[1].x", json!(20)).map_err(|err| err.to_string())?;
        if root != json!({"items": [{"x": 1}, {"x": 20}]}) {
            return Err(format!("unexpected tree: {}", root));
        }
        Ok(())
    }

    #[test]
    fn set_never_grows_arrays() -> Result<(), String> {
        let mut root = json!({"a": {"b": [0, 1, 2, 3, 4]}});
        match set_path(&mut root, "a.b[5].c", json!(1)) {
            Err(PathError::IndexOutOfBounds { index: 5, .. }) => {}
            other => return Err(format!("expected out-of-bounds, got {:?}", other)),
        }
        match set_path(&mut root, "missing[0]", json!(1)) {
            Err(PathError::MissingArray { .. }) => Ok(()),
            other => Err(format!("expected missing-array error, got {:?}", other)),
        }
    }

    #[test]
    fn set_rejects_malformed_paths() -> Result<(), String> {
        let mut root = json!({});
        for path in ["", ".a", "a..b", "a[x]"] {
            match set_path(&mut root, path, json!(1)) {
                Err(PathError::Malformed { .. }) => {}
                other => return Err(format!("expected malformed for '{}', got {:?}", path, other)),
            }
        }
        Ok(())
    }
}
