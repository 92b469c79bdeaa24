//! Patches: the atomic mutations a `WorldDelta` is made of.
//!
//! Patches address a JSON tree with dotted paths (`data.tasks.0.title`).
//! Numeric segments index arrays; every other segment is an object key.

use crate::core::error::WorldlineError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// Field stamped on object elements by `Remove` and cleared by `Restore`.
pub const SOFT_REMOVED_FIELD: &str = "deletedAt";

static SEGMENT_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9_$\-]+$").expect("static regex"));

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Patch {
    Set { path: String, value: Value },
    Merge { path: String, value: Value },
    Unset { path: String },
    Append { path: String, value: Value },
    Remove { path: String, matcher: Value },
    Restore { path: String, matcher: Value },
}

impl Patch {
    pub fn path(&self) -> &str {
        match self {
            Patch::Set { path, .. }
            | Patch::Merge { path, .. }
            | Patch::Unset { path }
            | Patch::Append { path, .. }
            | Patch::Remove { path, .. }
            | Patch::Restore { path, .. } => path,
        }
    }

    pub fn op_name(&self) -> &'static str {
        match self {
            Patch::Set { .. } => "set",
            Patch::Merge { .. } => "merge",
            Patch::Unset { .. } => "unset",
            Patch::Append { .. } => "append",
            Patch::Remove { .. } => "remove",
            Patch::Restore { .. } => "restore",
        }
    }

    /// Same patch, re-rooted under `prefix` (e.g. `tasks` -> `data.tasks`).
    pub fn rooted(self, prefix: &str) -> Patch {
        let join = |p: String| {
            if p.is_empty() {
                prefix.to_string()
            } else {
                format!("{}.{}", prefix, p)
            }
        };
        match self {
            Patch::Set { path, value } => Patch::Set { path: join(path), value },
            Patch::Merge { path, value } => Patch::Merge { path: join(path), value },
            Patch::Unset { path } => Patch::Unset { path: join(path) },
            Patch::Append { path, value } => Patch::Append { path: join(path), value },
            Patch::Remove { path, matcher } => Patch::Remove { path: join(path), matcher },
            Patch::Restore { path, matcher } => Patch::Restore { path: join(path), matcher },
        }
    }
}

pub fn parse_path(path: &str) -> Result<Vec<String>, WorldlineError> {
    if path.is_empty() {
        return Err(WorldlineError::ValidationError(
            "patch path cannot be empty".to_string(),
        ));
    }
    path.split('.')
        .map(|seg| {
            if SEGMENT_RE.is_match(seg) {
                Ok(seg.to_string())
            } else {
                Err(WorldlineError::ValidationError(format!(
                    "invalid segment '{}' in patch path '{}'",
                    seg, path
                )))
            }
        })
        .collect()
}

pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = parse_path(path).ok()?;
    let mut cur = root;
    for seg in &segments {
        cur = match cur {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Walk to the container holding the last segment, creating objects on the way.
fn parent_mut<'a>(
    root: &'a mut Value,
    segments: &[String],
    create: bool,
) -> Result<Option<&'a mut Value>, WorldlineError> {
    let mut cur = root;
    for seg in &segments[..segments.len() - 1] {
        if create && cur.is_null() {
            *cur = Value::Object(Map::new());
        }
        cur = match cur {
            Value::Object(map) => {
                if !create && !map.contains_key(seg) {
                    return Ok(None);
                }
                map.entry(seg.clone())
                    .or_insert_with(|| Value::Object(Map::new()))
            }
            Value::Array(items) => {
                let idx = seg.parse::<usize>().map_err(|_| {
                    WorldlineError::ValidationError(format!("'{}' is not an array index", seg))
                })?;
                match items.get_mut(idx) {
                    Some(v) => v,
                    None if create => {
                        return Err(WorldlineError::ValidationError(format!(
                            "array index {} out of bounds",
                            idx
                        )));
                    }
                    None => return Ok(None),
                }
            }
            other => {
                return Err(WorldlineError::ValidationError(format!(
                    "cannot descend into {} at '{}'",
                    type_name(other),
                    seg
                )));
            }
        };
    }
    Ok(Some(cur))
}

fn slot_mut<'a>(parent: &'a mut Value, key: &str) -> Result<Option<&'a mut Value>, WorldlineError> {
    match parent {
        Value::Object(map) => Ok(map.get_mut(key)),
        Value::Array(items) => {
            let idx = key.parse::<usize>().map_err(|_| {
                WorldlineError::ValidationError(format!("'{}' is not an array index", key))
            })?;
            Ok(items.get_mut(idx))
        }
        other => Err(WorldlineError::ValidationError(format!(
            "cannot address '{}' inside {}",
            key,
            type_name(other)
        ))),
    }
}

fn put(parent: &mut Value, key: &str, value: Value) -> Result<(), WorldlineError> {
    match parent {
        Value::Object(map) => {
            map.insert(key.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let idx = key.parse::<usize>().map_err(|_| {
                WorldlineError::ValidationError(format!("'{}' is not an array index", key))
            })?;
            match idx.cmp(&items.len()) {
                std::cmp::Ordering::Less => items[idx] = value,
                std::cmp::Ordering::Equal => items.push(value),
                std::cmp::Ordering::Greater => {
                    return Err(WorldlineError::ValidationError(format!(
                        "array index {} out of bounds",
                        idx
                    )));
                }
            }
            Ok(())
        }
        other => Err(WorldlineError::ValidationError(format!(
            "cannot set '{}' inside {}",
            key,
            type_name(other)
        ))),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A scalar matcher is compared with the element or its `id`; an object
/// matcher matches elements carrying all of its fields.
fn element_matches(element: &Value, matcher: &Value) -> bool {
    if element == matcher {
        return true;
    }
    match (element, matcher) {
        (Value::Object(fields), Value::Object(wanted)) => {
            !wanted.is_empty() && wanted.iter().all(|(k, v)| fields.get(k) == Some(v))
        }
        (Value::Object(fields), scalar) => fields.get("id") == Some(scalar),
        _ => false,
    }
}

fn creating_parent<'a>(root: &'a mut Value, segments: &[String]) -> Result<&'a mut Value, WorldlineError> {
    parent_mut(root, segments, true)?.ok_or_else(|| {
        WorldlineError::ValidationError(format!("cannot create path '{}'", segments.join(".")))
    })
}

/// Apply one patch in place. `now` stamps soft removals.
pub fn apply_patch(root: &mut Value, patch: &Patch, now: u64) -> Result<(), WorldlineError> {
    let segments = parse_path(patch.path())?;
    let Some(last) = segments.last().cloned() else {
        return Err(WorldlineError::ValidationError("empty patch path".to_string()));
    };

    match patch {
        Patch::Set { value, .. } => {
            let parent = creating_parent(root, &segments)?;
            put(parent, &last, value.clone())
        }
        Patch::Merge { value, .. } => {
            let Value::Object(incoming) = value else {
                return Err(WorldlineError::ValidationError(format!(
                    "merge at '{}' requires an object value",
                    patch.path()
                )));
            };
            let parent = creating_parent(root, &segments)?;
            match slot_mut(parent, &last)? {
                Some(Value::Object(existing)) => {
                    for (k, v) in incoming {
                        existing.insert(k.clone(), v.clone());
                    }
                    Ok(())
                }
                Some(Value::Null) | None => put(parent, &last, value.clone()),
                Some(other) => Err(WorldlineError::ValidationError(format!(
                    "merge at '{}' targets a {}",
                    patch.path(),
                    type_name(other)
                ))),
            }
        }
        Patch::Unset { .. } => {
            let Some(parent) = parent_mut(root, &segments, false)? else {
                return Ok(());
            };
            match parent {
                Value::Object(map) => {
                    map.remove(&last);
                }
                Value::Array(items) => {
                    if let Ok(idx) = last.parse::<usize>()
                        && idx < items.len()
                    {
                        items.remove(idx);
                    }
                }
                _ => {}
            }
            Ok(())
        }
        Patch::Append { value, .. } => {
            let parent = creating_parent(root, &segments)?;
            match slot_mut(parent, &last)? {
                Some(Value::Array(items)) => {
                    items.push(value.clone());
                    Ok(())
                }
                Some(Value::Null) | None => put(parent, &last, Value::Array(vec![value.clone()])),
                Some(other) => Err(WorldlineError::ValidationError(format!(
                    "append at '{}' targets a {}",
                    patch.path(),
                    type_name(other)
                ))),
            }
        }
        Patch::Remove { matcher, .. } | Patch::Restore { matcher, .. } => {
            let restoring = matches!(patch, Patch::Restore { .. });
            let items = match parent_mut(root, &segments, false)? {
                Some(parent) => match slot_mut(parent, &last)? {
                    Some(Value::Array(items)) => items,
                    _ => {
                        return Err(WorldlineError::ValidationError(format!(
                            "{} at '{}' requires an array",
                            patch.op_name(),
                            patch.path()
                        )));
                    }
                },
                None => {
                    return Err(WorldlineError::ValidationError(format!(
                        "{} at '{}': path does not exist",
                        patch.op_name(),
                        patch.path()
                    )));
                }
            };
            let before = items.len();
            let mut touched = 0usize;
            if restoring {
                for item in items.iter_mut() {
                    if let Value::Object(obj) = item
                        && element_matches(&Value::Object(obj.clone()), matcher)
                        && obj.remove(SOFT_REMOVED_FIELD).is_some()
                    {
                        touched += 1;
                    }
                }
            } else {
                for item in items.iter_mut() {
                    if let Value::Object(obj) = item
                        && element_matches(&Value::Object(obj.clone()), matcher)
                        && !obj.contains_key(SOFT_REMOVED_FIELD)
                    {
                        obj.insert(SOFT_REMOVED_FIELD.to_string(), Value::from(now));
                        touched += 1;
                    }
                }
                items.retain(|item| item.is_object() || !element_matches(item, matcher));
                touched += before - items.len();
            }
            if touched == 0 {
                return Err(WorldlineError::ValidationError(format!(
                    "{} at '{}': no element matches {}",
                    patch.op_name(),
                    patch.path(),
                    matcher
                )));
            }
            Ok(())
        }
    }
}

pub fn apply_patches(root: &mut Value, patches: &[Patch], now: u64) -> Result<(), WorldlineError> {
    for patch in patches {
        apply_patch(root, patch, now)?;
    }
    Ok(())
}

/// Coarse diff of two objects: one `Set` per changed key, one `Unset` per dropped key.
///
/// Keys are visited in sorted order so the output is deterministic.
pub fn diff_object(prefix: &str, before: &Map<String, Value>, after: &Map<String, Value>) -> Vec<Patch> {
    let mut keys: Vec<&String> = before.keys().chain(after.keys()).collect();
    keys.sort();
    keys.dedup();

    let mut out = Vec::new();
    for key in keys {
        let path = format!("{}.{}", prefix, key);
        match (before.get(key), after.get(key)) {
            (Some(_), None) => out.push(Patch::Unset { path }),
            (None, Some(v)) => out.push(Patch::Set { path, value: v.clone() }),
            (Some(a), Some(b)) if a != b => out.push(Patch::Set { path, value: b.clone() }),
            _ => {}
        }
    }
    out
}
