//! Builtin effects.
//!
//! `builtin_patches` turns a declarative `EffectBinding` into patches; the
//! standard handlers cover generic custom effects a schema can bind to
//! without writing code (`patch.apply`, `counter.increment`, `random.pick`).

use crate::core::digest;
use crate::core::error::WorldlineError;
use crate::core::host::{EffectBinding, EffectContext, EffectError, EffectRegistry, PatchBuilder};
use crate::core::patch::{self, Patch};
use serde_json::{Map, Value};

/// Deterministic element id for appends: stable for a given execution key,
/// collection, and position.
pub fn derive_element_id(execution_key: &str, path: &str, position: usize) -> String {
    let hash = digest::framed_hash(&[
        ("key", execution_key.as_bytes()),
        ("path", path.as_bytes()),
        ("position", position.to_string().as_bytes()),
    ]);
    hash[..16].to_string()
}

fn matcher_for(input: &Value, id_field: &str) -> Result<Value, EffectError> {
    let id = match input {
        Value::Object(fields) => fields
            .get(id_field)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| EffectError::new(format!("input has no '{}' to match on", id_field)))?,
        Value::Null => return Err(EffectError::new("input is empty")),
        scalar => scalar.clone(),
    };
    if id_field == "id" {
        return Ok(id);
    }
    let mut matcher = Map::new();
    matcher.insert(id_field.to_string(), id);
    Ok(Value::Object(matcher))
}

fn current_len(ctx: &EffectContext, path: &str) -> usize {
    let state = Value::Object(ctx.snapshot().data.clone());
    patch::get_path(&state, path)
        .and_then(Value::as_array)
        .map_or(0, Vec::len)
}

pub fn builtin_patches(
    binding: &EffectBinding,
    ctx: &EffectContext,
    input: &Value,
    out: &mut PatchBuilder,
) -> Result<(), EffectError> {
    match binding {
        EffectBinding::Append { path, assign_id } => {
            let mut value = input.clone();
            if *assign_id {
                let Value::Object(fields) = &mut value else {
                    return Err(EffectError::new(format!("append to '{}' expects an object", path)));
                };
                if !fields.contains_key("id") {
                    let id = derive_element_id(ctx.execution_key(), path, current_len(ctx, path));
                    fields.insert("id".to_string(), Value::String(id));
                }
            }
            out.append(path, value);
        }
        EffectBinding::Set { path, field } => {
            let value = match field {
                Some(name) => input
                    .get(name)
                    .cloned()
                    .ok_or_else(|| EffectError::new(format!("input has no '{}'", name)))?,
                None => input.clone(),
            };
            out.set(path, value);
        }
        EffectBinding::Merge { path } => {
            if !input.is_object() {
                return Err(EffectError::new(format!("merge into '{}' expects an object", path)));
            }
            out.merge(path, input.clone());
        }
        EffectBinding::Unset { path } => {
            out.unset(path);
        }
        EffectBinding::Remove { path, id_field } => {
            out.remove(path, matcher_for(input, id_field)?);
        }
        EffectBinding::Restore { path, id_field } => {
            out.restore(path, matcher_for(input, id_field)?);
        }
        EffectBinding::Noop => {}
        EffectBinding::Custom { effect } => {
            return Err(EffectError::new(format!(
                "'{}' is a custom effect and has no builtin form",
                effect.as_str()
            )));
        }
    }
    Ok(())
}

/// `patch.apply`: input `{"patches": [...]}`, paths relative to `data`.
fn apply_patches(_: &EffectContext, input: &Value, out: &mut PatchBuilder) -> Result<(), EffectError> {
    let raw = input
        .get("patches")
        .cloned()
        .ok_or_else(|| EffectError::new("input has no 'patches'"))?;
    let patches: Vec<Patch> =
        serde_json::from_value(raw).map_err(|e| EffectError::new(format!("malformed patches: {}", e)))?;
    for p in patches {
        match p {
            Patch::Set { path, value } => out.set(&path, value),
            Patch::Merge { path, value } => out.merge(&path, value),
            Patch::Unset { path } => out.unset(&path),
            Patch::Append { path, value } => out.append(&path, value),
            Patch::Remove { path, matcher } => out.remove(&path, matcher),
            Patch::Restore { path, matcher } => out.restore(&path, matcher),
        };
    }
    Ok(())
}

/// `counter.increment`: input `{"path": "...", "by": n}`; `by` defaults to 1.
fn increment(ctx: &EffectContext, input: &Value, out: &mut PatchBuilder) -> Result<(), EffectError> {
    let path = input
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| EffectError::new("input has no 'path'"))?;
    let by = input.get("by").and_then(Value::as_i64).unwrap_or(1);
    let state = Value::Object(ctx.snapshot().data.clone());
    let current = match patch::get_path(&state, path) {
        None | Some(Value::Null) => 0,
        Some(v) => v
            .as_i64()
            .ok_or_else(|| EffectError::new(format!("'{}' is not an integer", path)))?,
    };
    let next = current
        .checked_add(by)
        .ok_or_else(|| EffectError::new(format!("'{}' would overflow", path)))?;
    out.set(path, Value::from(next));
    Ok(())
}

/// `random.pick`: input `{"from": [...], "into": "..."}`. The pick depends
/// only on the execution's random seed.
fn pick(ctx: &EffectContext, input: &Value, out: &mut PatchBuilder) -> Result<(), EffectError> {
    let choices = input
        .get("from")
        .and_then(Value::as_array)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| EffectError::new("input needs a non-empty 'from' array"))?;
    let into = input
        .get("into")
        .and_then(Value::as_str)
        .ok_or_else(|| EffectError::new("input has no 'into'"))?;
    let idx = (ctx.random_seed() % choices.len() as u64) as usize;
    out.set(into, choices[idx].clone());
    Ok(())
}

pub fn register_standard(registry: &mut EffectRegistry) -> Result<(), WorldlineError> {
    registry.register("patch.apply", apply_patches)?;
    registry.register("counter.increment", increment)?;
    registry.register("random.pick", pick)?;
    Ok(())
}

pub fn standard_registry() -> Result<EffectRegistry, WorldlineError> {
    let mut registry = EffectRegistry::new();
    register_standard(&mut registry)?;
    Ok(registry)
}

/// Describe the builtin effect kinds, for `schema` listings.
pub fn describe_builtins() -> Value {
    let mut kinds = Map::new();
    kinds.insert("append".into(), Value::from("append input to data.<path>; assign_id stamps an id"));
    kinds.insert("set".into(), Value::from("set data.<path> to input or input[field]"));
    kinds.insert("merge".into(), Value::from("shallow-merge input into data.<path>"));
    kinds.insert("unset".into(), Value::from("delete data.<path>"));
    kinds.insert("remove".into(), Value::from("soft-remove the element matching input[id_field]"));
    kinds.insert("restore".into(), Value::from("undo a soft removal"));
    kinds.insert("noop".into(), Value::from("no change"));
    kinds.insert("custom".into(), Value::from("dispatch to a registered effect handler"));
    Value::Object(kinds)
}
