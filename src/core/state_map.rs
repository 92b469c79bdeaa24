//! The one mapping between `Snapshot` and its JSON state tree.
//!
//! Patches are expressed against the state tree (`data.*`, `computed.*`,
//! `system.*`, `meta.*`). Applying, diffing, and selecting all go through
//! here so there is exactly one place that knows the snapshot's shape.

use crate::core::error::WorldlineError;
use crate::core::patch::{self, Patch};
use crate::core::snapshot::Snapshot;
use serde_json::{Map, Value};

pub const SECTIONS: [&str; 4] = ["data", "computed", "system", "meta"];

pub fn to_state(snapshot: &Snapshot) -> Value {
    // A Snapshot only holds JSON-compatible fields.
    serde_json::to_value(snapshot).unwrap_or(Value::Null)
}

pub fn from_state(state: Value) -> Result<Snapshot, WorldlineError> {
    if !state.is_object() {
        return Err(WorldlineError::ValidationError(
            "snapshot state must be an object".to_string(),
        ));
    }
    serde_json::from_value(state).map_err(|e| {
        WorldlineError::ValidationError(format!("state does not map to a snapshot: {}", e))
    })
}

/// Build a new snapshot by applying `patches` to `base`. `base` is untouched.
pub fn apply(base: &Snapshot, patches: &[Patch], now: u64) -> Result<Snapshot, WorldlineError> {
    let mut state = to_state(base);
    for p in patches {
        let root = p.path().split('.').next().unwrap_or_default();
        if !SECTIONS.contains(&root) {
            return Err(WorldlineError::ValidationError(format!(
                "patch path '{}' is outside the snapshot sections",
                p.path()
            )));
        }
    }
    patch::apply_patches(&mut state, patches, now)?;
    from_state(state)
}

/// Coarse delta from `before` to `after`, one patch per changed top-level key
/// of each section.
pub fn diff(before: &Snapshot, after: &Snapshot) -> Vec<Patch> {
    let before_state = to_state(before);
    let after_state = to_state(after);
    let empty = Map::new();
    let mut out = Vec::new();
    for section in SECTIONS {
        let a = before_state.get(section).and_then(Value::as_object).unwrap_or(&empty);
        let b = after_state.get(section).and_then(Value::as_object).unwrap_or(&empty);
        out.extend(patch::diff_object(section, a, b));
    }
    out
}

/// Domain data paths a delta touches. `computed` is derived by the runtime
/// after every execution and is never attributed to the effect.
pub fn mutated_paths(patches: &[Patch]) -> Vec<String> {
    let mut paths: Vec<String> = patches
        .iter()
        .map(|p| p.path().to_string())
        .filter(|p| p.starts_with("data."))
        .collect();
    paths.sort();
    paths.dedup();
    paths
}
