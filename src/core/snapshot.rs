//! Snapshot: the full observable state at a World.
//!
//! Snapshots are values. Nothing in the crate mutates one after it has been
//! handed out; every transition builds a new snapshot through
//! `core::state_map`.

use crate::core::digest;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatus {
    #[default]
    Idle,
    Computing,
    Error,
}

/// Error record embedded in a snapshot's system block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorValue {
    pub code: String,
    pub message: String,
    pub source: Option<String>,
    pub timestamp: u64,
}

impl ErrorValue {
    pub fn new(code: &str, message: impl Into<String>, source: Option<&str>, timestamp: u64) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            source: source.map(|s| s.to_string()),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SystemBlock {
    pub status: SystemStatus,
    pub last_error: Option<ErrorValue>,
    pub errors: Vec<ErrorValue>,
    pub pending_requirements: Vec<Value>,
    pub current_action: Option<String>,
    /// Memory-recall context frozen for the action that produced this snapshot.
    pub recall: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    pub version: u64,
    pub timestamp: u64,
    pub random_seed: u64,
    pub schema_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Snapshot {
    pub data: Map<String, Value>,
    pub computed: Map<String, Value>,
    pub system: SystemBlock,
    pub meta: SnapshotMeta,
}

impl Snapshot {
    pub fn genesis(data: Map<String, Value>, schema_hash: &str) -> Self {
        Self {
            data,
            computed: Map::new(),
            system: SystemBlock::default(),
            meta: SnapshotMeta {
                version: 0,
                timestamp: 0,
                random_seed: 0,
                schema_hash: schema_hash.to_string(),
            },
        }
    }

    /// Content hash over `data` and `computed` only.
    pub fn content_hash(&self) -> String {
        let content = serde_json::json!({
            "data": Value::Object(self.data.clone()),
            "computed": Value::Object(self.computed.clone()),
        });
        digest::sha256_hex(&digest::canonical_json_bytes(&content))
    }

    /// Look up a dotted path rooted at the snapshot (`data.tasks`, `meta.version`).
    pub fn select(&self, path: &str) -> Option<Value> {
        let state = crate::core::state_map::to_state(self);
        crate::core::patch::get_path(&state, path).cloned()
    }
}
