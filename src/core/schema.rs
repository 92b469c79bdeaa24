//! Domain schema: the action catalogue, computed values, and initial data.
//!
//! A schema is declared in code with `DomainSchema::new(..)` and `declare` or
//! loaded from a TOML file. Its hash identifies the domain: worlds built
//! under one schema never mix with worlds built under another.

use crate::core::digest;
use crate::core::error::WorldlineError;
use crate::core::host::EffectBinding;
use crate::core::snapshot::{ErrorValue, Snapshot};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, LazyLock};

pub const UNKNOWN_ACTION: &str = "UNKNOWN_ACTION";
pub const INVALID_INPUT: &str = "INVALID_INPUT";

static ACTION_TYPE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z][A-Za-z0-9_]*(\.[A-Za-z][A-Za-z0-9_]*)*$").expect("static regex")
});

pub type ComputedFn = Arc<dyn Fn(&Map<String, Value>) -> Value + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub action_type: String,
    pub effect: EffectBinding,
    /// Input fields that must be present (and non-null) before a proposal is made.
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ActionSpec {
    pub fn new(action_type: &str, effect: EffectBinding) -> Self {
        Self {
            action_type: action_type.to_string(),
            effect,
            required: Vec::new(),
            description: None,
        }
    }

    pub fn require(mut self, fields: &[&str]) -> Self {
        self.required.extend(fields.iter().map(|f| f.to_string()));
        self
    }

    pub fn describe(mut self, text: &str) -> Self {
        self.description = Some(text.to_string());
        self
    }
}

#[derive(Clone)]
pub struct DomainSchema {
    schema_id: String,
    version: String,
    actions: BTreeMap<String, ActionSpec>,
    computed: BTreeMap<String, ComputedFn>,
    /// Computed values that are plain counts of a data collection; kept so
    /// file-declared schemas hash the same every time they are loaded.
    counters: BTreeMap<String, String>,
    initial_data: Map<String, Value>,
}

impl fmt::Debug for DomainSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainSchema")
            .field("schema_id", &self.schema_id)
            .field("version", &self.version)
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("computed", &self.computed.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct SchemaFile {
    schema_id: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    initial: Option<toml::Table>,
    #[serde(default)]
    actions: Vec<ActionSpec>,
    #[serde(default)]
    computed: Vec<CountSpec>,
}

#[derive(Debug, Deserialize)]
struct CountSpec {
    name: String,
    /// Data collection to count; soft-removed elements are skipped.
    count: String,
}

fn default_version() -> String {
    "1".to_string()
}

impl DomainSchema {
    pub fn new(schema_id: &str, version: &str) -> Self {
        Self {
            schema_id: schema_id.to_string(),
            version: version.to_string(),
            actions: BTreeMap::new(),
            computed: BTreeMap::new(),
            counters: BTreeMap::new(),
            initial_data: Map::new(),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, WorldlineError> {
        let file: SchemaFile = toml::from_str(raw)
            .map_err(|e| WorldlineError::ConfigError(format!("invalid schema file: {}", e)))?;
        let mut schema = DomainSchema::new(&file.schema_id, &file.version);
        if let Some(initial) = file.initial {
            let value = serde_json::to_value(initial)?;
            if let Value::Object(map) = value {
                schema.initial_data = map;
            }
        }
        for spec in file.actions {
            schema.try_action(spec)?;
        }
        for counter in file.computed {
            schema.count(&counter.name, &counter.count);
        }
        Ok(schema)
    }

    pub fn load(path: &Path) -> Result<Self, WorldlineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WorldlineError::ConfigError(format!("failed to read schema {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Register an action, rejecting malformed or duplicate types.
    pub fn try_action(&mut self, spec: ActionSpec) -> Result<&mut Self, WorldlineError> {
        if !ACTION_TYPE_RE.is_match(&spec.action_type) {
            return Err(WorldlineError::ValidationError(format!(
                "invalid action type '{}'",
                spec.action_type
            )));
        }
        if self.actions.contains_key(&spec.action_type) {
            return Err(WorldlineError::ValidationError(format!(
                "action '{}' declared twice",
                spec.action_type
            )));
        }
        self.actions.insert(spec.action_type.clone(), spec);
        Ok(self)
    }

    /// Builder form of `try_action` for schemas declared in code.
    ///
    /// # Panics
    /// On an invalid or duplicate action type.
    pub fn declare(&mut self, spec: ActionSpec) -> &mut Self {
        if let Err(e) = self.try_action(spec) {
            panic!("{}", e);
        }
        self
    }

    pub fn computed<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&Map<String, Value>) -> Value + Send + Sync + 'static,
    {
        self.computed.insert(name.to_string(), Arc::new(f));
        self
    }

    /// Computed value counting the live elements of `data.<collection>`.
    pub fn count(&mut self, name: &str, collection: &str) -> &mut Self {
        self.counters.insert(name.to_string(), collection.to_string());
        let collection = collection.to_string();
        self.computed(name, move |data| {
            let live = data
                .get(&collection)
                .and_then(Value::as_array)
                .map_or(0, |items| {
                    items
                        .iter()
                        .filter(|i| i.get(crate::core::patch::SOFT_REMOVED_FIELD).is_none())
                        .count()
                });
            Value::from(live)
        })
    }

    pub fn initial(&mut self, data: Map<String, Value>) -> &mut Self {
        self.initial_data = data;
        self
    }

    pub fn schema_id(&self) -> &str {
        &self.schema_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn action(&self, action_type: &str) -> Option<&ActionSpec> {
        self.actions.get(action_type)
    }

    pub fn actions(&self) -> impl Iterator<Item = &ActionSpec> {
        self.actions.values()
    }

    /// Identity of the domain. Computed closures contribute their names only.
    pub fn schema_hash(&self) -> String {
        let doc = serde_json::json!({
            "schemaId": self.schema_id,
            "version": self.version,
            "actions": self.actions.values().collect::<Vec<_>>(),
            "computed": self.computed.keys().collect::<Vec<_>>(),
            "counters": self.counters,
            "initial": Value::Object(self.initial_data.clone()),
        });
        digest::sha256_hex(&digest::canonical_json_bytes(&doc))
    }

    pub fn compute(&self, data: &Map<String, Value>) -> Map<String, Value> {
        self.computed
            .iter()
            .map(|(name, f)| (name.clone(), f(data)))
            .collect()
    }

    /// Snapshot every runtime on this schema starts from.
    pub fn genesis_snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::genesis(self.initial_data.clone(), &self.schema_hash());
        snapshot.computed = self.compute(&snapshot.data);
        snapshot
    }

    /// Check an incoming action before any proposal exists for it.
    pub fn validate_intent(&self, action_type: &str, input: &Value, now: u64) -> Result<&ActionSpec, ErrorValue> {
        let spec = self.actions.get(action_type).ok_or_else(|| {
            ErrorValue::new(
                UNKNOWN_ACTION,
                format!("action '{}' is not declared by schema {}", action_type, self.schema_id),
                Some(action_type),
                now,
            )
        })?;
        if spec.required.is_empty() {
            return Ok(spec);
        }
        let Some(fields) = input.as_object() else {
            return Err(ErrorValue::new(
                INVALID_INPUT,
                format!("action '{}' expects an object input", action_type),
                Some(action_type),
                now,
            ));
        };
        let missing: Vec<&str> = spec
            .required
            .iter()
            .filter(|f| fields.get(f.as_str()).is_none_or(Value::is_null))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(ErrorValue::new(
                INVALID_INPUT,
                format!("action '{}' is missing required field(s): {}", action_type, missing.join(", ")),
                Some(action_type),
                now,
            ));
        }
        Ok(spec)
    }
}
