use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use worldline::core::host::{self, EffectType};
use worldline::core::patch::SOFT_REMOVED_FIELD;
use worldline::core::snapshot::Snapshot;
use worldline::plugins::effects::{derive_element_id, describe_builtins, standard_registry};
use worldline::{
    ActOptions, ActionOutcome, DomainSchema, EffectContext, PatchBuilder, Runtime, WorldlineError,
};

const WAIT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
schema_id = "inventory"
version = "1"

[initial]
items = []
settings = { theme = "light" }
stats = {}

[[actions]]
action_type = "addItem"
required = ["sku"]
effect = { kind = "append", path = "items", assign_id = true }

[[actions]]
action_type = "dropItem"
required = ["sku"]
effect = { kind = "remove", path = "items", id_field = "sku" }

[[actions]]
action_type = "returnItem"
required = ["sku"]
effect = { kind = "restore", path = "items", id_field = "sku" }

[[actions]]
action_type = "configure"
effect = { kind = "merge", path = "settings" }

[[actions]]
action_type = "resetSettings"
effect = { kind = "unset", path = "settings" }

[[actions]]
action_type = "ping"
effect = { kind = "noop" }

[[actions]]
action_type = "edit"
required = ["patches"]
effect = { kind = "custom", effect = "patch.apply" }

[[actions]]
action_type = "bump"
required = ["path"]
effect = { kind = "custom", effect = "counter.increment" }

[[actions]]
action_type = "pickWinner"
required = ["from", "into"]
effect = { kind = "custom", effect = "random.pick" }

[[computed]]
name = "itemCount"
count = "items"
"#;

fn runtime() -> Runtime {
    let schema = DomainSchema::from_toml_str(SCHEMA).unwrap();
    Runtime::builder(schema)
        .effects(standard_registry().unwrap())
        .build()
        .unwrap()
}

fn act_with(rt: &Runtime, action: &str, input: Value, opts: ActOptions) -> ActionOutcome {
    rt.act(action, input, opts)
        .unwrap()
        .result_timeout(WAIT)
        .expect("action settled")
}

fn act(rt: &Runtime, action: &str, input: Value) -> ActionOutcome {
    let outcome = act_with(rt, action, input, ActOptions::default());
    assert!(outcome.is_completed(), "{} failed: {:?}", action, outcome);
    outcome
}

fn data(rt: &Runtime) -> serde_json::Map<String, Value> {
    rt.get_state().unwrap().data.clone()
}

#[test]
fn test_soft_remove_and_restore_by_custom_field() {
    let rt = runtime();
    act(&rt, "addItem", json!({"sku": "A-1", "qty": 2}));
    act(&rt, "addItem", json!({"sku": "B-7", "qty": 1}));
    assert_eq!(rt.get_state().unwrap().computed["itemCount"], json!(2));

    act(&rt, "dropItem", json!({"sku": "A-1"}));
    let items = data(&rt)["items"].clone();
    assert_eq!(items.as_array().unwrap().len(), 2);
    assert!(items[0].get(SOFT_REMOVED_FIELD).is_some());
    assert!(items[1].get(SOFT_REMOVED_FIELD).is_none());
    assert_eq!(rt.get_state().unwrap().computed["itemCount"], json!(1));

    act(&rt, "returnItem", json!({"sku": "A-1"}));
    assert!(data(&rt)["items"][0].get(SOFT_REMOVED_FIELD).is_none());
    assert_eq!(rt.get_state().unwrap().computed["itemCount"], json!(2));
}

#[test]
fn test_remove_without_match_fails_the_action() {
    let rt = runtime();
    let head = rt.get_current_head().unwrap();
    let outcome = act_with(&rt, "dropItem", json!({"sku": "missing"}), ActOptions::default());
    assert_eq!(outcome.error().map(|e| e.code.as_str()), Some(host::PATCH_FAILED));
    assert_eq!(rt.get_current_head().unwrap(), head);
}

#[test]
fn test_appended_ids_are_stable_per_position() {
    let rt = runtime();
    act(&rt, "addItem", json!({"sku": "A-1"}));
    act(&rt, "addItem", json!({"sku": "A-2", "id": "explicit"}));
    let items = data(&rt)["items"].clone();
    let first = items[0]["id"].as_str().unwrap();
    assert_eq!(first.len(), 16);
    assert_eq!(items[1]["id"], json!("explicit"));

    assert_eq!(derive_element_id("key", "items", 0), derive_element_id("key", "items", 0));
    assert_ne!(derive_element_id("key", "items", 0), derive_element_id("key", "items", 1));
    assert_ne!(derive_element_id("key", "items", 0), derive_element_id("other", "items", 0));
}

#[test]
fn test_merge_unset_and_noop() {
    let rt = runtime();
    act(&rt, "configure", json!({"lang": "en"}));
    assert_eq!(data(&rt)["settings"], json!({"theme": "light", "lang": "en"}));

    let before = rt.get_current_head().unwrap();
    let outcome = act(&rt, "ping", json!({}));
    // A noop still advances history with identical content.
    assert_ne!(outcome.world_id(), Some(before.as_str()));
    assert_eq!(
        rt.get_snapshot(outcome.world_id().unwrap()).unwrap().data,
        rt.get_snapshot(&before).unwrap().data
    );

    act(&rt, "resetSettings", json!({}));
    assert!(data(&rt).get("settings").is_none());

    let bad = act_with(&rt, "configure", json!("dark"), ActOptions::default());
    assert_eq!(bad.error().map(|e| e.code.as_str()), Some(host::EFFECT_FAILED));
}

#[test]
fn test_patch_apply_and_counter() {
    let rt = runtime();
    act(
        &rt,
        "edit",
        json!({"patches": [
            {"op": "set", "path": "stats.visits", "value": 10},
            {"op": "append", "path": "items", "value": {"sku": "Z-9", "id": "z9"}},
        ]}),
    );
    act(&rt, "bump", json!({"path": "stats.visits", "by": 5}));
    act(&rt, "bump", json!({"path": "stats.fresh"}));

    let state = data(&rt);
    assert_eq!(state["stats"]["visits"], json!(15));
    assert_eq!(state["stats"]["fresh"], json!(1));
    assert_eq!(state["items"][0]["id"], json!("z9"));

    let bad = act_with(&rt, "bump", json!({"path": "items"}), ActOptions::default());
    let error = bad.error().expect("bumping a list fails");
    assert_eq!(error.code, host::EFFECT_FAILED);
    assert_eq!(error.source.as_deref(), Some("bump"));
}

#[test]
fn test_random_pick_is_reproducible() {
    let input = json!({"from": ["ana", "ben", "cy", "dee"], "into": "winner"});
    let opts = ActOptions {
        actor_id: Some("draw".into()),
        intent_key: Some("weekly-draw".into()),
        ..ActOptions::default()
    };
    let picks: Vec<Value> = (0..2)
        .map(|_| {
            let rt = runtime();
            act_with(&rt, "pickWinner", input.clone(), opts.clone());
            data(&rt)["winner"].clone()
        })
        .collect();
    assert_eq!(picks[0], picks[1]);
    assert!(input["from"].as_array().unwrap().contains(&picks[0]));
}

#[test]
fn test_standard_handlers_called_directly() {
    let registry = standard_registry().unwrap();
    assert_eq!(
        registry.effect_types(),
        vec!["counter.increment", "patch.apply", "random.pick"]
    );

    let mut data = serde_json::Map::new();
    data.insert("hits".into(), json!(41));
    let ctx = EffectContext::detached(Arc::new(Snapshot::genesis(data, "h")), "k", "bump");
    let handler = registry
        .get(&EffectType::new("counter.increment").unwrap())
        .unwrap();
    let mut out = PatchBuilder::new();
    handler.handle(&ctx, &json!({"path": "hits"}), &mut out).unwrap();
    assert_eq!(out.len(), 1);

    let err = registry.get(&EffectType::new("mail.send").unwrap()).err().unwrap();
    assert!(matches!(err, WorldlineError::EffectNotRegistered(_)));

    let kinds = describe_builtins();
    for kind in ["append", "set", "merge", "unset", "remove", "restore", "noop", "custom"] {
        assert!(kinds.get(kind).is_some(), "{} undocumented", kind);
    }
}

#[test]
fn test_unregistered_custom_effect_fails_build() {
    let schema = DomainSchema::from_toml_str(SCHEMA).unwrap();
    let err = Runtime::builder(schema).build().err().unwrap();
    assert!(matches!(err, WorldlineError::EffectNotRegistered(_)), "{:?}", err);
}
