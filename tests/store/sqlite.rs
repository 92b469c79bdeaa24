use serde_json::{Map, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use worldline::core::broker::read_audit_log;
use worldline::core::patch::Patch;
use worldline::core::proposal::ActorKind;
use worldline::core::snapshot::Snapshot;
use worldline::core::sqlite_store::SqliteWorldStore;
use worldline::core::state_map;
use worldline::core::store::WorldStore;
use worldline::core::world::{World, WorldDelta, WorldOutcome};
use worldline::{ActOptions, ActionSpec, DomainSchema, EffectBinding, Runtime, WorldlineError};

const WAIT: Duration = Duration::from_secs(5);

fn ledger_schema(version: &str) -> DomainSchema {
    let mut schema = DomainSchema::new("ledger", version);
    schema
        .initial(json!({"entries": []}).as_object().cloned().unwrap())
        .declare(
            ActionSpec::new(
                "addEntry",
                EffectBinding::Append {
                    path: "entries".into(),
                    assign_id: true,
                },
            )
            .require(&["amount"]),
        )
        .count("entryCount", "entries");
    schema
}

fn open_runtime(root: &std::path::Path, version: &str) -> Result<Runtime, WorldlineError> {
    let store: Arc<dyn WorldStore> = Arc::new(SqliteWorldStore::open(root, 4)?);
    Runtime::builder(ledger_schema(version)).store(store).build()
}

fn add_entry(rt: &Runtime, amount: i64) -> String {
    let outcome = rt
        .act("addEntry", json!({"amount": amount}), ActOptions::default())
        .unwrap()
        .result_timeout(WAIT)
        .unwrap();
    assert!(outcome.is_completed(), "{:?}", outcome);
    outcome.world_id().unwrap().to_string()
}

fn step(store: &SqliteWorldStore, parent: &World, base: &Snapshot, n: u64) -> (World, Snapshot) {
    let patches = vec![
        Patch::Append {
            path: "data.items".into(),
            value: json!(n),
        },
        Patch::Set {
            path: "meta.version".into(),
            value: json!(base.meta.version + 1),
        },
    ];
    let next = state_map::apply(base, &patches, n).unwrap();
    let world = World::derived(
        "schema",
        &next.content_hash(),
        &parent.world_id,
        &format!("p{}", n),
        WorldOutcome::Completed,
        n,
    );
    let delta = WorldDelta {
        from_world: parent.world_id.clone(),
        to_world: world.world_id.clone(),
        patches,
        created_at: n,
    };
    store.store(&world, &delta, &next).unwrap();
    (world, next)
}

#[test]
fn test_history_survives_reopen() {
    let dir = tempdir().unwrap();
    let (head, proposal_id) = {
        let rt = open_runtime(dir.path(), "1").unwrap();
        add_entry(&rt, 10);
        let head = add_entry(&rt, 25);
        let world = rt.get_world(&head).unwrap();
        (head, world.created_by.unwrap())
    };

    let rt = open_runtime(dir.path(), "1").unwrap();
    assert_eq!(rt.get_current_head().unwrap(), head);
    let state = rt.get_state().unwrap();
    assert_eq!(state.computed["entryCount"], json!(2));
    assert_eq!(state.data["entries"][1]["amount"], json!(25));
    assert_eq!(rt.lineage(&head).unwrap().len(), 3);
    assert!(rt.get_proposal(&proposal_id).unwrap().result_world.is_some());

    add_entry(&rt, 5);
    assert_eq!(rt.get_state().unwrap().computed["entryCount"], json!(3));
}

#[test]
fn test_reopen_with_different_schema_is_refused() {
    let dir = tempdir().unwrap();
    {
        let rt = open_runtime(dir.path(), "1").unwrap();
        add_entry(&rt, 1);
    }
    let err = open_runtime(dir.path(), "2").err().expect("reopen with a different schema should fail");
    assert!(matches!(err, WorldlineError::ConfigError(_)), "{:?}", err);
}

#[test]
fn test_restore_replays_deltas_after_reopen() {
    let dir = tempdir().unwrap();
    let (target, expected) = {
        let store = SqliteWorldStore::open(dir.path(), 4).unwrap();
        let genesis_snapshot = Snapshot::genesis(Map::new(), "schema");
        let mut world = World::genesis("schema", &genesis_snapshot.content_hash(), 0);
        store.store_genesis(&world, &genesis_snapshot).unwrap();
        let mut snapshot = genesis_snapshot;
        for n in 1..=7 {
            (world, snapshot) = step(&store, &world, &snapshot, n);
        }
        (world, snapshot)
    };

    let store = SqliteWorldStore::open(dir.path(), 4).unwrap();
    assert!(store.cached_snapshot(&target.world_id).unwrap().is_none());
    let restored = store.restore(&target.world_id).unwrap();
    assert_eq!(restored, expected);
    assert_eq!(restored.data["items"], json!([1, 2, 3, 4, 5, 6, 7]));
    assert_eq!(store.list_worlds().unwrap().len(), 8);
}

#[test]
fn test_duplicate_world_is_rejected() {
    let dir = tempdir().unwrap();
    let store = SqliteWorldStore::open(dir.path(), 4).unwrap();
    let genesis_snapshot = Snapshot::genesis(Map::new(), "schema");
    let genesis = World::genesis("schema", &genesis_snapshot.content_hash(), 0);
    store.store_genesis(&genesis, &genesis_snapshot).unwrap();
    store.store_genesis(&genesis, &genesis_snapshot).unwrap();
    let (world, snapshot) = step(&store, &genesis, &genesis_snapshot, 1);

    let delta = store.get_delta(&world.world_id).unwrap();
    let err = store.store(&world, &delta, &snapshot).unwrap_err();
    assert!(matches!(err, WorldlineError::WorldAlreadyExists(_)));
    assert_eq!(store.list_worlds().unwrap().len(), 2);
}

#[test]
fn test_actor_registry_persists() {
    let dir = tempdir().unwrap();
    {
        let rt = open_runtime(dir.path(), "1").unwrap();
        rt.register_actor("auditor", ActorKind::Human, Some("Auditor"))
            .unwrap();
    }
    let store = SqliteWorldStore::open(dir.path(), 4).unwrap();
    let actor = store.get_actor("auditor").unwrap().unwrap();
    assert_eq!(actor.kind, ActorKind::Human);
    assert!(store.get_actor("nobody").unwrap().is_none());
}

#[test]
fn test_audit_log_records_store_operations() {
    let dir = tempdir().unwrap();
    let rt = open_runtime(dir.path(), "1").unwrap();
    add_entry(&rt, 3);

    let events = read_audit_log(dir.path()).unwrap();
    assert!(!events.is_empty());
    let stores: Vec<_> = events.iter().filter(|e| e.op == "world.store").collect();
    // Genesis plus one action.
    assert_eq!(stores.len(), 2);
    assert!(stores.iter().all(|e| e.status == "success"));
    assert!(stores[1].intent_ref.is_some());
    assert!(events.iter().any(|e| e.op == "branch.put"));
    assert!(events.iter().all(|e| e.db_id == "worlds.db"));

    assert!(matches!(
        rt.store().get_world("no-such-world"),
        Err(WorldlineError::WorldNotFound(_))
    ));
    let events = read_audit_log(dir.path()).unwrap();
    assert!(
        events
            .iter()
            .any(|e| e.op == "world.get" && e.status == "error")
    );
}

#[test]
fn test_runtime_heads_follow_snapshot_interval() {
    let dir = tempdir().unwrap();
    let rt = open_runtime(dir.path(), "1").unwrap();
    let store = rt.store();
    let heads: Vec<String> = (1..=5).map(|n| add_entry(&rt, n)).collect();

    for (i, head) in heads.iter().enumerate() {
        let version = i + 1;
        assert_eq!(
            store.cached_snapshot(head).unwrap().is_some(),
            version % 4 == 0,
            "world at version {}",
            version
        );
    }

    let tip = store.restore(&heads[4]).unwrap();
    assert_eq!(tip.content_hash(), rt.get_state().unwrap().content_hash());
    assert_eq!(rt.get_state().unwrap().computed["entryCount"], json!(5));
}
