use serde_json::{Value, json};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use worldline::core::branch::{ForkOptions, MAIN_BRANCH};
use worldline::core::host::EffectType;
use worldline::core::proposal::{ActorKind, ProposalStatus};
use worldline::core::subscription::SubscribeOptions;
use worldline::{
    ActOptions, ActionOutcome, ActionSpec, DomainSchema, EffectBinding, EffectContext, EffectError,
    EffectRegistry, PatchBuilder, Runtime,
};

const WAIT: Duration = Duration::from_secs(5);

fn runtime() -> Runtime {
    Runtime::builder(notes_schema()).build().unwrap()
}

fn notes_schema() -> DomainSchema {
    let mut schema = DomainSchema::new("notes", "1");
    schema
        .initial(json!({"notes": []}).as_object().cloned().unwrap())
        .declare(
            ActionSpec::new(
                "addNote",
                EffectBinding::Append {
                    path: "notes".into(),
                    assign_id: true,
                },
            )
            .require(&["text"]),
        )
        .declare(ActionSpec::new(
            "setTitle",
            EffectBinding::Set {
                path: "title".into(),
                field: Some("title".into()),
            },
        ))
        .count("noteCount", "notes");
    schema
}

/// `detour` forks a `side` branch at `input.at` and switches to it, waits for
/// the switch to land, then appends a note to the branch it started on.
fn detour_runtime() -> Runtime {
    let slot: Arc<OnceLock<Runtime>> = Arc::default();
    let effect_slot = Arc::clone(&slot);
    let mut registry = EffectRegistry::new();
    registry
        .register(
            "test.detour",
            move |ctx: &EffectContext, input: &Value, p: &mut PatchBuilder| -> Result<(), EffectError> {
                let rt = effect_slot
                    .get()
                    .ok_or_else(|| EffectError::new("runtime not ready"))?;
                ctx.submit(
                    "system.branch.fork",
                    json!({"name": "side", "atWorld": input["at"], "switch": true}),
                )
                .map_err(|e| EffectError::new(e.to_string()))?;
                let deadline = Instant::now() + WAIT;
                while !rt.current_branch().is_ok_and(|b| b.name == "side") {
                    if Instant::now() > deadline {
                        return Err(EffectError::new("switch never happened"));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                p.append("notes", json!({"text": "late"}));
                Ok(())
            },
        )
        .unwrap();
    let mut schema = notes_schema();
    schema.declare(ActionSpec::new(
        "detour",
        EffectBinding::Custom {
            effect: EffectType::new("test.detour").unwrap(),
        },
    ));
    let rt = Runtime::builder(schema)
        .effects(registry)
        .build()
        .unwrap();
    let _ = slot.set(rt.clone());
    rt
}

fn act_with(rt: &Runtime, action: &str, input: Value, opts: ActOptions) -> ActionOutcome {
    rt.act(action, input, opts)
        .unwrap()
        .result_timeout(WAIT)
        .expect("action settled")
}

fn act(rt: &Runtime, action: &str, input: Value) -> ActionOutcome {
    act_with(rt, action, input, ActOptions::default())
}

fn note_count(rt: &Runtime) -> Value {
    rt.get_state().unwrap().computed["noteCount"].clone()
}

#[test]
fn test_fork_action_switches_and_isolates_history() {
    let rt = runtime();
    assert!(act(&rt, "addNote", json!({"text": "shared"})).is_completed());
    let main_head = rt.get_current_head().unwrap();
    let worlds = rt.store().list_worlds().unwrap().len();

    let outcome = act(&rt, "system.branch.fork", json!({"name": "draft", "switch": true}));
    let ActionOutcome::Completed { world_id, detail } = outcome else {
        panic!("fork should complete, got {:?}", outcome);
    };
    assert_eq!(world_id, main_head);
    let detail = detail.expect("fork reports the new branch");
    assert_eq!(detail["name"], json!("draft"));
    assert_eq!(rt.store().list_worlds().unwrap().len(), worlds);

    let draft = rt.current_branch().unwrap();
    assert_eq!(draft.name, "draft");
    assert_eq!(draft.parent_branch.as_deref(), Some(MAIN_BRANCH));
    assert_eq!(draft.head, main_head);

    assert!(act(&rt, "addNote", json!({"text": "draft only"})).is_completed());
    assert_eq!(note_count(&rt), json!(2));
    assert_eq!(rt.get_branch(MAIN_BRANCH).unwrap().head, main_head);

    let outcome = act(&rt, "system.branch.switch", json!({"branchId": MAIN_BRANCH}));
    assert!(outcome.is_completed());
    assert_eq!(rt.current_branch().unwrap().branch_id, MAIN_BRANCH);
    assert_eq!(note_count(&rt), json!(1));
    assert_eq!(rt.list_branches().unwrap().len(), 2);
}

#[test]
fn test_act_on_non_current_branch() {
    let rt = runtime();
    let fork = rt.fork(ForkOptions::default()).unwrap();
    let opts = ActOptions {
        branch_id: Some(fork.branch_id.clone()),
        ..ActOptions::default()
    };
    let outcome = act_with(&rt, "setTitle", json!({"title": "side"}), opts);
    let head = outcome.world_id().unwrap().to_string();

    assert_eq!(rt.get_branch(&fork.branch_id).unwrap().head, head);
    assert_eq!(rt.current_branch().unwrap().branch_id, MAIN_BRANCH);
    assert!(rt.get_state().unwrap().data.get("title").is_none());
    assert_eq!(rt.get_snapshot(&head).unwrap().data["title"], json!("side"));
}

#[test]
fn test_fork_at_ancestor() {
    let rt = runtime();
    let genesis = rt.get_current_head().unwrap();
    act(&rt, "addNote", json!({"text": "one"}));
    act(&rt, "addNote", json!({"text": "two"}));

    let fork = rt
        .fork(ForkOptions {
            name: Some("from-start".into()),
            at_world: Some(genesis.clone()),
            switch: true,
            ..ForkOptions::default()
        })
        .unwrap();
    assert_eq!(fork.head, genesis);
    assert_eq!(fork.forked_from.as_deref(), Some(genesis.as_str()));
    assert_eq!(note_count(&rt), json!(0));
}

#[test]
fn test_reset_action_rewinds_head_and_bumps_epoch() {
    let rt = runtime();
    let genesis = rt.get_current_head().unwrap();
    act(&rt, "addNote", json!({"text": "one"}));
    act(&rt, "addNote", json!({"text": "two"}));
    assert_eq!(note_count(&rt), json!(2));

    let outcome = act(&rt, "system.branch.reset", json!({"worldId": genesis}));
    assert_eq!(outcome.world_id(), Some(genesis.as_str()));
    let main = rt.current_branch().unwrap();
    assert_eq!(main.head, genesis);
    assert_eq!(main.epoch, 1);
    assert_eq!(note_count(&rt), json!(0));

    // History is kept; only the pointer moved.
    assert_eq!(rt.store().list_worlds().unwrap().len(), 3);

    assert!(act(&rt, "addNote", json!({"text": "after reset"})).is_completed());
    assert_eq!(note_count(&rt), json!(1));
}

#[test]
fn test_reset_to_unrelated_world_fails() {
    let rt = runtime();
    let fork = rt.fork(ForkOptions::default()).unwrap();
    let side = act_with(
        &rt,
        "addNote",
        json!({"text": "side"}),
        ActOptions {
            branch_id: Some(fork.branch_id.clone()),
            ..ActOptions::default()
        },
    );
    let side_world = side.world_id().unwrap().to_string();
    let head = rt.get_current_head().unwrap();

    let handle = rt
        .act(
            "system.branch.reset",
            json!({"branchId": MAIN_BRANCH, "worldId": side_world}),
            ActOptions::default(),
        )
        .unwrap();
    let outcome = handle.result_timeout(WAIT).unwrap();
    let ActionOutcome::Failed { world_id, error } = outcome else {
        panic!("reset should fail, got {:?}", outcome);
    };
    assert!(world_id.is_none());
    assert_eq!(error.code, "VALIDATION");
    assert_eq!(rt.get_current_head().unwrap(), head);
    assert_eq!(
        rt.get_proposal(handle.proposal_id()).unwrap().status,
        ProposalStatus::Failed
    );
}

#[test]
fn test_switch_to_unknown_branch_fails() {
    let rt = runtime();
    let outcome = act(&rt, "system.branch.switch", json!({"branchId": "nope"}));
    assert_eq!(outcome.error().map(|e| e.code.as_str()), Some("BRANCH_NOT_FOUND"));
    assert_eq!(rt.current_branch().unwrap().branch_id, MAIN_BRANCH);
}

#[test]
fn test_malformed_system_input_fails_preparation() {
    let rt = runtime();
    let outcome = act(&rt, "system.branch.reset", json!({"branch": "main"}));
    assert!(matches!(outcome, ActionOutcome::PreparationFailed { .. }));
    let outcome = act(&rt, "system.branch.merge", json!({}));
    let ActionOutcome::PreparationFailed { error } = outcome else {
        panic!("unknown system action should not be submitted");
    };
    assert_eq!(error.code, "UNKNOWN_ACTION");
}

#[test]
fn test_register_actor_action() {
    let rt = runtime();
    let handle = rt
        .act(
            "system.actor.register",
            json!({"actorId": "reviewer-1", "kind": "human", "name": "Reviewer"}),
            ActOptions::default(),
        )
        .unwrap();
    assert!(handle.result_timeout(WAIT).unwrap().is_completed());
    let actor = rt.store().get_actor("reviewer-1").unwrap().unwrap();
    assert_eq!(actor.kind, ActorKind::Human);

    let proposal = rt.get_proposal(handle.proposal_id()).unwrap();
    assert_eq!(proposal.actor.kind, ActorKind::System);
    assert_eq!(proposal.status, ProposalStatus::Completed);

    let outcome = act_with(
        &rt,
        "addNote",
        json!({"text": "by reviewer"}),
        ActOptions {
            actor_id: Some("reviewer-1".into()),
            ..ActOptions::default()
        },
    );
    let world = rt.get_world(outcome.world_id().unwrap()).unwrap();
    let by = rt.get_proposal(world.created_by.as_deref().unwrap()).unwrap();
    assert_eq!(by.actor.kind, ActorKind::Human);
}

#[test]
fn test_subscription_follows_current_branch() {
    let rt = runtime();
    let genesis = rt.get_current_head().unwrap();
    let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let sub = rt
        .subscribe(
            |s| s.computed["noteCount"].clone(),
            move |v| sink.lock().unwrap().push(v.clone()),
            SubscribeOptions {
                fire_immediately: true,
            },
        )
        .unwrap();

    act(&rt, "addNote", json!({"text": "one"}));
    act(&rt, "setTitle", json!({"title": "unchanged count"}));
    act(&rt, "addNote", json!({"text": "two"}));
    assert_eq!(*seen.lock().unwrap(), vec![json!(0), json!(1), json!(2)]);

    rt.fork(ForkOptions {
        at_world: Some(genesis),
        switch: true,
        ..ForkOptions::default()
    })
    .unwrap();
    assert_eq!(seen.lock().unwrap().last(), Some(&json!(0)));

    sub.unsubscribe();
    act(&rt, "addNote", json!({"text": "unheard"}));
    assert_eq!(seen.lock().unwrap().len(), 4);
}

#[test]
fn test_switch_during_domain_work_reaches_listeners() {
    let rt = detour_runtime();
    let genesis = rt.get_current_head().unwrap();
    assert!(act(&rt, "addNote", json!({"text": "first"})).is_completed());

    let seen: Arc<Mutex<Vec<Value>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let sub = rt
        .subscribe(
            |s| s.computed["noteCount"].clone(),
            move |v| sink.lock().unwrap().push(v.clone()),
            SubscribeOptions::default(),
        )
        .unwrap();

    let outcome = act(&rt, "detour", json!({"at": genesis}));
    assert!(outcome.is_completed(), "{:?}", outcome);
    // The system lane is FIFO: once this settles, the fork job has finished.
    let barrier = act(&rt, "system.actor.register", json!({"actorId": "observer"}));
    assert!(barrier.is_completed(), "{:?}", barrier);

    let side = rt.current_branch().unwrap();
    assert_eq!(side.name, "side");
    assert_eq!(note_count(&rt), json!(0));
    let main = rt.get_branch(MAIN_BRANCH).unwrap();
    assert_eq!(main.head, outcome.world_id().unwrap());
    assert_eq!(rt.get_snapshot(&main.head).unwrap().computed["noteCount"], json!(2));

    // Listeners end on the switched-to branch, not on main's finished work.
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.last(), Some(&json!(0)), "{:?}", seen);
    sub.unsubscribe();
}
