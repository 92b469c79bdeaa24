use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use worldline::core::host::{self, EffectType};
use worldline::core::proposal::{ActorRef, Proposal, ProposalStatus};
use worldline::core::snapshot::{Snapshot, SystemStatus};
use worldline::core::store::{MemoryWorldStore, StoreKind, WorldStore};
use worldline::core::world::{Branch, World, WorldDelta, WorldOutcome};
use worldline::plugins::policy::{Approval, Decision, PolicyContext, PolicyService};
use worldline::{
    ActOptions, ActionOutcome, ActionPhase, ActionSpec, DomainSchema, EffectBinding, EffectContext,
    EffectError, EffectRegistry, PatchBuilder, Runtime, SubmitResult, WorldlineError,
};

const WAIT: Duration = Duration::from_secs(5);

fn tasks_schema() -> DomainSchema {
    let mut schema = DomainSchema::new("tasks", "1");
    schema
        .initial(json!({"tasks": []}).as_object().cloned().unwrap())
        .declare(
            ActionSpec::new(
                "createTask",
                EffectBinding::Append {
                    path: "tasks".into(),
                    assign_id: true,
                },
            )
            .require(&["title"]),
        )
        .declare(ActionSpec::new(
            "slowTask",
            EffectBinding::Custom {
                effect: EffectType::new("test.slow").unwrap(),
            },
        ))
        .declare(ActionSpec::new(
            "brokenTask",
            EffectBinding::Custom {
                effect: EffectType::new("test.broken").unwrap(),
            },
        ))
        .count("taskCount", "tasks");
    schema
}

fn registry() -> EffectRegistry {
    let mut registry = EffectRegistry::new();
    registry
        .register(
            "test.slow",
            |_: &EffectContext, _: &Value, p: &mut PatchBuilder| -> Result<(), EffectError> {
                std::thread::sleep(Duration::from_millis(300));
                p.set("slow", json!(true));
                Ok(())
            },
        )
        .unwrap()
        .register(
            "test.broken",
            |_: &EffectContext, _: &Value, _: &mut PatchBuilder| -> Result<(), EffectError> {
                Err(EffectError::with_code("UPSTREAM_DOWN", "billing service unavailable"))
            },
        )
        .unwrap();
    registry
}

fn runtime_with(policy: Option<Arc<dyn PolicyService>>) -> Runtime {
    let mut builder = Runtime::builder(tasks_schema()).effects(registry());
    if let Some(policy) = policy {
        builder = builder.policy(policy);
    }
    builder.build().unwrap()
}

fn act(rt: &Runtime, action: &str, input: Value) -> ActionOutcome {
    rt.act(action, input, ActOptions::default())
        .unwrap()
        .result_timeout(WAIT)
        .expect("action settled")
}

/// Approves at most `limit` createTask proposals.
struct QuotaPolicy {
    limit: usize,
    used: AtomicUsize,
}

impl PolicyService for QuotaPolicy {
    fn request_approval(&self, proposal: &Proposal, _: &PolicyContext) -> Result<Approval, WorldlineError> {
        if proposal.intent.action_type == "createTask" && self.used.fetch_add(1, Ordering::SeqCst) >= self.limit {
            return Ok(Approval::Decided(Decision::reject("quota", "task quota exceeded")));
        }
        Ok(Approval::Decided(Decision::approve("quota")))
    }
}

#[test]
fn test_create_task_completes_and_moves_head() {
    let rt = runtime_with(None);
    let genesis = rt.get_current_head().unwrap();

    let handle = rt
        .act("createTask", json!({"title": "write docs"}), ActOptions::default())
        .unwrap();
    let outcome = handle.result_timeout(WAIT).unwrap();
    assert!(outcome.is_completed(), "{:?}", outcome);
    let world_id = outcome.world_id().unwrap().to_string();

    assert_eq!(rt.get_current_head().unwrap(), world_id);
    let world = rt.get_world(&world_id).unwrap();
    assert_eq!(world.parent.as_deref(), Some(genesis.as_str()));
    assert_eq!(world.outcome, WorldOutcome::Completed);
    assert_eq!(world.created_by.as_deref(), Some(handle.proposal_id()));

    let state = rt.get_state().unwrap();
    assert_eq!(state.computed["taskCount"], json!(1));
    assert_eq!(state.data["tasks"][0]["title"], json!("write docs"));
    assert!(state.data["tasks"][0]["id"].is_string());
    assert_eq!(state.system.status, SystemStatus::Idle);

    let proposal = rt.get_proposal(handle.proposal_id()).unwrap();
    assert_eq!(proposal.status, ProposalStatus::Completed);
    assert_eq!(proposal.base_world, genesis);
    assert!(proposal.execution_key.is_some());
    assert!(proposal.decision_id.is_some());
}

#[test]
fn test_quota_rejection_creates_no_world() {
    let policy = Arc::new(QuotaPolicy {
        limit: 1,
        used: AtomicUsize::new(0),
    });
    let rt = runtime_with(Some(policy));
    assert!(act(&rt, "createTask", json!({"title": "first"})).is_completed());
    let head = rt.get_current_head().unwrap();
    let worlds_before = rt.store().list_worlds().unwrap().len();

    let handle = rt
        .act("createTask", json!({"title": "second"}), ActOptions::default())
        .unwrap();
    let outcome = handle.result_timeout(WAIT).unwrap();
    assert_eq!(
        outcome,
        ActionOutcome::Rejected {
            reason: "task quota exceeded".into()
        }
    );
    assert_eq!(rt.get_current_head().unwrap(), head);
    assert_eq!(rt.store().list_worlds().unwrap().len(), worlds_before);
    assert_eq!(
        handle.phases(),
        vec![
            ActionPhase::Preparing,
            ActionPhase::Submitted,
            ActionPhase::Evaluating,
            ActionPhase::Rejected,
        ]
    );

    let proposal = rt.get_proposal(handle.proposal_id()).unwrap();
    assert_eq!(proposal.status, ProposalStatus::Rejected);
    assert_eq!(proposal.rejection_reason.as_deref(), Some("task quota exceeded"));
    assert!(proposal.result_world.is_none());
    assert_eq!(rt.get_state().unwrap().computed["taskCount"], json!(1));
}

#[test]
fn test_timeout_records_failed_world_and_keeps_head() {
    let rt = runtime_with(None);
    let head = rt.get_current_head().unwrap();

    let opts = ActOptions {
        timeout: Some(Duration::from_millis(20)),
        ..ActOptions::default()
    };
    let handle = rt.act("slowTask", json!({}), opts).unwrap();
    let outcome = handle.result_timeout(WAIT).unwrap();
    let ActionOutcome::Failed { world_id: Some(world_id), error } = outcome else {
        panic!("expected a failed outcome with a world, got {:?}", outcome);
    };
    assert_eq!(error.code, host::EFFECT_TIMEOUT);

    assert_eq!(rt.get_current_head().unwrap(), head);
    let world = rt.get_world(&world_id).unwrap();
    assert_eq!(world.outcome, WorldOutcome::Failed);
    assert_eq!(world.parent.as_deref(), Some(head.as_str()));

    let snapshot = rt.get_snapshot(&world_id).unwrap();
    assert_eq!(snapshot.system.status, SystemStatus::Error);
    assert_eq!(
        snapshot.system.last_error.as_ref().map(|e| e.code.as_str()),
        Some(host::EFFECT_TIMEOUT)
    );
    assert!(snapshot.data.get("slow").is_none());

    let proposal = rt.get_proposal(handle.proposal_id()).unwrap();
    assert_eq!(proposal.status, ProposalStatus::Failed);
    assert_eq!(proposal.result_world.as_deref(), Some(world_id.as_str()));
}

#[test]
fn test_effect_error_code_is_preserved() {
    let rt = runtime_with(None);
    let outcome = act(&rt, "brokenTask", json!({}));
    let error = outcome.error().expect("failure carries an error");
    assert_eq!(error.code, "UPSTREAM_DOWN");
    assert_eq!(error.source.as_deref(), Some("brokenTask"));
}

#[test]
fn test_unknown_action_fails_preparation() {
    let rt = runtime_with(None);
    let worlds = rt.store().list_worlds().unwrap().len();
    let outcome = act(&rt, "launchRocket", json!({}));
    let ActionOutcome::PreparationFailed { error } = outcome else {
        panic!("expected preparation failure, got {:?}", outcome);
    };
    assert_eq!(error.code, "UNKNOWN_ACTION");
    assert_eq!(rt.store().list_worlds().unwrap().len(), worlds);
}

#[test]
fn test_every_executed_proposal_yields_exactly_one_world() {
    let rt = runtime_with(None);
    let mut with_world = 0;
    for input in [
        ("createTask", json!({"title": "a"})),
        ("brokenTask", json!({})),
        ("createTask", json!({"title": "b"})),
        ("createTask", json!({})),
        ("brokenTask", json!({})),
    ] {
        if act(&rt, input.0, input.1).world_id().is_some() {
            with_world += 1;
        }
    }
    assert_eq!(with_world, 4);

    let worlds = rt.store().list_worlds().unwrap();
    assert_eq!(worlds.len(), 1 + with_world);
    for world in worlds.iter().filter(|w| !w.is_genesis()) {
        let delta = rt.store().get_delta(&world.world_id).unwrap();
        assert_eq!(delta.to_world, world.world_id);
        assert_eq!(Some(delta.from_world.as_str()), world.parent.as_deref());
    }
    assert_eq!(rt.get_state().unwrap().computed["taskCount"], json!(2));
    assert_eq!(rt.lineage(&rt.get_current_head().unwrap()).unwrap().len(), 3);
}

#[test]
fn test_same_request_hashes_identically_across_runtimes() {
    let a = runtime_with(None);
    let b = runtime_with(None);
    assert_eq!(a.get_current_head().unwrap(), b.get_current_head().unwrap());
    assert_eq!(a.schema_hash(), b.schema_hash());

    let opts = || ActOptions {
        intent_key: Some("req-1".into()),
        ..ActOptions::default()
    };
    let wa = a
        .act("createTask", json!({"title": "same"}), opts())
        .unwrap()
        .result_timeout(WAIT)
        .unwrap();
    let wb = b
        .act("createTask", json!({"title": "same"}), opts())
        .unwrap()
        .result_timeout(WAIT)
        .unwrap();
    let wa = a.get_world(wa.world_id().unwrap()).unwrap();
    let wb = b.get_world(wb.world_id().unwrap()).unwrap();
    assert_eq!(wa.snapshot_hash, wb.snapshot_hash);
    assert_ne!(wa.world_id, wb.world_id);
}

#[test]
fn test_retry_with_same_key_returns_recorded_world() {
    let rt = runtime_with(None);
    let opts = ActOptions {
        intent_key: Some("retry-me".into()),
        ..ActOptions::default()
    };
    let first = rt.new_proposal("createTask", json!({"title": "once"}), &opts).unwrap();
    let retry = rt.new_proposal("createTask", json!({"title": "once"}), &opts).unwrap();
    assert_ne!(first.proposal_id, retry.proposal_id);

    let SubmitResult::Completed { world } = rt.submit_proposal(first).unwrap() else {
        panic!("first submission should complete");
    };
    let worlds = rt.store().list_worlds().unwrap().len();

    let SubmitResult::Completed { world: again } = rt.submit_proposal(retry).unwrap() else {
        panic!("retry should be recognized");
    };
    assert_eq!(again.world_id, world.world_id);
    assert_eq!(rt.store().list_worlds().unwrap().len(), worlds);
    assert_eq!(rt.get_state().unwrap().computed["taskCount"], json!(1));
}

#[test]
fn test_proposal_on_superseded_head_fails_stale() {
    let rt = runtime_with(None);
    let a = rt
        .new_proposal("createTask", json!({"title": "a"}), &ActOptions::default())
        .unwrap();
    let b = rt
        .new_proposal("createTask", json!({"title": "b"}), &ActOptions::default())
        .unwrap();
    let SubmitResult::Completed { world } = rt.submit_proposal(a).unwrap() else {
        panic!("first proposal should complete");
    };
    let SubmitResult::Failed { world: failed, error } = rt.submit_proposal(b).unwrap() else {
        panic!("second proposal should fail");
    };
    assert_eq!(error.code, "STALE_BASE");
    assert_eq!(failed.outcome, WorldOutcome::Failed);
    assert_eq!(rt.get_current_head().unwrap(), world.world_id);
}

#[test]
fn test_proposal_made_before_reset_fails_stale_epoch() {
    let rt = runtime_with(None);
    let genesis = rt.get_current_head().unwrap();
    assert!(act(&rt, "createTask", json!({"title": "a"})).is_completed());

    let pending = rt
        .new_proposal("createTask", json!({"title": "b"}), &ActOptions::default())
        .unwrap();
    let branch = rt.reset_branch("main", &genesis).unwrap();
    assert_eq!(branch.epoch, 1);

    let SubmitResult::Failed { error, .. } = rt.submit_proposal(pending).unwrap() else {
        panic!("stale proposal should fail");
    };
    assert_eq!(error.code, "STALE_EPOCH");
    assert_eq!(rt.get_current_head().unwrap(), genesis);
    assert_eq!(rt.get_state().unwrap().computed["taskCount"], json!(0));
}

#[test]
fn test_submit_proposal_requires_submitted_status() {
    let rt = runtime_with(None);
    let mut proposal = rt
        .new_proposal("createTask", json!({"title": "x"}), &ActOptions::default())
        .unwrap();
    proposal.status = ProposalStatus::Completed;
    assert!(matches!(
        rt.submit_proposal(proposal),
        Err(WorldlineError::InvalidTransition { .. })
    ));
}

/// Memory store whose world writes can be switched off.
#[derive(Default)]
struct DiskFullStore {
    inner: MemoryWorldStore,
    full: AtomicBool,
}

impl WorldStore for DiskFullStore {
    fn kind(&self) -> StoreKind {
        self.inner.kind()
    }

    fn store(&self, world: &World, delta: &WorldDelta, snapshot: &Snapshot) -> Result<(), WorldlineError> {
        if self.full.load(Ordering::SeqCst) {
            return Err(WorldlineError::IoError(std::io::Error::other("disk full")));
        }
        self.inner.store(world, delta, snapshot)
    }

    fn get_world(&self, world_id: &str) -> Result<World, WorldlineError> {
        self.inner.get_world(world_id)
    }

    fn get_delta(&self, to_world: &str) -> Result<WorldDelta, WorldlineError> {
        self.inner.get_delta(to_world)
    }

    fn cached_snapshot(&self, world_id: &str) -> Result<Option<Snapshot>, WorldlineError> {
        self.inner.cached_snapshot(world_id)
    }

    fn list_worlds(&self) -> Result<Vec<World>, WorldlineError> {
        self.inner.list_worlds()
    }

    fn put_branch(&self, branch: &Branch) -> Result<(), WorldlineError> {
        self.inner.put_branch(branch)
    }

    fn get_branch(&self, branch_id: &str) -> Result<Branch, WorldlineError> {
        self.inner.get_branch(branch_id)
    }

    fn list_branches(&self) -> Result<Vec<Branch>, WorldlineError> {
        self.inner.list_branches()
    }

    fn put_proposal(&self, proposal: &Proposal) -> Result<(), WorldlineError> {
        self.inner.put_proposal(proposal)
    }

    fn get_proposal(&self, proposal_id: &str) -> Result<Proposal, WorldlineError> {
        self.inner.get_proposal(proposal_id)
    }

    fn find_completed(&self, execution_key: &str) -> Result<Option<Proposal>, WorldlineError> {
        self.inner.find_completed(execution_key)
    }

    fn put_actor(&self, actor: &ActorRef) -> Result<(), WorldlineError> {
        self.inner.put_actor(actor)
    }

    fn get_actor(&self, actor_id: &str) -> Result<Option<ActorRef>, WorldlineError> {
        self.inner.get_actor(actor_id)
    }
}

#[test]
fn test_aborted_execution_marks_proposal_failed() {
    let store = Arc::new(DiskFullStore::default());
    let rt = Runtime::builder(tasks_schema())
        .effects(registry())
        .store(store.clone())
        .build()
        .unwrap();
    let head = rt.get_current_head().unwrap();
    store.full.store(true, Ordering::SeqCst);

    let handle = rt
        .act("createTask", json!({"title": "lost"}), ActOptions::default())
        .unwrap();
    let outcome = handle.result_timeout(WAIT).unwrap();
    let ActionOutcome::Failed { world_id, error } = outcome else {
        panic!("expected an aborted execution, got {:?}", outcome);
    };
    assert!(world_id.is_none());
    assert_eq!(error.code, "IO");

    let proposal = rt.get_proposal(handle.proposal_id()).unwrap();
    assert_eq!(proposal.status, ProposalStatus::Failed);
    assert!(proposal.result_world.is_none());
    assert_eq!(rt.get_current_head().unwrap(), head);

    store.full.store(false, Ordering::SeqCst);
    assert!(act(&rt, "createTask", json!({"title": "kept"})).is_completed());
}
