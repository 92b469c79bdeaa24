use serde_json::{Value, json};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use worldline::core::config::RuntimeConfig;
use worldline::core::host::{self, CancellationToken, EffectType};
use worldline::core::orchestrator::INTERNAL_ERROR;
use worldline::core::queue::{ActionQueue, InFlight, Lane};
use worldline::core::proposal::Proposal;
use worldline::core::snapshot::Snapshot;
use worldline::{
    ActOptions, ActionOutcome, ActionSpec, DomainSchema, EffectBinding, EffectContext, EffectError,
    EffectRegistry, PatchBuilder, RecallProvider, Runtime, WorldlineError,
};

const WAIT: Duration = Duration::from_secs(10);

fn custom(effect: &str) -> EffectBinding {
    EffectBinding::Custom {
        effect: EffectType::new(effect).unwrap(),
    }
}

fn schema() -> DomainSchema {
    let mut schema = DomainSchema::new("jobs", "1");
    schema
        .initial(json!({"log": []}).as_object().cloned().unwrap())
        .declare(
            ActionSpec::new(
                "record",
                EffectBinding::Append {
                    path: "log".into(),
                    assign_id: false,
                },
            )
            .require(&["n"]),
        )
        .declare(ActionSpec::new("explode", custom("test.explode")))
        .declare(ActionSpec::new("sleep", custom("test.sleep")))
        .declare(ActionSpec::new("nested", custom("test.nested")));
    schema
}

struct Harness {
    runtime: Runtime,
}

fn harness() -> Harness {
    harness_with(|b| b)
}

fn harness_with<F>(customize: F) -> Harness
where
    F: FnOnce(worldline::RuntimeBuilder) -> worldline::RuntimeBuilder,
{
    let slot: Arc<OnceLock<Runtime>> = Arc::default();
    let nested_slot = Arc::clone(&slot);
    let mut registry = EffectRegistry::new();
    registry
        .register(
            "test.explode",
            |_: &EffectContext, _: &Value, _: &mut PatchBuilder| -> Result<(), EffectError> {
                panic!("effect blew up")
            },
        )
        .unwrap()
        .register(
            "test.sleep",
            |ctx: &EffectContext, input: &Value, p: &mut PatchBuilder| -> Result<(), EffectError> {
                let ms = input.get("ms").and_then(Value::as_u64).unwrap_or(500);
                let until = std::time::Instant::now() + Duration::from_millis(ms);
                while std::time::Instant::now() < until {
                    if ctx.is_cancelled() {
                        return Err(EffectError::new("stopped"));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                p.set("slept", json!(ms));
                Ok(())
            },
        )
        .unwrap()
        .register(
            "test.nested",
            move |_: &EffectContext, _: &Value, p: &mut PatchBuilder| -> Result<(), EffectError> {
                let rt = nested_slot
                    .get()
                    .ok_or_else(|| EffectError::new("runtime not ready"))?;
                let proposal = rt
                    .new_proposal("record", json!({"n": -1}), &ActOptions::default())
                    .map_err(|e| EffectError::new(e.to_string()))?;
                let refused = matches!(
                    rt.submit_proposal(proposal),
                    Err(WorldlineError::ReentrantSubmission { .. })
                );
                p.set("refused", json!(refused));
                Ok(())
            },
        )
        .unwrap();
    let runtime = customize(Runtime::builder(schema()).effects(registry))
        .build()
        .unwrap();
    let _ = slot.set(runtime.clone());
    Harness { runtime }
}

#[test]
fn test_domain_lane_runs_in_submission_order_despite_failures() {
    let h = harness();
    let mut handles = Vec::new();
    for n in 0..12 {
        let (action, input) = if n % 4 == 3 {
            ("explode", json!({}))
        } else {
            ("record", json!({"n": n}))
        };
        handles.push(h.runtime.act(action, input, ActOptions::default()).unwrap());
    }

    let outcomes: Vec<ActionOutcome> = handles
        .iter()
        .map(|h| h.result_timeout(WAIT).expect("every action settles"))
        .collect();
    for (n, outcome) in outcomes.iter().enumerate() {
        if n % 4 == 3 {
            assert_eq!(outcome.error().map(|e| e.code.as_str()), Some(host::EFFECT_PANICKED));
        } else {
            assert!(outcome.is_completed(), "action {}: {:?}", n, outcome);
        }
    }

    let log = h.runtime.get_state().unwrap().data["log"].clone();
    let order: Vec<i64> = log
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["n"].as_i64().unwrap())
        .collect();
    assert_eq!(order, vec![0, 1, 2, 4, 5, 6, 8, 9, 10]);
}

#[test]
fn test_system_lane_is_not_blocked_by_domain_work() {
    let h = harness();
    let slow = h
        .runtime
        .act("sleep", json!({"ms": 1500}), ActOptions::default())
        .unwrap();
    let fork = h
        .runtime
        .act("system.branch.fork", json!({"name": "side"}), ActOptions::default())
        .unwrap();

    assert!(fork.result_timeout(WAIT).unwrap().is_completed());
    assert!(!slow.is_settled());
    assert!(slow.result_timeout(WAIT).unwrap().is_completed());
}

#[test]
fn test_blocking_submission_from_domain_effect_is_refused() {
    let h = harness();
    let outcome = h
        .runtime
        .act("nested", json!({}), ActOptions::default())
        .unwrap()
        .result_timeout(WAIT)
        .unwrap();
    assert!(outcome.is_completed(), "{:?}", outcome);
    assert_eq!(h.runtime.get_state().unwrap().data["refused"], json!(true));
}

#[test]
fn test_act_with_domain_origin_is_refused() {
    let h = harness();
    let handle = h
        .runtime
        .act("record", json!({"n": 1}), ActOptions::default())
        .unwrap();
    handle.result_timeout(WAIT).unwrap();

    // Only a queue mints in-flight tokens; take one from a throwaway job.
    let queue = ActionQueue::new().unwrap();
    let (tx, rx) = crossbeam::channel::unbounded();
    queue
        .enqueue(
            Lane::Domain,
            "mint",
            None,
            Box::new(move |token: &InFlight| {
                let _ = tx.send(token.clone());
            }),
        )
        .unwrap();
    let token = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(token.lane(), Lane::Domain);

    let opts = ActOptions {
        origin: Some(token),
        ..ActOptions::default()
    };
    let err = h.runtime.act("record", json!({"n": 2}), opts).unwrap_err();
    assert!(matches!(err, WorldlineError::ReentrantSubmission { .. }));

    let system = ActOptions {
        origin: Some(rx_token(&queue)),
        ..ActOptions::default()
    };
    assert!(h.runtime.act("system.branch.fork", json!({}), system).is_ok());
}

fn rx_token(queue: &ActionQueue) -> InFlight {
    let (tx, rx) = crossbeam::channel::unbounded();
    queue
        .enqueue(
            Lane::Domain,
            "mint-2",
            None,
            Box::new(move |token: &InFlight| {
                let _ = tx.send(token.clone());
            }),
        )
        .unwrap();
    rx.recv_timeout(WAIT).unwrap()
}

#[test]
fn test_cancelled_action_fails_without_moving_head() {
    let h = harness();
    let head = h.runtime.get_current_head().unwrap();
    let cancel = CancellationToken::new();
    let handle = h
        .runtime
        .act(
            "sleep",
            json!({"ms": 2000}),
            ActOptions {
                cancel: Some(cancel.clone()),
                ..ActOptions::default()
            },
        )
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    cancel.cancel();
    let outcome = handle.result_timeout(WAIT).unwrap();
    assert_eq!(outcome.error().map(|e| e.code.as_str()), Some(host::EFFECT_CANCELLED));
    assert_eq!(h.runtime.get_current_head().unwrap(), head);
}

#[test]
fn test_handle_lookup_by_proposal_id() {
    let h = harness();
    let handle = h
        .runtime
        .act("record", json!({"n": 7}), ActOptions::default())
        .unwrap();
    let found = h.runtime.get_action_handle(handle.proposal_id()).unwrap();
    assert_eq!(found.proposal_id(), handle.proposal_id());
    assert_eq!(found.result_timeout(WAIT), handle.result_timeout(WAIT));
}

#[test]
fn test_settled_handles_are_evicted_past_the_bound() {
    let h = harness_with(|b| {
        b.config(RuntimeConfig {
            retained_handles: 2,
            ..RuntimeConfig::default()
        })
    });
    let handles: Vec<_> = (0..4)
        .map(|n| {
            let handle = h
                .runtime
                .act("record", json!({"n": n}), ActOptions::default())
                .unwrap();
            assert!(handle.result_timeout(WAIT).unwrap().is_completed());
            handle
        })
        .collect();
    assert!(matches!(
        h.runtime.get_action_handle(handles[0].proposal_id()),
        Err(WorldlineError::ProposalNotFound(_))
    ));
    let last = h.runtime.get_action_handle(handles[3].proposal_id()).unwrap();
    assert!(last.is_settled());
    // The proposal record outlives its handle.
    assert!(h.runtime.get_proposal(handles[0].proposal_id()).is_ok());
}

struct EchoRecall;

impl RecallProvider for EchoRecall {
    fn recall(&self, query: &Value, proposal: &Proposal, base: &Snapshot) -> Result<Value, WorldlineError> {
        Ok(json!({
            "query": query,
            "action": proposal.intent.action_type,
            "version": base.meta.version,
        }))
    }
}

struct PanickingRecall;

impl RecallProvider for PanickingRecall {
    fn recall(&self, _: &Value, _: &Proposal, _: &Snapshot) -> Result<Value, WorldlineError> {
        panic!("recall backend crashed")
    }
}

#[test]
fn test_recall_is_frozen_into_result_snapshot() {
    let h = harness_with(|b| b.recall(Arc::new(EchoRecall)));
    let outcome = h
        .runtime
        .act(
            "record",
            json!({"n": 1}),
            ActOptions {
                recall: Some(json!("recent records")),
                ..ActOptions::default()
            },
        )
        .unwrap()
        .result_timeout(WAIT)
        .unwrap();
    let snapshot = h.runtime.get_snapshot(outcome.world_id().unwrap()).unwrap();
    assert_eq!(
        snapshot.system.recall,
        Some(json!({"query": "recent records", "action": "record", "version": 0}))
    );

    let plain = h
        .runtime
        .act("record", json!({"n": 2}), ActOptions::default())
        .unwrap()
        .result_timeout(WAIT)
        .unwrap();
    assert!(h.runtime.get_snapshot(plain.world_id().unwrap()).unwrap().system.recall.is_none());
}

#[test]
fn test_job_panic_settles_handle_and_lane_survives() {
    let h = harness_with(|b| b.recall(Arc::new(PanickingRecall)));
    let crashed = h
        .runtime
        .act(
            "record",
            json!({"n": 1}),
            ActOptions {
                recall: Some(json!("anything")),
                ..ActOptions::default()
            },
        )
        .unwrap()
        .result_timeout(WAIT)
        .unwrap();
    let ActionOutcome::Failed { world_id, error } = crashed else {
        panic!("expected failure, got {:?}", crashed);
    };
    assert!(world_id.is_none());
    assert_eq!(error.code, INTERNAL_ERROR);

    let next = h
        .runtime
        .act("record", json!({"n": 2}), ActOptions::default())
        .unwrap()
        .result_timeout(WAIT)
        .unwrap();
    assert!(next.is_completed());
}
