//! Execution orchestrator.
//!
//! `Runtime` owns the schema, store, policy, host executor, branch manager,
//! and the two-lane queue. Every `act` call becomes one queued job that
//! walks a proposal through
//! preparing → submitted → evaluating → (pending) → approved/rejected →
//! executing → completed/failed and settles the caller's `ActionHandle`
//! exactly once.
//!
//! Worlds are only written here. A completed world is persisted and the
//! branch head moved in one `BranchManager::commit`; a failed world is
//! persisted and the head left where it was.

use crate::core::branch::{BranchManager, ForkOptions, MAIN_BRANCH};
use crate::core::config::RuntimeConfig;
use crate::core::error::WorldlineError;
use crate::core::handle::{ActionHandle, ActionOutcome, ActionPhase};
use crate::core::host::{
    self, ActionSubmitter, CancellationToken, EffectRegistry, ExecuteOptions, ExecutionOutcome,
    HostExecutor,
};
use crate::core::proposal::{ActorKind, ActorRef, Intent, Proposal, ProposalStatus};
use crate::core::queue::{ActionQueue, InFlight, Lane};
use crate::core::schema::DomainSchema;
use crate::core::snapshot::{ErrorValue, Snapshot, SystemStatus};
use crate::core::state_map;
use crate::core::store::{MemoryWorldStore, WorldStore};
use crate::core::subscription::{
    Listener, Selector, SubscribeOptions, Subscription, SubscriptionHub, TransactionGuard,
};
use crate::core::system::SystemAction;
use crate::core::time;
use crate::core::world::{Branch, World, WorldDelta, WorldOutcome};
use crate::plugins::policy::{self, Approval, AutoApprovePolicy, Decision, PolicyContext, PolicyService};
use crossbeam::channel;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Supplies memory/recall context for an action. The result is frozen into
/// the execution snapshot's `system.recall`.
pub trait RecallProvider: Send + Sync {
    fn recall(&self, query: &Value, proposal: &Proposal, base: &Snapshot) -> Result<Value, WorldlineError>;
}

#[derive(Clone, Default)]
pub struct ActOptions {
    /// Defaults to the configured default actor (or the system actor for
    /// system actions).
    pub actor_id: Option<String>,
    /// Defaults to the current branch.
    pub branch_id: Option<String>,
    /// Idempotency key; defaults to a fresh one per call.
    pub intent_key: Option<String>,
    /// Recall query handed to the `RecallProvider`.
    pub recall: Option<Value>,
    /// Token of the job this submission is made from, if any.
    pub origin: Option<InFlight>,
    pub cancel: Option<CancellationToken>,
    /// Overrides the configured execution timeout.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitResult {
    Completed { world: World },
    Failed { world: World, error: ErrorValue },
    Rejected { reason: String },
}

impl SubmitResult {
    pub fn world(&self) -> Option<&World> {
        match self {
            SubmitResult::Completed { world } | SubmitResult::Failed { world, .. } => Some(world),
            SubmitResult::Rejected { .. } => None,
        }
    }

    fn into_outcome(self) -> ActionOutcome {
        match self {
            SubmitResult::Completed { world } => ActionOutcome::Completed {
                world_id: world.world_id,
                detail: None,
            },
            SubmitResult::Failed { world, error } => ActionOutcome::Failed {
                world_id: Some(world.world_id),
                error,
            },
            SubmitResult::Rejected { reason } => ActionOutcome::Rejected { reason },
        }
    }
}

enum Verdict {
    Approved,
    Rejected(String),
}

pub struct RuntimeBuilder {
    schema: DomainSchema,
    store: Option<Arc<dyn WorldStore>>,
    policy: Option<Arc<dyn PolicyService>>,
    registry: EffectRegistry,
    recall: Option<Arc<dyn RecallProvider>>,
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    pub fn new(schema: DomainSchema) -> Self {
        Self {
            schema,
            store: None,
            policy: None,
            registry: EffectRegistry::new(),
            recall: None,
            config: RuntimeConfig::default(),
        }
    }

    pub fn store(mut self, store: Arc<dyn WorldStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn PolicyService>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn effects(mut self, registry: EffectRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn recall(mut self, provider: Arc<dyn RecallProvider>) -> Self {
        self.recall = Some(provider);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Runtime, WorldlineError> {
        if let Some(clash) = self
            .schema
            .actions()
            .find(|a| a.action_type.starts_with(&self.config.system_prefix))
        {
            return Err(WorldlineError::ConfigError(format!(
                "action '{}' uses the reserved prefix '{}'",
                clash.action_type, self.config.system_prefix
            )));
        }

        let schema = Arc::new(self.schema);
        let schema_hash = schema.schema_hash();
        let host = HostExecutor::new(Arc::clone(&schema), self.registry);
        host.verify_bindings()?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryWorldStore::default()));
        if let Ok(main) = store.get_branch(MAIN_BRANCH)
            && main.schema_hash != schema_hash
        {
            return Err(WorldlineError::ConfigError(format!(
                "store holds worlds of schema {}, runtime schema is {}",
                main.schema_hash, schema_hash
            )));
        }
        let genesis_snapshot = schema.genesis_snapshot();
        let genesis = World::genesis(&schema_hash, &genesis_snapshot.content_hash(), time::now_millis());
        store.store_genesis(&genesis, &genesis_snapshot)?;

        let branches = BranchManager::new(Arc::clone(&store));
        let main = branches.ensure_main(&genesis.world_id, &schema_hash)?;
        let head = Arc::new(store.restore(&main.head)?);
        let hub = SubscriptionHub::new();
        hub.switch_to(&main.branch_id, Arc::clone(&head));
        let mut heads = FxHashMap::default();
        heads.insert(main.branch_id.clone(), (main.head.clone(), head));

        let queue = ActionQueue::new()?;
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(AutoApprovePolicy));

        let retained_handles = self.config.retained_handles;
        let inner = Arc::new_cyclic(|weak: &Weak<RuntimeInner>| RuntimeInner {
            schema,
            schema_hash,
            store,
            policy,
            host,
            queue,
            branches,
            recall: self.recall,
            config: self.config,
            hub,
            heads: RwLock::new(heads),
            handles: Mutex::new(HandleRegistry::new(retained_handles)),
            submitter: Arc::new(RuntimeSubmitter(weak.clone())),
        });
        tracing::info!(
            schema = %inner.schema.schema_id(),
            schema_hash = %inner.schema_hash,
            head = %main.head,
            "runtime ready"
        );
        Ok(Runtime { inner })
    }
}

/// Action handles by proposal id, in submission order. Once more than
/// `retain` are held, the oldest settled ones are evicted; unsettled handles
/// are never evicted.
struct HandleRegistry {
    retain: usize,
    order: VecDeque<String>,
    by_id: FxHashMap<String, ActionHandle>,
}

impl HandleRegistry {
    fn new(retain: usize) -> Self {
        Self {
            retain,
            order: VecDeque::new(),
            by_id: FxHashMap::default(),
        }
    }

    fn insert(&mut self, handle: &ActionHandle) {
        let id = handle.proposal_id().to_string();
        if self.by_id.insert(id.clone(), handle.clone()).is_none() {
            self.order.push_back(id);
        }
        self.evict();
    }

    fn evict(&mut self) {
        let mut excess = self.by_id.len().saturating_sub(self.retain);
        if excess == 0 {
            return;
        }
        let by_id = &mut self.by_id;
        self.order.retain(|id| {
            if excess > 0 && by_id.get(id).is_none_or(ActionHandle::is_settled) {
                by_id.remove(id);
                excess -= 1;
                return false;
            }
            true
        });
    }

    fn get(&self, proposal_id: &str) -> Option<&ActionHandle> {
        self.by_id.get(proposal_id)
    }
}

struct RuntimeSubmitter(Weak<RuntimeInner>);

impl ActionSubmitter for RuntimeSubmitter {
    fn submit_from(
        &self,
        origin: Option<&InFlight>,
        action_type: &str,
        input: Value,
    ) -> Result<String, WorldlineError> {
        let inner = self
            .0
            .upgrade()
            .ok_or_else(|| WorldlineError::ValidationError("runtime is shut down".to_string()))?;
        let opts = ActOptions {
            origin: origin.cloned(),
            ..ActOptions::default()
        };
        let handle = inner.enqueue(action_type, input, opts)?;
        Ok(handle.proposal_id().to_string())
    }
}

struct RuntimeInner {
    schema: Arc<DomainSchema>,
    schema_hash: String,
    store: Arc<dyn WorldStore>,
    policy: Arc<dyn PolicyService>,
    host: HostExecutor,
    queue: ActionQueue,
    branches: BranchManager,
    recall: Option<Arc<dyn RecallProvider>>,
    config: RuntimeConfig,
    hub: SubscriptionHub,
    /// Per-branch head: (world id, snapshot). Entries are replaced wholesale.
    heads: RwLock<FxHashMap<String, (String, Arc<Snapshot>)>>,
    handles: Mutex<HandleRegistry>,
    submitter: Arc<dyn ActionSubmitter>,
}

fn internal_error(e: &WorldlineError, source: &str) -> ErrorValue {
    ErrorValue::new(e.code(), e.to_string(), Some(source), time::now_millis())
}

fn panic_error(source: &str) -> ErrorValue {
    ErrorValue::new(INTERNAL_ERROR, "action job panicked", Some(source), time::now_millis())
}

fn advance(handle: Option<&ActionHandle>, phase: ActionPhase) {
    if let Some(h) = handle {
        h.advance(phase);
    }
}

impl RuntimeInner {
    fn lane_for(&self, action_type: &str) -> Lane {
        if action_type.starts_with(&self.config.system_prefix) {
            Lane::System
        } else {
            Lane::Domain
        }
    }

    fn register_handle(&self, handle: &ActionHandle) {
        self.handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(handle);
    }

    fn cached_head(&self, branch_id: &str) -> Option<(String, Arc<Snapshot>)> {
        self.heads
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(branch_id)
            .cloned()
    }

    fn cache_head(&self, branch_id: &str, world_id: &str, snapshot: Arc<Snapshot>) {
        self.heads
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(branch_id.to_string(), (world_id.to_string(), snapshot));
    }

    /// Snapshot at a branch's head, from the cache when it is current.
    fn head_snapshot(&self, branch: &Branch) -> Result<Arc<Snapshot>, WorldlineError> {
        if let Some((world_id, snapshot)) = self.cached_head(&branch.branch_id)
            && world_id == branch.head
        {
            return Ok(snapshot);
        }
        let snapshot = Arc::new(self.store.restore(&branch.head)?);
        self.cache_head(&branch.branch_id, &branch.head, Arc::clone(&snapshot));
        Ok(snapshot)
    }

    fn snapshot_of(&self, world_id: &str) -> Result<Snapshot, WorldlineError> {
        let cached = self
            .heads
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .find(|(id, _)| id == world_id)
            .map(|(_, s)| Arc::clone(s));
        match cached {
            Some(s) => Ok((*s).clone()),
            None => self.store.restore(world_id),
        }
    }

    /// Registered actors keep their recorded kind; unknown ids act as agents.
    fn resolve_actor(&self, actor_id: Option<&str>, lane: Lane) -> Result<ActorRef, WorldlineError> {
        let id = match (actor_id, lane) {
            (Some(id), _) => id,
            (None, Lane::System) => return Ok(ActorRef::system()),
            (None, Lane::Domain) => self.config.default_actor.as_str(),
        };
        Ok(self
            .store
            .get_actor(id)?
            .unwrap_or_else(|| ActorRef::agent(id)))
    }

    fn enqueue(self: &Arc<Self>, action_type: &str, input: Value, opts: ActOptions) -> Result<ActionHandle, WorldlineError> {
        let lane = self.lane_for(action_type);
        self.queue.check_submission(lane, opts.origin.as_ref())?;

        let handle = ActionHandle::new(&time::new_id(), action_type);
        self.register_handle(&handle);

        let inner = Arc::clone(self);
        let job_handle = handle.clone();
        let job_type = action_type.to_string();
        let origin = opts.origin.clone();
        self.queue.enqueue(
            lane,
            handle.proposal_id(),
            origin.as_ref(),
            Box::new(move |token: &InFlight| {
                let span = tracing::info_span!(
                    "action",
                    proposal_id = %job_handle.proposal_id(),
                    action = %job_type,
                    lane = %token.lane()
                );
                let _enter = span.enter();
                let run = catch_unwind(AssertUnwindSafe(|| match token.lane() {
                    Lane::Domain => inner.drive_domain(&job_handle, &job_type, input, opts, token),
                    Lane::System => inner.drive_system(&job_handle, &job_type, input, opts),
                }));
                let outcome = run.unwrap_or_else(|_| {
                    tracing::error!("action job panicked");
                    inner.abandon(job_handle.proposal_id());
                    ActionOutcome::Failed {
                        world_id: None,
                        error: panic_error(&job_type),
                    }
                });
                job_handle.settle(outcome);
            }),
        )?;
        Ok(handle)
    }

    /// Best effort: a proposal whose execution aborted is moved from
    /// `executing` to `failed` so it is not left running in the store.
    fn abandon(&self, proposal_id: &str) {
        let marked = match self.store.get_proposal(proposal_id) {
            Ok(mut proposal) if proposal.status == ProposalStatus::Executing => proposal
                .transition(ProposalStatus::Failed, None)
                .and_then(|()| self.store.put_proposal(&proposal)),
            Ok(_) | Err(WorldlineError::ProposalNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = marked {
            tracing::warn!(proposal_id, error = %e, "could not mark aborted proposal failed");
        }
    }

    fn drive_domain(
        &self,
        handle: &ActionHandle,
        action_type: &str,
        input: Value,
        opts: ActOptions,
        token: &InFlight,
    ) -> ActionOutcome {
        if let Err(error) = self.schema.validate_intent(action_type, &input, time::now_millis()) {
            tracing::info!(code = %error.code, "preparation failed");
            return ActionOutcome::PreparationFailed { error };
        }
        let proposal = match self.prepare(handle.proposal_id(), action_type, input, &opts, Lane::Domain) {
            Ok((proposal, _)) => proposal,
            Err(e) => {
                return ActionOutcome::PreparationFailed {
                    error: internal_error(&e, action_type),
                };
            }
        };
        match self.process_domain(proposal, Some(handle), Some(token), &opts) {
            Ok(result) => result.into_outcome(),
            Err(e) => {
                tracing::error!(error = %e, "action aborted");
                self.abandon(handle.proposal_id());
                ActionOutcome::Failed {
                    world_id: None,
                    error: internal_error(&e, action_type),
                }
            }
        }
    }

    fn prepare(
        &self,
        proposal_id: &str,
        action_type: &str,
        input: Value,
        opts: &ActOptions,
        lane: Lane,
    ) -> Result<(Proposal, Branch), WorldlineError> {
        let branch = match &opts.branch_id {
            Some(id) => self.branches.get(id)?,
            None => self.branches.current_branch()?,
        };
        let actor = self.resolve_actor(opts.actor_id.as_deref(), lane)?;
        let mut intent = Intent::new(action_type, input);
        if let Some(key) = &opts.intent_key {
            intent = intent.with_key(key);
        }
        let mut proposal = Proposal::new(actor, intent, &branch.head, &branch.branch_id, branch.epoch);
        proposal.proposal_id = proposal_id.to_string();
        Ok((proposal, branch))
    }

    /// Record the proposal and take it through policy evaluation.
    fn evaluate(&self, proposal: &mut Proposal, handle: Option<&ActionHandle>) -> Result<Verdict, WorldlineError> {
        self.store.put_proposal(proposal)?;
        advance(handle, ActionPhase::Submitted);

        let key = self.policy.derive_execution_key(proposal);
        proposal.set_execution_key(&key)?;
        proposal.transition(ProposalStatus::Evaluating, None)?;
        self.store.put_proposal(proposal)?;
        advance(handle, ActionPhase::Evaluating);

        let ctx = PolicyContext {
            actor_registered: self.store.get_actor(&proposal.actor.actor_id)?.is_some(),
            branch_name: self
                .branches
                .get(&proposal.branch_id)
                .map(|b| b.name)
                .unwrap_or_default(),
        };
        let approval = self.policy.request_approval(proposal, &ctx).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "policy evaluation failed; rejecting");
            Approval::Decided(Decision::reject("policy:error", &e.to_string()))
        });
        let decision = match approval {
            Approval::Decided(decision) => decision,
            Approval::Deferred(ticket) => {
                proposal.transition(ProposalStatus::Pending, None)?;
                self.store.put_proposal(proposal)?;
                advance(handle, ActionPhase::Pending);
                tracing::debug!("awaiting decision");
                ticket.wait().unwrap_or_else(|e| Decision::reject("policy:board", &e.to_string()))
            }
        };

        if !decision.approved {
            let reason = decision
                .reason
                .clone()
                .unwrap_or_else(|| "rejected by policy".to_string());
            proposal.transition(ProposalStatus::Rejected, Some(&decision.decision_id))?;
            proposal.rejection_reason = Some(reason.clone());
            self.store.put_proposal(proposal)?;
            advance(handle, ActionPhase::Rejected);
            tracing::info!(reason = %reason, "proposal rejected");
            return Ok(Verdict::Rejected(reason));
        }

        proposal.approved_scope = decision.scope.clone();
        proposal.transition(ProposalStatus::Approved, Some(&decision.decision_id))?;
        self.store.put_proposal(proposal)?;
        advance(handle, ActionPhase::Approved);
        proposal.transition(ProposalStatus::Executing, None)?;
        self.store.put_proposal(proposal)?;
        advance(handle, ActionPhase::Executing);
        Ok(Verdict::Approved)
    }

    fn process_domain(
        &self,
        mut proposal: Proposal,
        handle: Option<&ActionHandle>,
        in_flight: Option<&InFlight>,
        opts: &ActOptions,
    ) -> Result<SubmitResult, WorldlineError> {
        let key = self.policy.derive_execution_key(&proposal);
        if let Some(previous) = self.store.find_completed(&key)?
            && let Some(world_id) = previous.result_world.as_deref()
        {
            tracing::info!(previous = %previous.proposal_id, world_id, "retry recognized");
            let world = self.store.get_world(world_id)?;
            advance(handle, ActionPhase::Completed);
            return Ok(SubmitResult::Completed { world });
        }

        match self.evaluate(&mut proposal, handle)? {
            Verdict::Rejected(reason) => Ok(SubmitResult::Rejected { reason }),
            Verdict::Approved => self.execute(proposal, in_flight, opts),
        }
    }

    /// Base snapshot for execution. Heads are held in memory, so the store
    /// only replays deltas for proposals based on an older world.
    fn base_snapshot(&self, proposal: &Proposal) -> Result<Snapshot, WorldlineError> {
        if let Some((world_id, snapshot)) = self.cached_head(&proposal.branch_id)
            && world_id == proposal.base_world
        {
            return Ok((*snapshot).clone());
        }
        self.store.restore(&proposal.base_world)
    }

    fn recall_for(&self, query: &Value, proposal: &Proposal, base: &Snapshot) -> Option<Value> {
        let Some(provider) = &self.recall else {
            tracing::debug!("recall requested but no provider configured");
            return None;
        };
        match provider.recall(query, proposal, base) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "recall failed; continuing without it");
                None
            }
        }
    }

    fn execute(
        &self,
        mut proposal: Proposal,
        in_flight: Option<&InFlight>,
        opts: &ActOptions,
    ) -> Result<SubmitResult, WorldlineError> {
        let now = time::now_millis();
        let action_type = proposal.intent.action_type.clone();
        let key = proposal.execution_key.clone().unwrap_or_default();
        let seed = host::seed_from_key(&key);
        let parent = self.base_snapshot(&proposal)?;
        let _transaction = TransactionGuard::begin(&self.hub, Lane::Domain);

        let fail = |error: ErrorValue, from: &Snapshot| {
            let snapshot = host::failed_snapshot(from, &error, &action_type, seed, now);
            (snapshot, Some(error))
        };

        let (terminal, error) = match self
            .branches
            .ensure_fresh(&proposal.branch_id, proposal.epoch, &proposal.base_world)
        {
            Err(e @ (WorldlineError::StaleEpoch { .. } | WorldlineError::StaleBase { .. })) => {
                tracing::warn!(error = %e, "proposal is stale");
                fail(internal_error(&e, &action_type), &parent)
            }
            Err(e) => return Err(e),
            Ok(_) => {
                let mut base = parent.clone();
                base.system.recall = opts
                    .recall
                    .as_ref()
                    .and_then(|query| self.recall_for(query, &proposal, &parent));
                let base = Arc::new(base);
                let mut computing = (*base).clone();
                computing.system.status = SystemStatus::Computing;
                computing.system.current_action = Some(action_type.clone());
                self.hub
                    .publish(Lane::Domain, &proposal.branch_id, Arc::new(computing));
                let exec_opts = ExecuteOptions {
                    cancel: opts.cancel.clone(),
                    timeout: opts.timeout.or_else(|| self.config.execution_timeout()),
                    in_flight: in_flight.cloned(),
                    submitter: Some(Arc::clone(&self.submitter)),
                    now: Some(now),
                };
                match self.host.execute(&key, Arc::clone(&base), &proposal.intent, exec_opts) {
                    Err(e) => fail(internal_error(&e, &action_type), base.as_ref()),
                    Ok(result) if result.outcome == ExecutionOutcome::Failed => {
                        (result.terminal_snapshot, result.error)
                    }
                    Ok(result) => match self.policy.validate_result_scope(
                        &base,
                        &result.terminal_snapshot,
                        proposal.approved_scope.as_ref(),
                    ) {
                        Ok(()) => (result.terminal_snapshot, None),
                        Err(violation) => {
                            tracing::warn!(paths = ?violation.paths, "scope violation");
                            let error = ErrorValue::new(
                                policy::SCOPE_VIOLATION,
                                violation.to_string(),
                                Some(&action_type),
                                now,
                            );
                            fail(error, base.as_ref())
                        }
                    },
                }
            }
        };

        let (world, terminal, error) = self.record(&proposal, &parent, terminal, error, now, seed)?;
        let completed = error.is_none();
        proposal.set_result_world(&world.world_id)?;
        proposal.transition(
            if completed {
                ProposalStatus::Completed
            } else {
                ProposalStatus::Failed
            },
            None,
        )?;
        self.store.put_proposal(&proposal)?;

        let terminal = Arc::new(terminal);
        if completed {
            self.cache_head(&proposal.branch_id, &world.world_id, Arc::clone(&terminal));
        }
        // Dropped by the hub if the branch stopped being current meanwhile.
        self.hub
            .publish(Lane::Domain, &proposal.branch_id, Arc::clone(&terminal));

        match error {
            None => {
                tracing::info!(world_id = %world.world_id, "proposal completed");
                Ok(SubmitResult::Completed { world })
            }
            Some(error) => {
                tracing::info!(world_id = %world.world_id, code = %error.code, "proposal failed");
                Ok(SubmitResult::Failed { world, error })
            }
        }
    }

    fn build_world(&self, proposal: &Proposal, parent: &Snapshot, terminal: &Snapshot, outcome: WorldOutcome, now: u64) -> (World, WorldDelta) {
        let world = World::derived(
            &self.schema_hash,
            &terminal.content_hash(),
            &proposal.base_world,
            &proposal.proposal_id,
            outcome,
            now,
        );
        let delta = WorldDelta {
            from_world: proposal.base_world.clone(),
            to_world: world.world_id.clone(),
            patches: state_map::diff(parent, terminal),
            created_at: now,
        };
        (world, delta)
    }

    /// Persist the world for an execution. A completed world that loses the
    /// race against a branch reset is recorded as a stale failure instead.
    fn record(
        &self,
        proposal: &Proposal,
        parent: &Snapshot,
        terminal: Snapshot,
        error: Option<ErrorValue>,
        now: u64,
        seed: u64,
    ) -> Result<(World, Snapshot, Option<ErrorValue>), WorldlineError> {
        if error.is_none() {
            let (world, delta) = self.build_world(proposal, parent, &terminal, WorldOutcome::Completed, now);
            let committed = self.branches.commit(
                &proposal.branch_id,
                proposal.epoch,
                &proposal.base_world,
                &world.world_id,
                || self.store.store(&world, &delta, &terminal),
            );
            match committed {
                Ok(_) => return Ok((world, terminal, None)),
                Err(e @ (WorldlineError::StaleEpoch { .. } | WorldlineError::StaleBase { .. })) => {
                    tracing::warn!(error = %e, "branch moved during execution");
                    let action_type = &proposal.intent.action_type;
                    let error = internal_error(&e, action_type);
                    let failed = host::failed_snapshot(parent, &error, action_type, seed, now);
                    let (world, delta) = self.build_world(proposal, parent, &failed, WorldOutcome::Failed, now);
                    self.store.store(&world, &delta, &failed)?;
                    return Ok((world, failed, Some(error)));
                }
                Err(e) => return Err(e),
            }
        }
        let (world, delta) = self.build_world(proposal, parent, &terminal, WorldOutcome::Failed, now);
        self.store.store(&world, &delta, &terminal)?;
        Ok((world, terminal, error))
    }

    fn drive_system(&self, handle: &ActionHandle, action_type: &str, input: Value, opts: ActOptions) -> ActionOutcome {
        let now = time::now_millis();
        let name = action_type
            .strip_prefix(&self.config.system_prefix)
            .unwrap_or(action_type);
        let action = match SystemAction::parse(action_type, name, &input, now) {
            Ok(action) => action,
            Err(error) => return ActionOutcome::PreparationFailed { error },
        };
        let mut scoped = opts;
        if scoped.branch_id.is_none() {
            // A missing target is reported when the action runs, not here.
            scoped.branch_id = action
                .target_branch()
                .filter(|id| self.branches.get(id).is_ok())
                .map(str::to_string);
        }
        let (mut proposal, _) = match self.prepare(handle.proposal_id(), action_type, input, &scoped, Lane::System) {
            Ok(prepared) => prepared,
            Err(e) => {
                return ActionOutcome::PreparationFailed {
                    error: internal_error(&e, action_type),
                };
            }
        };

        self.run_system(&mut proposal, &action, handle)
            .unwrap_or_else(|e| ActionOutcome::Failed {
                world_id: None,
                error: internal_error(&e, action_type),
            })
    }

    fn run_system(
        &self,
        proposal: &mut Proposal,
        action: &SystemAction,
        handle: &ActionHandle,
    ) -> Result<ActionOutcome, WorldlineError> {
        if let Verdict::Rejected(reason) = self.evaluate(proposal, Some(handle))? {
            return Ok(ActionOutcome::Rejected { reason });
        }
        let outcome = match self.apply_system(action) {
            Ok((head, detail)) => {
                proposal.transition(ProposalStatus::Completed, None)?;
                tracing::info!(head = %head, "system action completed");
                ActionOutcome::Completed {
                    world_id: head,
                    detail: Some(detail),
                }
            }
            Err(e) => {
                proposal.transition(ProposalStatus::Failed, None)?;
                tracing::info!(error = %e, "system action failed");
                ActionOutcome::Failed {
                    world_id: None,
                    error: internal_error(&e, &proposal.intent.action_type),
                }
            }
        };
        self.store.put_proposal(proposal)?;
        Ok(outcome)
    }

    /// Returns the resulting head of the affected branch and a detail value.
    fn apply_system(&self, action: &SystemAction) -> Result<(String, Value), WorldlineError> {
        match action {
            SystemAction::RegisterActor(actor) => {
                self.store.put_actor(actor)?;
                let head = self.branches.current_branch()?.head;
                Ok((head, serde_json::to_value(actor)?))
            }
            SystemAction::Fork(opts) => {
                let branch = self.fork(opts.clone())?;
                Ok((branch.head.clone(), serde_json::to_value(&branch)?))
            }
            SystemAction::Switch { branch_id } => {
                let branch = self.switch_branch(branch_id)?;
                Ok((branch.head.clone(), serde_json::to_value(&branch)?))
            }
            SystemAction::Reset { branch_id, world_id } => {
                let branch_id = match branch_id {
                    Some(id) => id.clone(),
                    None => self.branches.current_branch_id()?,
                };
                let branch = self.reset_branch(&branch_id, world_id)?;
                Ok((branch.head.clone(), serde_json::to_value(&branch)?))
            }
        }
    }

    fn publish_current(&self) -> Result<(), WorldlineError> {
        let branch = self.branches.current_branch()?;
        let snapshot = self.head_snapshot(&branch)?;
        self.hub.switch_to(&branch.branch_id, snapshot);
        Ok(())
    }

    fn fork(&self, opts: ForkOptions) -> Result<Branch, WorldlineError> {
        let switch = opts.switch;
        let branch = self.branches.fork(opts)?;
        if switch {
            self.publish_current()?;
        }
        Ok(branch)
    }

    fn switch_branch(&self, branch_id: &str) -> Result<Branch, WorldlineError> {
        let branch = self.branches.switch_branch(branch_id)?;
        self.publish_current()?;
        Ok(branch)
    }

    fn reset_branch(&self, branch_id: &str, world_id: &str) -> Result<Branch, WorldlineError> {
        let branch = self.branches.reset(branch_id, world_id)?;
        let snapshot = Arc::new(self.store.restore(world_id)?);
        self.cache_head(branch_id, world_id, Arc::clone(&snapshot));
        self.hub.publish(Lane::System, branch_id, snapshot);
        Ok(branch)
    }
}

/// The embedding surface. Cloning shares one runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn builder(schema: DomainSchema) -> RuntimeBuilder {
        RuntimeBuilder::new(schema)
    }

    /// Queue an action and return its handle immediately.
    pub fn act(&self, action_type: &str, input: Value, opts: ActOptions) -> Result<ActionHandle, WorldlineError> {
        self.inner.enqueue(action_type, input, opts)
    }

    pub fn get_action_handle(&self, proposal_id: &str) -> Result<ActionHandle, WorldlineError> {
        self.inner
            .handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(proposal_id)
            .cloned()
            .ok_or_else(|| WorldlineError::ProposalNotFound(proposal_id.to_string()))
    }

    /// Build a proposal on the current head without submitting it. Pair with
    /// `submit_proposal` to pin the base world, e.g. for retries.
    pub fn new_proposal(&self, action_type: &str, input: Value, opts: &ActOptions) -> Result<Proposal, WorldlineError> {
        let lane = self.inner.lane_for(action_type);
        let (proposal, _) = self.inner.prepare(&time::new_id(), action_type, input, opts, lane)?;
        Ok(proposal)
    }

    /// Run a proposal through the domain lane and wait for its result.
    pub fn submit_proposal(&self, proposal: Proposal) -> Result<SubmitResult, WorldlineError> {
        if self.inner.lane_for(&proposal.intent.action_type) == Lane::System {
            return Err(WorldlineError::ValidationError(
                "system actions are submitted through act".to_string(),
            ));
        }
        if proposal.status != ProposalStatus::Submitted {
            return Err(WorldlineError::InvalidTransition {
                from: proposal.status.to_string(),
                to: ProposalStatus::Evaluating.to_string(),
            });
        }
        self.inner
            .schema
            .validate_intent(&proposal.intent.action_type, &proposal.intent.input, time::now_millis())
            .map_err(|e| WorldlineError::ValidationError(e.message))?;
        self.inner.queue.check_submission(Lane::Domain, None)?;

        let handle = ActionHandle::new(&proposal.proposal_id, &proposal.intent.action_type);
        self.inner.register_handle(&handle);
        let (tx, rx) = channel::bounded(1);
        let inner = Arc::clone(&self.inner);
        let job_id = proposal.proposal_id.clone();
        self.inner.queue.enqueue(
            Lane::Domain,
            &job_id,
            None,
            Box::new(move |token: &InFlight| {
                let action_type = proposal.intent.action_type.clone();
                let proposal_id = proposal.proposal_id.clone();
                let result = catch_unwind(AssertUnwindSafe(|| {
                    inner.process_domain(proposal, Some(&handle), Some(token), &ActOptions::default())
                }))
                .unwrap_or_else(|_| Err(WorldlineError::ValidationError("action job panicked".to_string())));
                if result.is_err() {
                    inner.abandon(&proposal_id);
                }
                let outcome = match &result {
                    Ok(r) => r.clone().into_outcome(),
                    Err(e) => ActionOutcome::Failed {
                        world_id: None,
                        error: internal_error(e, &action_type),
                    },
                };
                handle.settle(outcome);
                let _ = tx.send(result);
            }),
        )?;
        rx.recv()
            .map_err(|_| WorldlineError::ValidationError("domain lane stopped before the proposal ran".to_string()))?
    }

    pub fn get_world(&self, world_id: &str) -> Result<World, WorldlineError> {
        self.inner.store.get_world(world_id)
    }

    pub fn get_snapshot(&self, world_id: &str) -> Result<Snapshot, WorldlineError> {
        self.inner.snapshot_of(world_id)
    }

    /// Head world of the current branch.
    pub fn get_current_head(&self) -> Result<String, WorldlineError> {
        Ok(self.inner.branches.current_branch()?.head)
    }

    /// Snapshot at the head of the current branch.
    pub fn get_state(&self) -> Result<Arc<Snapshot>, WorldlineError> {
        let branch = self.inner.branches.current_branch()?;
        self.inner.head_snapshot(&branch)
    }

    pub fn get_proposal(&self, proposal_id: &str) -> Result<Proposal, WorldlineError> {
        self.inner.store.get_proposal(proposal_id)
    }

    pub fn lineage(&self, world_id: &str) -> Result<Vec<World>, WorldlineError> {
        self.inner.store.lineage(world_id)
    }

    pub fn current_branch(&self) -> Result<Branch, WorldlineError> {
        self.inner.branches.current_branch()
    }

    pub fn get_branch(&self, branch_id: &str) -> Result<Branch, WorldlineError> {
        self.inner.branches.get(branch_id)
    }

    pub fn list_branches(&self) -> Result<Vec<Branch>, WorldlineError> {
        self.inner.branches.list()
    }

    pub fn switch_branch(&self, branch_id: &str) -> Result<Branch, WorldlineError> {
        self.inner.switch_branch(branch_id)
    }

    pub fn fork(&self, opts: ForkOptions) -> Result<Branch, WorldlineError> {
        self.inner.fork(opts)
    }

    /// Move a branch head back to one of its ancestors. In-flight proposals
    /// made against the old epoch fail with `STALE_EPOCH`.
    pub fn reset_branch(&self, branch_id: &str, world_id: &str) -> Result<Branch, WorldlineError> {
        self.inner.reset_branch(branch_id, world_id)
    }

    pub fn register_actor(&self, actor_id: &str, kind: ActorKind, name: Option<&str>) -> Result<ActorRef, WorldlineError> {
        let actor = ActorRef {
            actor_id: actor_id.to_string(),
            kind,
            name: name.map(str::to_string),
        };
        self.inner.store.put_actor(&actor)?;
        Ok(actor)
    }

    /// Listen to a slice of the current branch's state.
    pub fn subscribe<S, L>(&self, selector: S, listener: L, opts: SubscribeOptions) -> Result<Subscription, WorldlineError>
    where
        S: Fn(&Snapshot) -> Value + Send + Sync + 'static,
        L: Fn(&Value) + Send + Sync + 'static,
    {
        let current = self.get_state()?;
        let selector: Selector = Arc::new(selector);
        let listener: Listener = Arc::new(listener);
        Ok(self.inner.hub.subscribe(selector, listener, opts, Some(&current)))
    }

    pub fn schema(&self) -> &DomainSchema {
        &self.inner.schema
    }

    pub fn schema_hash(&self) -> &str {
        &self.inner.schema_hash
    }

    pub fn store(&self) -> Arc<dyn WorldStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn queue_depth(&self, lane: Lane) -> usize {
        self.inner.queue.depth(lane)
    }
}
