//! Policy service: approval decisions, execution keys, and scope checks.
//!
//! Three policies ship with the crate:
//! - `AutoApprovePolicy` approves everything, unrestricted;
//! - `RulePolicy` evaluates a TOML rule file (allow / deny / review);
//! - `DeliberationPolicy` sends every non-system proposal to a human.
//!
//! Review decisions go through a `DecisionBoard`. A proposal under review
//! holds its lane until `DecisionBoard::decide` is called for it.

use crate::core::digest;
use crate::core::error::WorldlineError;
use crate::core::proposal::{ActorKind, ApprovedScope, Proposal};
use crate::core::snapshot::Snapshot;
use crate::core::state_map;
use crate::core::time;
use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const SCOPE_VIOLATION: &str = "SCOPE_VIOLATION";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: String,
    pub approved: bool,
    pub scope: Option<ApprovedScope>,
    pub reason: Option<String>,
    pub decided_by: String,
    pub decided_at: u64,
}

impl Decision {
    pub fn approve(decided_by: &str) -> Self {
        Self {
            decision_id: time::new_id(),
            approved: true,
            scope: None,
            reason: None,
            decided_by: decided_by.to_string(),
            decided_at: time::now_millis(),
        }
    }

    pub fn reject(decided_by: &str, reason: &str) -> Self {
        Self {
            approved: false,
            reason: Some(reason.to_string()),
            ..Self::approve(decided_by)
        }
    }

    pub fn with_scope(mut self, scope: Option<ApprovedScope>) -> Self {
        self.scope = scope;
        self
    }
}

/// Receiving end of a deferred decision.
pub struct DecisionTicket {
    proposal_id: String,
    rx: Receiver<Decision>,
}

impl DecisionTicket {
    pub fn proposal_id(&self) -> &str {
        &self.proposal_id
    }

    /// Block until a decision arrives. A board dropped without deciding is an error.
    pub fn wait(self) -> Result<Decision, WorldlineError> {
        self.rx.recv().map_err(|_| {
            WorldlineError::PolicyError(format!(
                "decision for proposal {} was abandoned",
                self.proposal_id
            ))
        })
    }
}

pub enum Approval {
    Decided(Decision),
    Deferred(DecisionTicket),
}

/// Facts about a proposal the policy cannot read off the proposal itself.
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    pub actor_registered: bool,
    pub branch_name: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("writes outside approved scope: {}", .paths.join(", "))]
pub struct ScopeViolation {
    pub paths: Vec<String>,
}

/// Execution key: SHA-256 over actor, action type, intent key, canonical
/// input, and base world.
pub fn derive_execution_key(proposal: &Proposal) -> String {
    let input = digest::canonical_json_bytes(&proposal.intent.input);
    digest::framed_hash(&[
        ("actor", proposal.actor.actor_id.as_bytes()),
        ("action", proposal.intent.action_type.as_bytes()),
        ("intent_key", proposal.intent.intent_key.as_bytes()),
        ("input", &input),
        ("base_world", proposal.base_world.as_bytes()),
    ])
}

/// Every data path changed between `before` and `after` must fall
/// under the scope. `None` means unrestricted.
pub fn check_scope(
    before: &Snapshot,
    after: &Snapshot,
    scope: Option<&ApprovedScope>,
) -> Result<(), ScopeViolation> {
    let Some(scope) = scope else {
        return Ok(());
    };
    let outside: Vec<String> = state_map::mutated_paths(&state_map::diff(before, after))
        .into_iter()
        .filter(|p| !scope.permits(p))
        .collect();
    if outside.is_empty() {
        Ok(())
    } else {
        Err(ScopeViolation { paths: outside })
    }
}

pub trait PolicyService: Send + Sync {
    fn derive_execution_key(&self, proposal: &Proposal) -> String {
        derive_execution_key(proposal)
    }

    fn request_approval(&self, proposal: &Proposal, ctx: &PolicyContext) -> Result<Approval, WorldlineError>;

    fn validate_result_scope(
        &self,
        before: &Snapshot,
        after: &Snapshot,
        scope: Option<&ApprovedScope>,
    ) -> Result<(), ScopeViolation> {
        check_scope(before, after, scope)
    }
}

#[derive(Debug, Default)]
pub struct AutoApprovePolicy;

impl PolicyService for AutoApprovePolicy {
    fn request_approval(&self, _proposal: &Proposal, _ctx: &PolicyContext) -> Result<Approval, WorldlineError> {
        Ok(Approval::Decided(Decision::approve("policy:auto")))
    }
}

#[derive(Debug, Clone)]
pub struct PendingDecision {
    pub proposal: Proposal,
    /// Scope the rule that sent this to review would grant.
    pub suggested_scope: Option<ApprovedScope>,
    pub queued_at: u64,
}

#[derive(Default)]
struct BoardState {
    waiting: BTreeMap<String, (PendingDecision, Sender<Decision>)>,
}

/// Proposals awaiting a human decision.
#[derive(Default)]
pub struct DecisionBoard {
    state: Mutex<BoardState>,
    changed: Condvar,
}

impl DecisionBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn enqueue(&self, proposal: &Proposal, suggested_scope: Option<ApprovedScope>) -> DecisionTicket {
        let (tx, rx) = channel::bounded(1);
        let entry = PendingDecision {
            proposal: proposal.clone(),
            suggested_scope,
            queued_at: time::now_millis(),
        };
        self.lock()
            .waiting
            .insert(proposal.proposal_id.clone(), (entry, tx));
        self.changed.notify_all();
        tracing::info!(proposal_id = %proposal.proposal_id, action = %proposal.intent.action_type, "proposal awaiting decision");
        DecisionTicket {
            proposal_id: proposal.proposal_id.clone(),
            rx,
        }
    }

    pub fn pending(&self) -> Vec<PendingDecision> {
        self.lock()
            .waiting
            .values()
            .map(|(entry, _)| entry.clone())
            .collect()
    }

    /// Block until `proposal_id` is waiting on the board, or the timeout passes.
    pub fn wait_for(&self, proposal_id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.waiting.contains_key(proposal_id) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|p| p.into_inner().0);
        }
    }

    pub fn decide(&self, proposal_id: &str, decision: Decision) -> Result<(), WorldlineError> {
        let (_, tx) = self
            .lock()
            .waiting
            .remove(proposal_id)
            .ok_or_else(|| WorldlineError::ProposalNotFound(proposal_id.to_string()))?;
        self.changed.notify_all();
        tracing::info!(proposal_id, approved = decision.approved, decided_by = %decision.decided_by, "decision recorded");
        tx.send(decision).map_err(|_| {
            WorldlineError::PolicyError(format!("proposal {} is no longer waiting", proposal_id))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleEffect {
    Allow,
    Deny,
    Review,
}

fn allow() -> RuleEffect {
    RuleEffect::Allow
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Exact action type, `prefix.*`, or `*`.
    pub action: String,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub actor_kind: Option<ActorKind>,
    pub effect: RuleEffect,
    #[serde(default)]
    pub reason: Option<String>,
    /// Writable path prefixes granted on approval.
    #[serde(default)]
    pub scope: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default = "allow")]
    pub default: RuleEffect,
    #[serde(default)]
    pub require_registered_actors: bool,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            default: RuleEffect::Allow,
            require_registered_actors: false,
            rules: Vec::new(),
        }
    }
}

fn pattern_matches(pattern: &str, action_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => action_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => pattern == action_type,
    }
}

impl PolicyRule {
    fn matches(&self, proposal: &Proposal) -> bool {
        pattern_matches(&self.action, &proposal.intent.action_type)
            && self
                .actor
                .as_deref()
                .is_none_or(|a| a == proposal.actor.actor_id)
            && self.actor_kind.is_none_or(|k| k == proposal.actor.kind)
    }

    fn scope(&self) -> Option<ApprovedScope> {
        self.scope.as_ref().map(|paths| ApprovedScope {
            allowed_paths: paths.clone(),
        })
    }
}

pub struct RulePolicy {
    rules: RuleSet,
    board: Arc<DecisionBoard>,
}

impl RulePolicy {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules,
            board: Arc::new(DecisionBoard::new()),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, WorldlineError> {
        let rules: RuleSet = toml::from_str(raw)
            .map_err(|e| WorldlineError::ConfigError(format!("invalid policy file: {}", e)))?;
        Ok(Self::new(rules))
    }

    /// Load a rule file; a missing file means allow-all.
    pub fn load(path: &Path) -> Result<Self, WorldlineError> {
        if !path.exists() {
            return Ok(Self::new(RuleSet::default()));
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn board(&self) -> Arc<DecisionBoard> {
        Arc::clone(&self.board)
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }
}

impl PolicyService for RulePolicy {
    fn request_approval(&self, proposal: &Proposal, ctx: &PolicyContext) -> Result<Approval, WorldlineError> {
        if self.rules.require_registered_actors
            && !ctx.actor_registered
            && proposal.actor.kind != ActorKind::System
        {
            return Ok(Approval::Decided(Decision::reject(
                "policy:rules",
                &format!("actor {} is not registered", proposal.actor.actor_id),
            )));
        }
        let rule = self.rules.rules.iter().find(|r| r.matches(proposal));
        let effect = rule.map_or(self.rules.default, |r| r.effect);
        let scope = rule.and_then(PolicyRule::scope);
        tracing::debug!(
            proposal_id = %proposal.proposal_id,
            action = %proposal.intent.action_type,
            ?effect,
            "rule evaluated"
        );
        Ok(match effect {
            RuleEffect::Allow => Approval::Decided(Decision::approve("policy:rules").with_scope(scope)),
            RuleEffect::Deny => {
                let reason = rule
                    .and_then(|r| r.reason.clone())
                    .unwrap_or_else(|| "denied by policy".to_string());
                Approval::Decided(Decision::reject("policy:rules", &reason))
            }
            RuleEffect::Review => Approval::Deferred(self.board.enqueue(proposal, scope)),
        })
    }
}

/// Human-in-the-loop: every proposal not made by the system waits on the board.
pub struct DeliberationPolicy {
    board: Arc<DecisionBoard>,
}

impl DeliberationPolicy {
    pub fn new(board: Arc<DecisionBoard>) -> Self {
        Self { board }
    }

    pub fn board(&self) -> Arc<DecisionBoard> {
        Arc::clone(&self.board)
    }
}

impl PolicyService for DeliberationPolicy {
    fn request_approval(&self, proposal: &Proposal, _ctx: &PolicyContext) -> Result<Approval, WorldlineError> {
        if proposal.actor.kind == ActorKind::System {
            return Ok(Approval::Decided(Decision::approve("policy:system")));
        }
        Ok(Approval::Deferred(self.board.enqueue(proposal, None)))
    }
}
