//! Proposal records and the status lattice they move through.
//!
//! `transition` is pure: it never performs I/O and is the single gate every
//! status mutation goes through, whether the caller is the orchestrator or a
//! store rehydrating a record.

use crate::core::error::WorldlineError;
use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Submitted,
    Pending,
    Evaluating,
    Approved,
    Rejected,
    Executing,
    Completed,
    Failed,
}

impl ProposalStatus {
    pub const ALL: [ProposalStatus; 8] = [
        ProposalStatus::Submitted,
        ProposalStatus::Pending,
        ProposalStatus::Evaluating,
        ProposalStatus::Approved,
        ProposalStatus::Rejected,
        ProposalStatus::Executing,
        ProposalStatus::Completed,
        ProposalStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProposalStatus::Submitted => "submitted",
            ProposalStatus::Pending => "pending",
            ProposalStatus::Evaluating => "evaluating",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Executing => "executing",
            ProposalStatus::Completed => "completed",
            ProposalStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, WorldlineError> {
        ProposalStatus::ALL
            .into_iter()
            .find(|s| s.as_str() == raw)
            .ok_or_else(|| {
                WorldlineError::ValidationError(format!("unknown proposal status '{}'", raw))
            })
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProposalStatus::Rejected | ProposalStatus::Completed | ProposalStatus::Failed
        )
    }

    /// Statuses reachable in one step from `self`.
    pub fn successors(self) -> &'static [ProposalStatus] {
        use ProposalStatus::*;
        match self {
            Submitted => &[Pending, Evaluating, Approved, Rejected],
            Evaluating => &[Pending, Approved, Rejected],
            Pending => &[Approved, Rejected],
            Approved => &[Executing],
            Executing => &[Completed, Failed],
            Rejected | Completed | Failed => &[],
        }
    }

    pub fn can_transition_to(self, to: ProposalStatus) -> bool {
        self.successors().contains(&to)
    }

    fn requires_decision(self) -> bool {
        matches!(self, ProposalStatus::Approved | ProposalStatus::Rejected)
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Agent,
    Human,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActorRef {
    pub actor_id: String,
    pub kind: ActorKind,
    #[serde(default)]
    pub name: Option<String>,
}

impl ActorRef {
    pub fn agent(actor_id: &str) -> Self {
        Self {
            actor_id: actor_id.to_string(),
            kind: ActorKind::Agent,
            name: None,
        }
    }

    pub fn human(actor_id: &str) -> Self {
        Self {
            actor_id: actor_id.to_string(),
            kind: ActorKind::Human,
            name: None,
        }
    }

    pub fn system() -> Self {
        Self {
            actor_id: "system".to_string(),
            kind: ActorKind::System,
            name: None,
        }
    }
}

/// The operation being proposed. `input` is opaque to everything except effects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Intent {
    pub intent_id: String,
    /// Idempotency key. Two intents with the same key and input are the same request.
    pub intent_key: String,
    pub action_type: String,
    pub input: Value,
}

impl Intent {
    pub fn new(action_type: &str, input: Value) -> Self {
        let intent_id = time::new_id();
        Self {
            intent_key: intent_id.clone(),
            intent_id,
            action_type: action_type.to_string(),
            input,
        }
    }

    pub fn with_key(mut self, intent_key: &str) -> Self {
        self.intent_key = intent_key.to_string();
        self
    }
}

/// Writable path prefixes granted by a decision. Paths are dotted snapshot paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovedScope {
    pub allowed_paths: Vec<String>,
}

impl ApprovedScope {
    pub fn new(paths: &[&str]) -> Self {
        Self {
            allowed_paths: paths.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// True when `path` equals or lies beneath one of the allowed prefixes.
    pub fn permits(&self, path: &str) -> bool {
        self.allowed_paths.iter().any(|allowed| {
            path == allowed
                || (path.starts_with(allowed.as_str())
                    && path.as_bytes().get(allowed.len()) == Some(&b'.'))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Proposal {
    pub proposal_id: String,
    pub actor: ActorRef,
    pub intent: Intent,
    pub base_world: String,
    pub branch_id: String,
    pub status: ProposalStatus,
    pub epoch: u64,
    pub execution_key: Option<String>,
    pub decision_id: Option<String>,
    pub result_world: Option<String>,
    pub approved_scope: Option<ApprovedScope>,
    pub rejection_reason: Option<String>,
    pub submitted_at: u64,
    pub decided_at: Option<u64>,
    pub completed_at: Option<u64>,
}

impl Proposal {
    pub fn new(actor: ActorRef, intent: Intent, base_world: &str, branch_id: &str, epoch: u64) -> Self {
        Self {
            proposal_id: time::new_id(),
            actor,
            intent,
            base_world: base_world.to_string(),
            branch_id: branch_id.to_string(),
            status: ProposalStatus::Submitted,
            epoch,
            execution_key: None,
            decision_id: None,
            result_world: None,
            approved_scope: None,
            rejection_reason: None,
            submitted_at: time::now_millis(),
            decided_at: None,
            completed_at: None,
        }
    }

    /// Move to `to`, optionally recording a decision id in the same step.
    pub fn transition(&mut self, to: ProposalStatus, decision_id: Option<&str>) -> Result<(), WorldlineError> {
        validate_transition(self.status, to, self.decision_id.as_deref(), decision_id)?;
        if let Some(id) = decision_id {
            self.set_decision(id)?;
        }
        self.status = to;
        if to.requires_decision() && self.decided_at.is_none() {
            self.decided_at = Some(time::now_millis());
        }
        if matches!(to, ProposalStatus::Completed | ProposalStatus::Failed) {
            self.completed_at = Some(time::now_millis());
        }
        Ok(())
    }

    fn set_decision(&mut self, decision_id: &str) -> Result<(), WorldlineError> {
        match &self.decision_id {
            Some(existing) if existing == decision_id => Ok(()),
            Some(existing) => Err(WorldlineError::ValidationError(format!(
                "proposal {} already decided by {}",
                self.proposal_id, existing
            ))),
            None => {
                self.decision_id = Some(decision_id.to_string());
                Ok(())
            }
        }
    }

    pub fn set_execution_key(&mut self, key: &str) -> Result<(), WorldlineError> {
        match &self.execution_key {
            Some(existing) if existing != key => Err(WorldlineError::ValidationError(format!(
                "execution key for proposal {} is already fixed",
                self.proposal_id
            ))),
            _ => {
                self.execution_key = Some(key.to_string());
                Ok(())
            }
        }
    }

    pub fn set_result_world(&mut self, world_id: &str) -> Result<(), WorldlineError> {
        if self.result_world.is_some() {
            return Err(WorldlineError::ValidationError(format!(
                "result world for proposal {} already recorded",
                self.proposal_id
            )));
        }
        self.result_world = Some(world_id.to_string());
        Ok(())
    }
}

/// Check one status step against the edge table.
///
/// A step into `approved` or `rejected` needs a decision id, either already
/// recorded on the proposal or supplied with the step.
pub fn validate_transition(
    from: ProposalStatus,
    to: ProposalStatus,
    recorded_decision: Option<&str>,
    supplied_decision: Option<&str>,
) -> Result<(), WorldlineError> {
    if !from.can_transition_to(to) {
        return Err(WorldlineError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    if to.requires_decision() && recorded_decision.is_none() && supplied_decision.is_none() {
        return Err(WorldlineError::ValidationError(format!(
            "transition {} -> {} requires a decision id",
            from, to
        )));
    }
    Ok(())
}
