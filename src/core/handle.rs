//! Action handles: the caller's view of one `act` call.

use crate::core::snapshot::ErrorValue;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPhase {
    Preparing,
    PreparationFailed,
    Submitted,
    Evaluating,
    Pending,
    Approved,
    Rejected,
    Executing,
    Completed,
    Failed,
}

impl ActionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionPhase::PreparationFailed
                | ActionPhase::Rejected
                | ActionPhase::Completed
                | ActionPhase::Failed
        )
    }
}

/// How an action ended. Exactly one of these is delivered per handle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// `world_id` is the new head, or the unchanged head for system actions.
    Completed {
        world_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },
    /// `world_id` is the failure world; absent only when it could not be stored.
    Failed {
        world_id: Option<String>,
        error: ErrorValue,
    },
    Rejected {
        reason: String,
    },
    PreparationFailed {
        error: ErrorValue,
    },
}

impl ActionOutcome {
    pub fn phase(&self) -> ActionPhase {
        match self {
            ActionOutcome::Completed { .. } => ActionPhase::Completed,
            ActionOutcome::Failed { .. } => ActionPhase::Failed,
            ActionOutcome::Rejected { .. } => ActionPhase::Rejected,
            ActionOutcome::PreparationFailed { .. } => ActionPhase::PreparationFailed,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ActionOutcome::Completed { .. })
    }

    pub fn world_id(&self) -> Option<&str> {
        match self {
            ActionOutcome::Completed { world_id, .. } => Some(world_id),
            ActionOutcome::Failed { world_id, .. } => world_id.as_deref(),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorValue> {
        match self {
            ActionOutcome::Failed { error, .. } | ActionOutcome::PreparationFailed { error } => Some(error),
            _ => None,
        }
    }
}

struct HandleState {
    phases: Vec<ActionPhase>,
    outcome: Option<ActionOutcome>,
}

struct HandleInner {
    state: Mutex<HandleState>,
    settled: Condvar,
}

#[derive(Clone)]
pub struct ActionHandle {
    proposal_id: String,
    action_type: String,
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for ActionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionHandle")
            .field("proposal_id", &self.proposal_id)
            .field("action_type", &self.action_type)
            .field("phase", &self.phase())
            .finish()
    }
}

impl ActionHandle {
    pub(crate) fn new(proposal_id: &str, action_type: &str) -> Self {
        Self {
            proposal_id: proposal_id.to_string(),
            action_type: action_type.to_string(),
            inner: Arc::new(HandleInner {
                state: Mutex::new(HandleState {
                    phases: vec![ActionPhase::Preparing],
                    outcome: None,
                }),
                settled: Condvar::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HandleState> {
        // Handle state is plain data; a panic elsewhere cannot leave it torn.
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn proposal_id(&self) -> &str {
        &self.proposal_id
    }

    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    pub fn phase(&self) -> ActionPhase {
        self.state()
            .phases
            .last()
            .copied()
            .unwrap_or(ActionPhase::Preparing)
    }

    /// Every phase observed so far, oldest first.
    pub fn phases(&self) -> Vec<ActionPhase> {
        self.state().phases.clone()
    }

    pub fn is_settled(&self) -> bool {
        self.state().outcome.is_some()
    }

    pub fn try_result(&self) -> Option<ActionOutcome> {
        self.state().outcome.clone()
    }

    /// Block until the action settles.
    pub fn result(&self) -> ActionOutcome {
        let mut state = self.state();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            state = self
                .inner
                .settled
                .wait(state)
                .unwrap_or_else(|p| p.into_inner());
        }
    }

    pub fn result_timeout(&self, timeout: Duration) -> Option<ActionOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            if let Some(outcome) = &state.outcome {
                return Some(outcome.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .inner
                .settled
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|p| p.into_inner().0);
        }
    }

    pub(crate) fn advance(&self, phase: ActionPhase) {
        let mut state = self.state();
        if state.outcome.is_some() {
            return;
        }
        if state.phases.last() != Some(&phase) {
            state.phases.push(phase);
        }
    }

    /// Deliver the outcome. Returns false if one was already delivered.
    pub(crate) fn settle(&self, outcome: ActionOutcome) -> bool {
        let mut state = self.state();
        if state.outcome.is_some() {
            tracing::warn!(proposal_id = %self.proposal_id, "action handle settled twice; keeping first outcome");
            return false;
        }
        let phase = outcome.phase();
        if state.phases.last() != Some(&phase) {
            state.phases.push(phase);
        }
        state.outcome = Some(outcome);
        self.inner.settled.notify_all();
        true
    }
}
