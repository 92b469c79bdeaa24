use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorldlineError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("Effect not registered: {0}")]
    EffectNotRegistered(String),
    #[error("Proposal not found: {0}")]
    ProposalNotFound(String),
    #[error("World not found: {0}")]
    WorldNotFound(String),
    #[error("World already exists: {0}")]
    WorldAlreadyExists(String),
    #[error("Branch not found: {0}")]
    BranchNotFound(String),
    #[error("Re-entrant submission rejected on {lane} lane (in flight: {in_flight})")]
    ReentrantSubmission { lane: String, in_flight: String },
    #[error("Policy error: {0}")]
    PolicyError(String),
    #[error("Branch {branch_id} is at epoch {actual}, proposal was made at epoch {expected}")]
    StaleEpoch {
        branch_id: String,
        expected: u64,
        actual: u64,
    },
    #[error("Branch {branch_id} head is {head}, proposal was based on {base}")]
    StaleBase {
        branch_id: String,
        base: String,
        head: String,
    },
}

impl WorldlineError {
    /// Stable machine-readable code, used in command envelopes and snapshot error blocks.
    pub fn code(&self) -> &'static str {
        match self {
            WorldlineError::RusqliteError(_) => "STORE_SQLITE",
            WorldlineError::IoError(_) => "IO",
            WorldlineError::SerdeError(_) => "SERDE",
            WorldlineError::ConfigError(_) => "CONFIG",
            WorldlineError::ValidationError(_) => "VALIDATION",
            WorldlineError::NotFound(_) => "NOT_FOUND",
            WorldlineError::InvalidTransition { .. } => "INVALID_TRANSITION",
            WorldlineError::EffectNotRegistered(_) => "EFFECT_NOT_REGISTERED",
            WorldlineError::ProposalNotFound(_) => "PROPOSAL_NOT_FOUND",
            WorldlineError::WorldNotFound(_) => "WORLD_NOT_FOUND",
            WorldlineError::WorldAlreadyExists(_) => "WORLD_ALREADY_EXISTS",
            WorldlineError::BranchNotFound(_) => "BRANCH_NOT_FOUND",
            WorldlineError::ReentrantSubmission { .. } => "REENTRANT_SUBMISSION",
            WorldlineError::PolicyError(_) => "POLICY",
            WorldlineError::StaleEpoch { .. } => "STALE_EPOCH",
            WorldlineError::StaleBase { .. } => "STALE_BASE",
        }
    }
}
