//! Worlds, deltas, and branches: the nodes, edges, and pointers of history.

use crate::core::digest;
use crate::core::patch::Patch;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorldOutcome {
    Genesis,
    Completed,
    Failed,
}

impl WorldOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            WorldOutcome::Genesis => "genesis",
            WorldOutcome::Completed => "completed",
            WorldOutcome::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "genesis" => Some(WorldOutcome::Genesis),
            "completed" => Some(WorldOutcome::Completed),
            "failed" => Some(WorldOutcome::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct World {
    pub world_id: String,
    pub schema_hash: String,
    pub snapshot_hash: String,
    pub created_at: u64,
    /// Proposal that produced this world; `None` for genesis.
    pub created_by: Option<String>,
    pub parent: Option<String>,
    pub outcome: WorldOutcome,
}

impl World {
    pub fn genesis(schema_hash: &str, snapshot_hash: &str, created_at: u64) -> Self {
        Self {
            world_id: derive_world_id(schema_hash, snapshot_hash, None, None),
            schema_hash: schema_hash.to_string(),
            snapshot_hash: snapshot_hash.to_string(),
            created_at,
            created_by: None,
            parent: None,
            outcome: WorldOutcome::Genesis,
        }
    }

    pub fn derived(
        schema_hash: &str,
        snapshot_hash: &str,
        parent: &str,
        proposal_id: &str,
        outcome: WorldOutcome,
        created_at: u64,
    ) -> Self {
        Self {
            world_id: derive_world_id(schema_hash, snapshot_hash, Some(parent), Some(proposal_id)),
            schema_hash: schema_hash.to_string(),
            snapshot_hash: snapshot_hash.to_string(),
            created_at,
            created_by: Some(proposal_id.to_string()),
            parent: Some(parent.to_string()),
            outcome,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.parent.is_none()
    }
}

/// Content address of a world. Genesis ids depend only on schema and content.
pub fn derive_world_id(
    schema_hash: &str,
    snapshot_hash: &str,
    parent: Option<&str>,
    proposal_id: Option<&str>,
) -> String {
    digest::framed_hash(&[
        ("schema", schema_hash.as_bytes()),
        ("snapshot", snapshot_hash.as_bytes()),
        ("parent", parent.unwrap_or("").as_bytes()),
        ("proposal", proposal_id.unwrap_or("").as_bytes()),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldDelta {
    pub from_world: String,
    pub to_world: String,
    pub patches: Vec<Patch>,
    pub created_at: u64,
}

impl WorldDelta {
    pub fn genesis(world_id: &str, created_at: u64) -> Self {
        Self {
            from_world: world_id.to_string(),
            to_world: world_id.to_string(),
            patches: Vec::new(),
            created_at,
        }
    }

    pub fn is_self_edge(&self) -> bool {
        self.from_world == self.to_world
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Branch {
    pub branch_id: String,
    pub name: String,
    pub head: String,
    pub schema_hash: String,
    /// Generation counter, bumped when the head is reset backwards.
    pub epoch: u64,
    pub parent_branch: Option<String>,
    pub forked_from: Option<String>,
    pub created_at: u64,
}
