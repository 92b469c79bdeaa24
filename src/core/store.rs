//! World store abstraction.
//!
//! The store owns everything durable: worlds, deltas, cached snapshots,
//! branches, proposal records, and registered actors. Two backends exist:
//! an in-memory store for embedding and tests, and the SQLite store in
//! `core::sqlite_store`.
//!
//! Snapshots are not stored for every world. `restore` rebuilds any world by
//! walking back to the nearest cached snapshot and replaying deltas forward.

use crate::core::error::WorldlineError;
use crate::core::proposal::{ActorRef, Proposal, ProposalStatus};
use crate::core::snapshot::Snapshot;
use crate::core::state_map;
use crate::core::world::{Branch, World, WorldDelta};
use rustc_hash::FxHashMap;
use std::sync::RwLock;

/// Store backend discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Process-local, lost on exit.
    Memory,
    /// Durable SQLite file under the store root.
    Sqlite,
}

/// Default spacing between cached snapshots along a lineage.
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 16;

pub trait WorldStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// Persist a world, its incoming delta, and (when the cache policy says so)
    /// its snapshot, atomically. An existing `world_id` is never overwritten.
    fn store(&self, world: &World, delta: &WorldDelta, snapshot: &Snapshot) -> Result<(), WorldlineError>;
    fn get_world(&self, world_id: &str) -> Result<World, WorldlineError>;
    fn get_delta(&self, to_world: &str) -> Result<WorldDelta, WorldlineError>;
    fn cached_snapshot(&self, world_id: &str) -> Result<Option<Snapshot>, WorldlineError>;
    fn list_worlds(&self) -> Result<Vec<World>, WorldlineError>;

    fn put_branch(&self, branch: &Branch) -> Result<(), WorldlineError>;
    fn get_branch(&self, branch_id: &str) -> Result<Branch, WorldlineError>;
    fn list_branches(&self) -> Result<Vec<Branch>, WorldlineError>;

    fn put_proposal(&self, proposal: &Proposal) -> Result<(), WorldlineError>;
    fn get_proposal(&self, proposal_id: &str) -> Result<Proposal, WorldlineError>;
    /// A completed proposal with this execution key, if one exists.
    fn find_completed(&self, execution_key: &str) -> Result<Option<Proposal>, WorldlineError>;

    fn put_actor(&self, actor: &ActorRef) -> Result<(), WorldlineError>;
    fn get_actor(&self, actor_id: &str) -> Result<Option<ActorRef>, WorldlineError>;

    /// Rebuild the snapshot of `world_id`.
    fn restore(&self, world_id: &str) -> Result<Snapshot, WorldlineError> {
        let target = self.get_world(world_id)?;
        let mut chain: Vec<WorldDelta> = Vec::new();
        let mut cursor = target.clone();
        let mut base = loop {
            if let Some(snapshot) = self.cached_snapshot(&cursor.world_id)? {
                break snapshot;
            }
            let Some(parent) = cursor.parent.clone() else {
                return Err(WorldlineError::ValidationError(format!(
                    "genesis world {} has no cached snapshot",
                    cursor.world_id
                )));
            };
            chain.push(self.get_delta(&cursor.world_id)?);
            cursor = self.get_world(&parent)?;
        };
        for delta in chain.iter().rev() {
            base = state_map::apply(&base, &delta.patches, delta.created_at)?;
        }
        let hash = base.content_hash();
        if hash != target.snapshot_hash {
            return Err(WorldlineError::ValidationError(format!(
                "replay of world {} diverged: expected {}, got {}",
                world_id, target.snapshot_hash, hash
            )));
        }
        Ok(base)
    }

    /// Worlds from `world_id` back to genesis, newest first.
    fn lineage(&self, world_id: &str) -> Result<Vec<World>, WorldlineError> {
        let mut out = Vec::new();
        let mut next = Some(world_id.to_string());
        while let Some(id) = next {
            let world = self.get_world(&id)?;
            next = world.parent.clone();
            out.push(world);
        }
        Ok(out)
    }

    /// Store a genesis world, tolerating one that already exists.
    fn store_genesis(&self, world: &World, snapshot: &Snapshot) -> Result<(), WorldlineError> {
        let delta = WorldDelta::genesis(&world.world_id, world.created_at);
        match self.store(world, &delta, snapshot) {
            Ok(()) => Ok(()),
            Err(WorldlineError::WorldAlreadyExists(id)) => {
                tracing::debug!(world_id = %id, "genesis world already stored");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Checks shared by every backend before a write.
pub fn validate_store_input(world: &World, delta: &WorldDelta, snapshot: &Snapshot) -> Result<(), WorldlineError> {
    if delta.to_world != world.world_id {
        return Err(WorldlineError::ValidationError(format!(
            "delta targets {} but world is {}",
            delta.to_world, world.world_id
        )));
    }
    match &world.parent {
        Some(parent) if &delta.from_world != parent => {
            return Err(WorldlineError::ValidationError(format!(
                "delta starts at {} but world parent is {}",
                delta.from_world, parent
            )));
        }
        None if !delta.is_self_edge() || !delta.patches.is_empty() => {
            return Err(WorldlineError::ValidationError(
                "genesis world requires an empty self-referential delta".to_string(),
            ));
        }
        _ => {}
    }
    let hash = snapshot.content_hash();
    if hash != world.snapshot_hash {
        return Err(WorldlineError::ValidationError(format!(
            "snapshot hash {} does not match world {} ({})",
            hash, world.world_id, world.snapshot_hash
        )));
    }
    Ok(())
}

/// Cache policy: genesis always, then every `interval`-th version.
pub fn should_cache(world: &World, snapshot: &Snapshot, interval: u64) -> bool {
    world.is_genesis() || interval <= 1 || snapshot.meta.version % interval == 0
}

#[derive(Default)]
struct MemoryState {
    worlds: FxHashMap<String, World>,
    world_order: Vec<String>,
    deltas: FxHashMap<String, WorldDelta>,
    snapshots: FxHashMap<String, Snapshot>,
    branches: FxHashMap<String, Branch>,
    branch_order: Vec<String>,
    proposals: FxHashMap<String, Proposal>,
    actors: FxHashMap<String, ActorRef>,
}

/// In-process store. All maps sit behind one lock so a world and its delta
/// become visible together.
pub struct MemoryWorldStore {
    state: RwLock<MemoryState>,
    snapshot_interval: u64,
}

impl Default for MemoryWorldStore {
    fn default() -> Self {
        Self::new(DEFAULT_SNAPSHOT_INTERVAL)
    }
}

impl MemoryWorldStore {
    pub fn new(snapshot_interval: u64) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            snapshot_interval,
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryState>, WorldlineError> {
        self.state
            .read()
            .map_err(|_| WorldlineError::ValidationError("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>, WorldlineError> {
        self.state
            .write()
            .map_err(|_| WorldlineError::ValidationError("memory store lock poisoned".to_string()))
    }
}

impl WorldStore for MemoryWorldStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }

    fn store(&self, world: &World, delta: &WorldDelta, snapshot: &Snapshot) -> Result<(), WorldlineError> {
        validate_store_input(world, delta, snapshot)?;
        let mut state = self.write()?;
        if state.worlds.contains_key(&world.world_id) {
            return Err(WorldlineError::WorldAlreadyExists(world.world_id.clone()));
        }
        if let Some(parent) = &world.parent
            && !state.worlds.contains_key(parent)
        {
            return Err(WorldlineError::WorldNotFound(parent.clone()));
        }
        state.worlds.insert(world.world_id.clone(), world.clone());
        state.world_order.push(world.world_id.clone());
        state.deltas.insert(world.world_id.clone(), delta.clone());
        if should_cache(world, snapshot, self.snapshot_interval) {
            state.snapshots.insert(world.world_id.clone(), snapshot.clone());
        }
        Ok(())
    }

    fn get_world(&self, world_id: &str) -> Result<World, WorldlineError> {
        self.read()?
            .worlds
            .get(world_id)
            .cloned()
            .ok_or_else(|| WorldlineError::WorldNotFound(world_id.to_string()))
    }

    fn get_delta(&self, to_world: &str) -> Result<WorldDelta, WorldlineError> {
        self.read()?
            .deltas
            .get(to_world)
            .cloned()
            .ok_or_else(|| WorldlineError::NotFound(format!("delta into world {}", to_world)))
    }

    fn cached_snapshot(&self, world_id: &str) -> Result<Option<Snapshot>, WorldlineError> {
        Ok(self.read()?.snapshots.get(world_id).cloned())
    }

    fn list_worlds(&self) -> Result<Vec<World>, WorldlineError> {
        let state = self.read()?;
        Ok(state
            .world_order
            .iter()
            .filter_map(|id| state.worlds.get(id).cloned())
            .collect())
    }

    fn put_branch(&self, branch: &Branch) -> Result<(), WorldlineError> {
        let mut state = self.write()?;
        if !state.worlds.contains_key(&branch.head) {
            return Err(WorldlineError::WorldNotFound(branch.head.clone()));
        }
        if state
            .branches
            .insert(branch.branch_id.clone(), branch.clone())
            .is_none()
        {
            state.branch_order.push(branch.branch_id.clone());
        }
        Ok(())
    }

    fn get_branch(&self, branch_id: &str) -> Result<Branch, WorldlineError> {
        self.read()?
            .branches
            .get(branch_id)
            .cloned()
            .ok_or_else(|| WorldlineError::BranchNotFound(branch_id.to_string()))
    }

    fn list_branches(&self) -> Result<Vec<Branch>, WorldlineError> {
        let state = self.read()?;
        Ok(state
            .branch_order
            .iter()
            .filter_map(|id| state.branches.get(id).cloned())
            .collect())
    }

    fn put_proposal(&self, proposal: &Proposal) -> Result<(), WorldlineError> {
        self.write()?
            .proposals
            .insert(proposal.proposal_id.clone(), proposal.clone());
        Ok(())
    }

    fn get_proposal(&self, proposal_id: &str) -> Result<Proposal, WorldlineError> {
        self.read()?
            .proposals
            .get(proposal_id)
            .cloned()
            .ok_or_else(|| WorldlineError::ProposalNotFound(proposal_id.to_string()))
    }

    fn find_completed(&self, execution_key: &str) -> Result<Option<Proposal>, WorldlineError> {
        Ok(self
            .read()?
            .proposals
            .values()
            .find(|p| {
                p.status == ProposalStatus::Completed
                    && p.execution_key.as_deref() == Some(execution_key)
            })
            .cloned())
    }

    fn put_actor(&self, actor: &ActorRef) -> Result<(), WorldlineError> {
        self.write()?
            .actors
            .insert(actor.actor_id.clone(), actor.clone());
        Ok(())
    }

    fn get_actor(&self, actor_id: &str) -> Result<Option<ActorRef>, WorldlineError> {
        Ok(self.read()?.actors.get(actor_id).cloned())
    }
}
