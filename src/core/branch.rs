//! Branch pointers over the world graph.
//!
//! Branch records live in the world store; this module owns the rules for
//! moving them. Every read-modify-write of a branch goes through one mutex so
//! the domain lane (advancing heads) and the system lane (fork/reset) cannot
//! interleave on the same record.

use crate::core::error::WorldlineError;
use crate::core::store::WorldStore;
use crate::core::time;
use crate::core::world::Branch;
use std::sync::{Arc, Mutex, RwLock};

pub const MAIN_BRANCH: &str = "main";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForkOptions {
    /// Source branch; defaults to the current branch.
    pub from_branch: Option<String>,
    pub name: Option<String>,
    /// Fork from an ancestor of the source head instead of the head itself.
    pub at_world: Option<String>,
    /// Make the new branch current.
    pub switch: bool,
}

pub struct BranchManager {
    store: Arc<dyn WorldStore>,
    current: RwLock<String>,
    write_lock: Mutex<()>,
}

impl BranchManager {
    pub fn new(store: Arc<dyn WorldStore>) -> Self {
        Self {
            store,
            current: RwLock::new(MAIN_BRANCH.to_string()),
            write_lock: Mutex::new(()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, WorldlineError> {
        self.write_lock
            .lock()
            .map_err(|_| WorldlineError::ValidationError("branch lock poisoned".to_string()))
    }

    /// Create the main branch at `genesis` unless it already exists.
    pub fn ensure_main(&self, genesis: &str, schema_hash: &str) -> Result<Branch, WorldlineError> {
        let _guard = self.lock()?;
        match self.store.get_branch(MAIN_BRANCH) {
            Ok(existing) => Ok(existing),
            Err(WorldlineError::BranchNotFound(_)) => {
                let branch = Branch {
                    branch_id: MAIN_BRANCH.to_string(),
                    name: MAIN_BRANCH.to_string(),
                    head: genesis.to_string(),
                    schema_hash: schema_hash.to_string(),
                    epoch: 0,
                    parent_branch: None,
                    forked_from: None,
                    created_at: time::now_millis(),
                };
                self.store.put_branch(&branch)?;
                Ok(branch)
            }
            Err(e) => Err(e),
        }
    }

    pub fn current_branch_id(&self) -> Result<String, WorldlineError> {
        self.current
            .read()
            .map(|id| id.clone())
            .map_err(|_| WorldlineError::ValidationError("branch pointer poisoned".to_string()))
    }

    pub fn current_branch(&self) -> Result<Branch, WorldlineError> {
        self.store.get_branch(&self.current_branch_id()?)
    }

    pub fn get(&self, branch_id: &str) -> Result<Branch, WorldlineError> {
        self.store.get_branch(branch_id)
    }

    pub fn list(&self) -> Result<Vec<Branch>, WorldlineError> {
        self.store.list_branches()
    }

    pub fn switch_branch(&self, branch_id: &str) -> Result<Branch, WorldlineError> {
        let branch = self.store.get_branch(branch_id)?;
        let mut current = self
            .current
            .write()
            .map_err(|_| WorldlineError::ValidationError("branch pointer poisoned".to_string()))?;
        *current = branch.branch_id.clone();
        Ok(branch)
    }

    pub fn fork(&self, opts: ForkOptions) -> Result<Branch, WorldlineError> {
        let from = match opts.from_branch {
            Some(id) => id,
            None => self.current_branch_id()?,
        };
        let branch = {
            let _guard = self.lock()?;
            let source = self.store.get_branch(&from)?;
            let head = match opts.at_world {
                Some(world_id) => {
                    self.require_ancestor(&source.head, &world_id)?;
                    world_id
                }
                None => source.head.clone(),
            };
            let branch_id = time::new_id();
            let branch = Branch {
                name: opts.name.unwrap_or_else(|| format!("{}-fork-{}", source.name, &branch_id[20..])),
                branch_id,
                head: head.clone(),
                schema_hash: source.schema_hash.clone(),
                epoch: 0,
                parent_branch: Some(source.branch_id.clone()),
                forked_from: Some(head),
                created_at: time::now_millis(),
            };
            self.store.put_branch(&branch)?;
            branch
        };
        tracing::info!(branch_id = %branch.branch_id, from = %from, head = %branch.head, "branch forked");
        if opts.switch {
            self.switch_branch(&branch.branch_id)?;
        }
        Ok(branch)
    }

    /// Fails with `StaleEpoch`/`StaleBase` unless `branch_id` is still at
    /// `epoch` with `base_world` as its head.
    pub fn ensure_fresh(&self, branch_id: &str, epoch: u64, base_world: &str) -> Result<Branch, WorldlineError> {
        let branch = self.store.get_branch(branch_id)?;
        check_fresh(&branch, epoch, base_world)?;
        Ok(branch)
    }

    /// Persist a world through `persist` and move the head onto it, as one
    /// step under the branch lock. Nothing is persisted if the branch has
    /// moved since `base_world`/`epoch` were read.
    pub fn commit<F>(
        &self,
        branch_id: &str,
        epoch: u64,
        base_world: &str,
        world_id: &str,
        persist: F,
    ) -> Result<Branch, WorldlineError>
    where
        F: FnOnce() -> Result<(), WorldlineError>,
    {
        let _guard = self.lock()?;
        let mut branch = self.store.get_branch(branch_id)?;
        check_fresh(&branch, epoch, base_world)?;
        persist()?;
        branch.head = world_id.to_string();
        self.store.put_branch(&branch)?;
        tracing::debug!(branch_id, head = %world_id, "branch head advanced");
        Ok(branch)
    }

    /// Move `branch_id` forward to an already stored `world_id`.
    pub fn advance(&self, branch_id: &str, world_id: &str, epoch: u64) -> Result<Branch, WorldlineError> {
        let world = self.store.get_world(world_id)?;
        let Some(parent) = world.parent else {
            return Err(WorldlineError::ValidationError(format!(
                "genesis world {} cannot extend a branch",
                world_id
            )));
        };
        self.commit(branch_id, epoch, &parent, world_id, || Ok(()))
    }

    /// Move the head back to an ancestor and start a new epoch.
    pub fn reset(&self, branch_id: &str, world_id: &str) -> Result<Branch, WorldlineError> {
        let _guard = self.lock()?;
        let mut branch = self.store.get_branch(branch_id)?;
        self.require_ancestor(&branch.head, world_id)?;
        branch.head = world_id.to_string();
        branch.epoch += 1;
        self.store.put_branch(&branch)?;
        tracing::info!(branch_id = %branch_id, head = %world_id, epoch = branch.epoch, "branch reset");
        Ok(branch)
    }

    fn require_ancestor(&self, head: &str, world_id: &str) -> Result<(), WorldlineError> {
        let lineage = self.store.lineage(head)?;
        if lineage.iter().any(|w| w.world_id == world_id) {
            Ok(())
        } else {
            Err(WorldlineError::ValidationError(format!(
                "world {} is not an ancestor of {}",
                world_id, head
            )))
        }
    }
}

fn check_fresh(branch: &Branch, epoch: u64, base_world: &str) -> Result<(), WorldlineError> {
    if branch.epoch != epoch {
        return Err(WorldlineError::StaleEpoch {
            branch_id: branch.branch_id.clone(),
            expected: epoch,
            actual: branch.epoch,
        });
    }
    if branch.head != base_world {
        return Err(WorldlineError::StaleBase {
            branch_id: branch.branch_id.clone(),
            base: base_world.to_string(),
            head: branch.head.clone(),
        });
    }
    Ok(())
}
