//! SQLite-backed `WorldStore`.
//!
//! A world, its delta, and its (optional) cached snapshot are written in one
//! transaction, so readers never see a world without its delta.

use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::WorldlineError;
use crate::core::proposal::{ActorKind, ActorRef, Proposal, ProposalStatus};
use crate::core::snapshot::Snapshot;
use crate::core::store::{self, StoreKind, WorldStore};
use crate::core::time;
use crate::core::world::{Branch, World, WorldDelta, WorldOutcome};
use rusqlite::{OptionalExtension, Row, params};
use std::path::{Path, PathBuf};

pub struct SqliteWorldStore {
    root: PathBuf,
    db_path: PathBuf,
    broker: DbBroker,
    snapshot_interval: u64,
}

impl SqliteWorldStore {
    /// Open (creating if needed) the store rooted at `root`.
    pub fn open(root: &Path, snapshot_interval: u64) -> Result<Self, WorldlineError> {
        db::initialize_world_db(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            db_path: db::world_db_path(root),
            broker: DbBroker::new(root),
            snapshot_interval,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn with_conn<F, R>(&self, op: &str, intent_ref: Option<&str>, f: F) -> Result<R, WorldlineError>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R, WorldlineError>,
    {
        self.broker
            .with_conn(&self.db_path, "worldline", intent_ref, op, f)
    }
}

fn world_from_row(row: &Row<'_>) -> rusqlite::Result<World> {
    let outcome: String = row.get(6)?;
    Ok(World {
        world_id: row.get(0)?,
        schema_hash: row.get(1)?,
        snapshot_hash: row.get(2)?,
        created_at: row.get::<_, i64>(3)? as u64,
        created_by: row.get(4)?,
        parent: row.get(5)?,
        outcome: WorldOutcome::parse(&outcome).unwrap_or(WorldOutcome::Failed),
    })
}

fn branch_from_row(row: &Row<'_>) -> rusqlite::Result<Branch> {
    Ok(Branch {
        branch_id: row.get(0)?,
        name: row.get(1)?,
        head: row.get(2)?,
        schema_hash: row.get(3)?,
        epoch: row.get::<_, i64>(4)? as u64,
        parent_branch: row.get(5)?,
        forked_from: row.get(6)?,
        created_at: row.get::<_, i64>(7)? as u64,
    })
}

fn kind_str(kind: ActorKind) -> &'static str {
    match kind {
        ActorKind::Agent => "agent",
        ActorKind::Human => "human",
        ActorKind::System => "system",
    }
}

fn parse_kind(raw: &str) -> ActorKind {
    match raw {
        "human" => ActorKind::Human,
        "system" => ActorKind::System,
        _ => ActorKind::Agent,
    }
}

const WORLD_COLUMNS: &str =
    "world_id, schema_hash, snapshot_hash, created_at, created_by, parent, outcome";
const BRANCH_COLUMNS: &str =
    "branch_id, name, head, schema_hash, epoch, parent_branch, forked_from, created_at";

impl WorldStore for SqliteWorldStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Sqlite
    }

    fn store(&self, world: &World, delta: &WorldDelta, snapshot: &Snapshot) -> Result<(), WorldlineError> {
        store::validate_store_input(world, delta, snapshot)?;
        let patches = serde_json::to_string(&delta.patches)?;
        let body = if store::should_cache(world, snapshot, self.snapshot_interval) {
            Some(serde_json::to_string(snapshot)?)
        } else {
            None
        };

        self.with_conn("world.store", world.created_by.as_deref(), |conn| {
            let tx = conn.transaction()?;
            let exists: Option<String> = tx
                .query_row(
                    "SELECT world_id FROM worlds WHERE world_id = ?1",
                    params![world.world_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(WorldlineError::WorldAlreadyExists(world.world_id.clone()));
            }
            if let Some(parent) = &world.parent {
                let parent_exists: Option<String> = tx
                    .query_row(
                        "SELECT world_id FROM worlds WHERE world_id = ?1",
                        params![parent],
                        |row| row.get(0),
                    )
                    .optional()?;
                if parent_exists.is_none() {
                    return Err(WorldlineError::WorldNotFound(parent.clone()));
                }
            }
            tx.execute(
                "INSERT INTO worlds(world_id, schema_hash, snapshot_hash, created_at, created_by, parent, outcome) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    world.world_id,
                    world.schema_hash,
                    world.snapshot_hash,
                    world.created_at as i64,
                    world.created_by,
                    world.parent,
                    world.outcome.as_str()
                ],
            )?;
            tx.execute(
                "INSERT INTO world_deltas(to_world, from_world, patches, created_at) VALUES(?1, ?2, ?3, ?4)",
                params![delta.to_world, delta.from_world, patches, delta.created_at as i64],
            )?;
            if let Some(body) = &body {
                tx.execute(
                    "INSERT INTO snapshots(world_id, body) VALUES(?1, ?2)",
                    params![world.world_id, body],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn get_world(&self, world_id: &str) -> Result<World, WorldlineError> {
        self.with_conn("world.get", None, |conn| {
            conn.query_row(
                &format!("SELECT {} FROM worlds WHERE world_id = ?1", WORLD_COLUMNS),
                params![world_id],
                world_from_row,
            )
            .optional()?
            .ok_or_else(|| WorldlineError::WorldNotFound(world_id.to_string()))
        })
    }

    fn get_delta(&self, to_world: &str) -> Result<WorldDelta, WorldlineError> {
        let row = self.with_conn("delta.get", None, |conn| {
            Ok(conn
                .query_row(
                    "SELECT from_world, to_world, patches, created_at FROM world_deltas WHERE to_world = ?1",
                    params![to_world],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()?)
        })?;
        let Some((from_world, to_world, patches, created_at)) = row else {
            return Err(WorldlineError::NotFound(format!("delta into world {}", to_world)));
        };
        Ok(WorldDelta {
            from_world,
            to_world,
            patches: serde_json::from_str(&patches)?,
            created_at: created_at as u64,
        })
    }

    fn cached_snapshot(&self, world_id: &str) -> Result<Option<Snapshot>, WorldlineError> {
        let body: Option<String> = self.with_conn("snapshot.get", None, |conn| {
            Ok(conn
                .query_row(
                    "SELECT body FROM snapshots WHERE world_id = ?1",
                    params![world_id],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        match body {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn list_worlds(&self) -> Result<Vec<World>, WorldlineError> {
        self.with_conn("world.list", None, |conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {} FROM worlds ORDER BY seq", WORLD_COLUMNS))?;
            let rows = stmt.query_map([], world_from_row)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
    }

    fn put_branch(&self, branch: &Branch) -> Result<(), WorldlineError> {
        self.with_conn("branch.put", None, |conn| {
            conn.execute(
                "INSERT INTO branches(branch_id, name, head, schema_hash, epoch, parent_branch, forked_from, created_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(branch_id) DO UPDATE SET
                    name = excluded.name,
                    head = excluded.head,
                    schema_hash = excluded.schema_hash,
                    epoch = excluded.epoch",
                params![
                    branch.branch_id,
                    branch.name,
                    branch.head,
                    branch.schema_hash,
                    branch.epoch as i64,
                    branch.parent_branch,
                    branch.forked_from,
                    branch.created_at as i64
                ],
            )?;
            Ok(())
        })
    }

    fn get_branch(&self, branch_id: &str) -> Result<Branch, WorldlineError> {
        self.with_conn("branch.get", None, |conn| {
            conn.query_row(
                &format!("SELECT {} FROM branches WHERE branch_id = ?1", BRANCH_COLUMNS),
                params![branch_id],
                branch_from_row,
            )
            .optional()?
            .ok_or_else(|| WorldlineError::BranchNotFound(branch_id.to_string()))
        })
    }

    fn list_branches(&self) -> Result<Vec<Branch>, WorldlineError> {
        self.with_conn("branch.list", None, |conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {} FROM branches ORDER BY seq", BRANCH_COLUMNS))?;
            let rows = stmt.query_map([], branch_from_row)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
    }

    fn put_proposal(&self, proposal: &Proposal) -> Result<(), WorldlineError> {
        let body = serde_json::to_string(proposal)?;
        self.with_conn("proposal.put", Some(&proposal.intent.intent_id), |conn| {
            conn.execute(
                "INSERT INTO proposals(proposal_id, status, execution_key, branch_id, body, updated_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(proposal_id) DO UPDATE SET
                    status = excluded.status,
                    execution_key = excluded.execution_key,
                    body = excluded.body,
                    updated_at = excluded.updated_at",
                params![
                    proposal.proposal_id,
                    proposal.status.as_str(),
                    proposal.execution_key,
                    proposal.branch_id,
                    body,
                    time::now_millis() as i64
                ],
            )?;
            Ok(())
        })
    }

    fn get_proposal(&self, proposal_id: &str) -> Result<Proposal, WorldlineError> {
        let body: Option<String> = self.with_conn("proposal.get", None, |conn| {
            Ok(conn
                .query_row(
                    "SELECT body FROM proposals WHERE proposal_id = ?1",
                    params![proposal_id],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        let body = body.ok_or_else(|| WorldlineError::ProposalNotFound(proposal_id.to_string()))?;
        Ok(serde_json::from_str(&body)?)
    }

    fn find_completed(&self, execution_key: &str) -> Result<Option<Proposal>, WorldlineError> {
        let body: Option<String> = self.with_conn("proposal.find", None, |conn| {
            Ok(conn
                .query_row(
                    "SELECT body FROM proposals WHERE execution_key = ?1 AND status = ?2 LIMIT 1",
                    params![execution_key, ProposalStatus::Completed.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        match body {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn put_actor(&self, actor: &ActorRef) -> Result<(), WorldlineError> {
        self.with_conn("actor.put", None, |conn| {
            conn.execute(
                "INSERT INTO actors(actor_id, kind, name, registered_at) VALUES(?1, ?2, ?3, ?4)
                 ON CONFLICT(actor_id) DO UPDATE SET kind = excluded.kind, name = excluded.name",
                params![
                    actor.actor_id,
                    kind_str(actor.kind),
                    actor.name,
                    time::now_millis() as i64
                ],
            )?;
            Ok(())
        })
    }

    fn get_actor(&self, actor_id: &str) -> Result<Option<ActorRef>, WorldlineError> {
        self.with_conn("actor.get", None, |conn| {
            Ok(conn
                .query_row(
                    "SELECT actor_id, kind, name FROM actors WHERE actor_id = ?1",
                    params![actor_id],
                    |row| {
                        let kind: String = row.get(1)?;
                        Ok(ActorRef {
                            actor_id: row.get(0)?,
                            kind: parse_kind(&kind),
                            name: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
    }
}
