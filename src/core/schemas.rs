//! Database schema definitions for the SQLite world store.
//!
//! One database file (`worlds.db`) holds the history graph and everything that
//! points into it:
//! 1. worlds + world_deltas + snapshots: the content-addressed history.
//! 2. branches: mutable head pointers.
//! 3. proposals + actors: the audit trail of who asked for what.

pub const WORLD_DB_NAME: &str = "worlds.db";
pub const STORE_AUDIT_LOG_NAME: &str = "store.events.jsonl";

pub const WORLD_DB_SCHEMA_WORLDS: &str = "
    CREATE TABLE IF NOT EXISTS worlds (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        world_id TEXT NOT NULL UNIQUE,
        schema_hash TEXT NOT NULL,
        snapshot_hash TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        created_by TEXT,
        parent TEXT,
        outcome TEXT NOT NULL,
        FOREIGN KEY(parent) REFERENCES worlds(world_id)
    )
";

pub const WORLD_DB_SCHEMA_DELTAS: &str = "
    CREATE TABLE IF NOT EXISTS world_deltas (
        to_world TEXT PRIMARY KEY,
        from_world TEXT NOT NULL,
        patches TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        FOREIGN KEY(to_world) REFERENCES worlds(world_id)
    )
";

pub const WORLD_DB_SCHEMA_SNAPSHOTS: &str = "
    CREATE TABLE IF NOT EXISTS snapshots (
        world_id TEXT PRIMARY KEY,
        body TEXT NOT NULL,
        FOREIGN KEY(world_id) REFERENCES worlds(world_id)
    )
";

pub const WORLD_DB_SCHEMA_BRANCHES: &str = "
    CREATE TABLE IF NOT EXISTS branches (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        branch_id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        head TEXT NOT NULL,
        schema_hash TEXT NOT NULL,
        epoch INTEGER NOT NULL,
        parent_branch TEXT,
        forked_from TEXT,
        created_at INTEGER NOT NULL,
        FOREIGN KEY(head) REFERENCES worlds(world_id)
    )
";

pub const WORLD_DB_SCHEMA_PROPOSALS: &str = "
    CREATE TABLE IF NOT EXISTS proposals (
        proposal_id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        execution_key TEXT,
        branch_id TEXT NOT NULL,
        body TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )
";
pub const WORLD_DB_SCHEMA_PROPOSALS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_proposals_execution_key ON proposals(execution_key, status)";

pub const WORLD_DB_SCHEMA_ACTORS: &str = "
    CREATE TABLE IF NOT EXISTS actors (
        actor_id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        name TEXT,
        registered_at INTEGER NOT NULL
    )
";

/// Every statement needed to bring an empty database up to the current shape.
pub const WORLD_DB_SCHEMA: &[&str] = &[
    WORLD_DB_SCHEMA_WORLDS,
    WORLD_DB_SCHEMA_DELTAS,
    WORLD_DB_SCHEMA_SNAPSHOTS,
    WORLD_DB_SCHEMA_BRANCHES,
    WORLD_DB_SCHEMA_PROPOSALS,
    WORLD_DB_SCHEMA_PROPOSALS_INDEX,
    WORLD_DB_SCHEMA_ACTORS,
];
