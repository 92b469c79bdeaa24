//! CLI struct definitions for the `worldline` binary.
//!
//! All clap-derived types live here. Dispatch lives in `lib.rs`.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "worldline",
    version = env!("CARGO_PKG_VERSION"),
    about = "Proposal-driven state runtime with branchable, content-addressed history."
)]
pub(crate) struct Cli {
    /// Output format.
    #[clap(long, global = true, value_enum, default_value = "text")]
    pub format: OutputFormat,
    /// Project directory (defaults to the nearest parent holding `.worldline/`).
    #[clap(long, global = true)]
    pub dir: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create `.worldline/` with a config, a starter schema, and the genesis world.
    Init {
        /// Overwrite an existing config and schema.
        #[clap(long)]
        force: bool,
    },
    /// Run one action and print its outcome.
    Act(ActCli),
    /// Inspect stored worlds.
    World(WorldCli),
    /// Inspect materialized snapshots.
    Snapshot(SnapshotCli),
    /// Print the head world of the current branch.
    Head,
    /// Walk the lineage of a world back to genesis.
    Log {
        /// Start world; defaults to the current head.
        world_id: Option<String>,
        /// Stop after this many worlds.
        #[clap(long, short = 'n')]
        limit: Option<usize>,
    },
    /// Branch operations.
    Branch(BranchCli),
    /// Inspect recorded proposals.
    Proposal(ProposalCli),
    /// Schema information.
    Schema(SchemaCli),
    /// Print the store's audit log.
    Audit {
        /// Show only the last N events.
        #[clap(long, short = 'n')]
        limit: Option<usize>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct ActCli {
    /// Action type, e.g. `createTask` or `system.branch.fork`.
    pub action_type: String,
    /// JSON input.
    #[clap(long, short = 'i', default_value = "{}")]
    pub input: String,
    #[clap(long)]
    pub actor: Option<String>,
    #[clap(long)]
    pub branch: Option<String>,
    /// Idempotency key; reuse it to retry safely.
    #[clap(long)]
    pub key: Option<String>,
    /// Per-action execution timeout in milliseconds.
    #[clap(long)]
    pub timeout_ms: Option<u64>,
}

#[derive(clap::Args, Debug)]
pub(crate) struct WorldCli {
    #[clap(subcommand)]
    pub command: WorldCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum WorldCommand {
    /// Show one world and its incoming delta.
    Show { world_id: String },
    /// List every stored world.
    List,
}

#[derive(clap::Args, Debug)]
pub(crate) struct SnapshotCli {
    #[clap(subcommand)]
    pub command: SnapshotCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum SnapshotCommand {
    /// Show the snapshot at a world (defaults to the current head).
    Show {
        world_id: Option<String>,
        /// Dotted path to select, e.g. `data.tasks` or `system.lastError`.
        #[clap(long)]
        select: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct BranchCli {
    #[clap(subcommand)]
    pub command: BranchCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum BranchCommand {
    List,
    /// Fork a new branch.
    Fork {
        #[clap(long)]
        name: Option<String>,
        /// Source branch; defaults to the current branch.
        #[clap(long)]
        from: Option<String>,
        /// Fork at an ancestor of the source head.
        #[clap(long)]
        at: Option<String>,
        /// Make the new branch current.
        #[clap(long)]
        switch: bool,
    },
    Switch { branch_id: String },
    /// Move a branch head back to an ancestor world.
    Reset {
        world_id: String,
        /// Defaults to the current branch.
        #[clap(long)]
        branch: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct ProposalCli {
    #[clap(subcommand)]
    pub command: ProposalCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum ProposalCommand {
    Show { proposal_id: String },
}

#[derive(clap::Args, Debug)]
pub(crate) struct SchemaCli {
    #[clap(subcommand)]
    pub command: SchemaCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum SchemaCommand {
    /// Print the schema hash that world ids are bound to.
    Hash,
    /// List declared actions and the builtin effect kinds.
    Show,
}
