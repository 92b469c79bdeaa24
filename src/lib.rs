//! Worldline: a proposal-driven state runtime.
//!
//! Agents and humans do not mutate state. They propose intents; a policy
//! approves or rejects each proposal; an approved proposal runs its effect
//! against an immutable snapshot; and the outcome, success or failure,
//! lands in a content-addressed history of Worlds.
//!
//! # Architecture
//!
//! - **Worlds** are immutable nodes identified by a hash of schema, snapshot
//!   content, parent, and producing proposal. Deltas are the edges.
//! - **Branches** are the only mutable pointers. A head moves forward only on
//!   a completed outcome; a reset moves it back and bumps the epoch.
//! - **Two lanes**: domain actions run one at a time on the domain lane;
//!   `system.*` actions run on a separate lane so administrative work never
//!   waits behind (or deadlocks with) domain work.
//! - **Stores**: an in-memory store and a SQLite store with the same trait.
//!   SQLite writes go through `DbBroker`, which serializes access and appends
//!   every operation to `store.events.jsonl`.
//!
//! # Embedding
//!
//! ```no_run
//! use worldline::{ActOptions, ActionSpec, DomainSchema, EffectBinding, Runtime};
//! use serde_json::json;
//!
//! let mut schema = DomainSchema::new("tasks", "1");
//! schema.declare(
//!     ActionSpec::new("createTask", EffectBinding::Append { path: "tasks".into(), assign_id: true })
//!         .require(&["title"]),
//! );
//! schema.count("taskCount", "tasks");
//!
//! let runtime = Runtime::builder(schema).build()?;
//! let outcome = runtime
//!     .act("createTask", json!({"title": "write docs"}), ActOptions::default())?
//!     .result();
//! assert!(outcome.is_completed());
//! # Ok::<(), worldline::WorldlineError>(())
//! ```
//!
//! # CLI
//!
//! ```bash
//! worldline init
//! worldline act createTask --input '{"title":"write docs"}'
//! worldline snapshot show --select data.tasks
//! worldline branch fork --name experiment --switch
//! worldline log
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: history primitives, stores, host executor, queue, runtime
//! - [`plugins`]: approval policies and standard effect handlers

pub mod core;
pub mod plugins;

mod cli;

pub use crate::core::error::WorldlineError;
pub use crate::core::handle::{ActionHandle, ActionOutcome, ActionPhase};
pub use crate::core::host::{EffectBinding, EffectContext, EffectError, EffectRegistry, PatchBuilder};
pub use crate::core::orchestrator::{ActOptions, RecallProvider, Runtime, RuntimeBuilder, SubmitResult};
pub use crate::core::schema::{ActionSpec, DomainSchema};

use crate::core::config::{self, StoreBackend, WorldlineConfig};
use crate::core::{broker, system, telemetry, time};
use crate::plugins::effects;
use crate::plugins::policy::{Decision, DecisionBoard, RulePolicy};
use cli::{
    ActCli, BranchCommand, Cli, Command, OutputFormat, ProposalCommand, SchemaCommand,
    SnapshotCommand, WorldCommand,
};

use clap::Parser;
use colored::Colorize;
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

pub const SCHEMA_FILE_NAME: &str = "schema.toml";
pub const POLICY_FILE_NAME: &str = "policy.toml";
pub const HEAD_FILE_NAME: &str = "HEAD";

const STARTER_SCHEMA: &str = r#"schema_id = "tasks"
version = "1"

[initial]
tasks = []
counters = {}

[[actions]]
action_type = "createTask"
required = ["title"]
effect = { kind = "append", path = "tasks", assign_id = true }

[[actions]]
action_type = "removeTask"
required = ["id"]
effect = { kind = "remove", path = "tasks" }

[[actions]]
action_type = "restoreTask"
required = ["id"]
effect = { kind = "restore", path = "tasks" }

[[actions]]
action_type = "setFocus"
required = ["focus"]
effect = { kind = "set", path = "focus", field = "focus" }

[[actions]]
action_type = "bump"
required = ["path"]
effect = { kind = "custom", effect = "counter.increment" }

[[computed]]
name = "taskCount"
count = "tasks"
"#;

fn find_project_root(start_dir: &Path) -> Result<PathBuf, WorldlineError> {
    let mut current_dir = PathBuf::from(start_dir);
    loop {
        if current_dir.join(config::STATE_DIR_NAME).exists() {
            return Ok(current_dir);
        }
        if !current_dir.pop() {
            return Err(WorldlineError::NotFound(
                "'.worldline' directory not found in current or parent directories. Run `worldline init` first.".to_string(),
            ));
        }
    }
}

struct Project {
    root: PathBuf,
    config: WorldlineConfig,
    runtime: Runtime,
    board: Arc<DecisionBoard>,
}

impl Project {
    fn state_dir(&self) -> PathBuf {
        self.root.join(config::STATE_DIR_NAME)
    }

    fn open(root: &Path, config: WorldlineConfig) -> Result<Self, WorldlineError> {
        let state_dir = root.join(config::STATE_DIR_NAME);
        let schema = DomainSchema::load(&state_dir.join(SCHEMA_FILE_NAME))?;
        let policy = Arc::new(RulePolicy::load(&state_dir.join(POLICY_FILE_NAME))?);
        let board = policy.board();
        let runtime = Runtime::builder(schema)
            .store(config.open_store(root)?)
            .policy(policy)
            .effects(effects::standard_registry()?)
            .config(config.runtime.clone())
            .build()?;

        if let Some(branch_id) = read_head(&state_dir)
            && branch_id != runtime.current_branch()?.branch_id
            && let Err(e) = runtime.switch_branch(&branch_id)
        {
            tracing::warn!(branch_id, error = %e, "HEAD names an unknown branch; staying on main");
        }
        Ok(Self {
            root: root.to_path_buf(),
            config,
            runtime,
            board,
        })
    }

    fn save_head(&self) -> Result<(), WorldlineError> {
        let branch = self.runtime.current_branch()?;
        fs::write(self.state_dir().join(HEAD_FILE_NAME), format!("{}\n", branch.branch_id))?;
        Ok(())
    }

    fn system_action(&self, name: &str) -> String {
        format!("{}{}", self.config.runtime.system_prefix, name)
    }
}

fn read_head(state_dir: &Path) -> Option<String> {
    let raw = fs::read_to_string(state_dir.join(HEAD_FILE_NAME)).ok()?;
    let id = raw.trim();
    (!id.is_empty()).then(|| id.to_string())
}

fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

fn print_json(value: &Value) -> Result<(), WorldlineError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print `value` inside a command envelope, or run `text` for text output.
fn emit<F>(format: OutputFormat, cmd: &str, value: Value, text: F) -> Result<(), WorldlineError>
where
    F: FnOnce(),
{
    match format {
        OutputFormat::Json => print_json(&time::command_envelope(cmd, "ok", value)),
        OutputFormat::Text => {
            text();
            Ok(())
        }
    }
}

/// Wait for an action to settle. A one-shot process has no reviewer, so a
/// proposal parked for review is rejected instead of waiting forever.
fn await_outcome(handle: &ActionHandle, board: &DecisionBoard) -> ActionOutcome {
    loop {
        if let Some(outcome) = handle.result_timeout(Duration::from_millis(50)) {
            return outcome;
        }
        if handle.phase() == ActionPhase::Pending {
            let decision = Decision::reject("cli", "review required and no reviewer is attached");
            if let Err(e) = board.decide(handle.proposal_id(), decision) {
                tracing::debug!(error = %e, "review decision not delivered");
            }
        }
    }
}

fn print_outcome(outcome: &ActionOutcome) {
    match outcome {
        ActionOutcome::Completed { world_id, detail } => {
            println!("{} completed  world {}", "✓".bright_green().bold(), world_id.bright_white());
            if let Some(detail) = detail {
                println!("  {}", detail);
            }
        }
        ActionOutcome::Failed { world_id, error } => {
            println!(
                "{} failed  [{}] {}",
                "✗".bright_red().bold(),
                error.code.bright_red(),
                error.message
            );
            if let Some(world_id) = world_id {
                println!("  recorded as world {}", world_id.bright_white());
            }
        }
        ActionOutcome::Rejected { reason } => {
            println!("{} rejected  {}", "▸".bright_yellow().bold(), reason);
        }
        ActionOutcome::PreparationFailed { error } => {
            println!(
                "{} not submitted  [{}] {}",
                "✗".bright_red().bold(),
                error.code.bright_red(),
                error.message
            );
        }
    }
}

fn run_action(
    project: &Project,
    format: OutputFormat,
    action_type: &str,
    input: Value,
    opts: ActOptions,
) -> Result<ExitCode, WorldlineError> {
    let handle = project.runtime.act(action_type, input, opts)?;
    let outcome = await_outcome(&handle, &project.board);
    project.save_head()?;
    let value = json!({
        "proposal_id": handle.proposal_id(),
        "action_type": action_type,
        "result": serde_json::to_value(&outcome)?,
    });
    emit(format, "act", value, || print_outcome(&outcome))?;
    Ok(if outcome.is_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn cmd_init(dir: &Path, force: bool, format: OutputFormat) -> Result<ExitCode, WorldlineError> {
    fs::create_dir_all(dir)?;
    let root = fs::canonicalize(dir)?;
    let state_dir = root.join(config::STATE_DIR_NAME);
    let config_path = state_dir.join(config::CONFIG_FILE_NAME);
    if state_dir.exists() && !force {
        if format == OutputFormat::Text {
            println!("  {} Detected existing {}", "▸".bright_yellow(), state_dir.display());
            println!("  {} Use {} to overwrite config and schema", "▸".bright_yellow(), "--force".bright_cyan().bold());
        }
        return Ok(ExitCode::SUCCESS);
    }
    fs::create_dir_all(&state_dir)?;

    let mut cfg = WorldlineConfig::default();
    cfg.store.backend = StoreBackend::Sqlite;
    fs::write(&config_path, cfg.to_toml_string()?)?;
    fs::write(state_dir.join(SCHEMA_FILE_NAME), STARTER_SCHEMA)?;

    let project = Project::open(&root, cfg)?;
    project.save_head()?;
    let head = project.runtime.get_current_head()?;
    let value = json!({
        "root": root.display().to_string(),
        "schema_hash": project.runtime.schema_hash(),
        "genesis": head,
    });
    emit(format, "init", value, || {
        println!("{} initialized {}", "✓".bright_green().bold(), state_dir.display());
        println!("  schema  {}", project.runtime.schema_hash().bright_white());
        println!("  genesis {}", head.bright_white());
    })?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_act(project: &Project, cli: ActCli, format: OutputFormat) -> Result<ExitCode, WorldlineError> {
    let input: Value = serde_json::from_str(&cli.input)
        .map_err(|e| WorldlineError::ValidationError(format!("--input is not valid JSON: {}", e)))?;
    let opts = ActOptions {
        actor_id: cli.actor,
        branch_id: cli.branch,
        intent_key: cli.key,
        timeout: cli.timeout_ms.map(Duration::from_millis),
        ..ActOptions::default()
    };
    run_action(project, format, &cli.action_type, input, opts)
}

fn cmd_branch(project: &Project, command: BranchCommand, format: OutputFormat) -> Result<ExitCode, WorldlineError> {
    let (name, input) = match command {
        BranchCommand::List => {
            let current = project.runtime.current_branch()?.branch_id;
            let branches = project.runtime.list_branches()?;
            let value = json!({ "current": current, "branches": branches });
            emit(format, "branch.list", value, || {
                for b in &branches {
                    let marker = if b.branch_id == current { "*".bright_green().bold() } else { " ".normal() };
                    println!(
                        "{} {:<24} head {}  epoch {}",
                        marker,
                        b.name,
                        short(&b.head).bright_white(),
                        b.epoch
                    );
                }
            })?;
            return Ok(ExitCode::SUCCESS);
        }
        BranchCommand::Fork { name, from, at, switch } => (
            system::BRANCH_FORK,
            json!({ "name": name, "from": from, "atWorld": at, "switch": switch }),
        ),
        BranchCommand::Switch { branch_id } => (system::BRANCH_SWITCH, json!({ "branchId": branch_id })),
        BranchCommand::Reset { world_id, branch } => (
            system::BRANCH_RESET,
            json!({ "branchId": branch, "worldId": world_id }),
        ),
    };
    run_action(project, format, &project.system_action(name), input, ActOptions::default())
}

fn cmd_snapshot(project: &Project, command: SnapshotCommand, format: OutputFormat) -> Result<ExitCode, WorldlineError> {
    let SnapshotCommand::Show { world_id, select } = command;
    let world_id = match world_id {
        Some(id) => id,
        None => project.runtime.get_current_head()?,
    };
    let snapshot = project.runtime.get_snapshot(&world_id)?;
    let value = match &select {
        Some(path) => snapshot
            .select(path)
            .ok_or_else(|| WorldlineError::NotFound(format!("path '{}' in world {}", path, world_id)))?,
        None => serde_json::to_value(&snapshot)?,
    };
    match format {
        OutputFormat::Json => print_json(&time::command_envelope(
            "snapshot.show",
            "ok",
            json!({ "world_id": world_id, "select": select, "value": value }),
        ))?,
        OutputFormat::Text => print_json(&value)?,
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_log(project: &Project, world_id: Option<String>, limit: Option<usize>, format: OutputFormat) -> Result<ExitCode, WorldlineError> {
    let start = match world_id {
        Some(id) => id,
        None => project.runtime.get_current_head()?,
    };
    let mut worlds = project.runtime.lineage(&start)?;
    if let Some(limit) = limit {
        worlds.truncate(limit);
    }
    emit(format, "log", json!({ "worlds": worlds }), || {
        for w in &worlds {
            let outcome = match w.outcome.as_str() {
                "failed" => w.outcome.as_str().bright_red(),
                "genesis" => w.outcome.as_str().bright_cyan(),
                other => other.bright_green(),
            };
            println!(
                "{}  {:<9} {}",
                short(&w.world_id).bright_white(),
                outcome,
                w.created_by.as_deref().unwrap_or("-")
            );
        }
    })?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_audit(project: &Project, limit: Option<usize>, format: OutputFormat) -> Result<ExitCode, WorldlineError> {
    let mut events = match project.config.store.backend {
        StoreBackend::Sqlite => broker::read_audit_log(&project.config.store_root(&project.root))?,
        StoreBackend::Memory => Vec::new(),
    };
    if let Some(limit) = limit {
        let skip = events.len().saturating_sub(limit);
        events.drain(..skip);
    }
    emit(format, "audit", json!({ "events": events }), || {
        for ev in &events {
            let status = if ev.status == "success" { ev.status.bright_green() } else { ev.status.bright_red() };
            println!("{}  {:<18} {}  {}", ev.ts, ev.op, status, ev.intent_ref.as_deref().unwrap_or("-"));
        }
    })?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_head(project: &Project, format: OutputFormat) -> Result<ExitCode, WorldlineError> {
    let branch = project.runtime.current_branch()?;
    let value = json!({ "branch": branch.branch_id, "head": branch.head, "epoch": branch.epoch });
    emit(format, "head", value, || println!("{}", branch.head))?;
    Ok(ExitCode::SUCCESS)
}

fn cmd_world(project: &Project, command: WorldCommand, format: OutputFormat) -> Result<ExitCode, WorldlineError> {
    let runtime = &project.runtime;
    match command {
        WorldCommand::Show { world_id } => {
            let world = runtime.get_world(&world_id)?;
            let delta = runtime.store().get_delta(&world_id)?;
            let value = json!({ "world": world, "delta": delta });
            match format {
                OutputFormat::Json => print_json(&time::command_envelope("world.show", "ok", value))?,
                OutputFormat::Text => print_json(&value)?,
            }
        }
        WorldCommand::List => {
            let worlds = runtime.store().list_worlds()?;
            emit(format, "world.list", json!({ "worlds": worlds }), || {
                for w in &worlds {
                    println!("{}  {}", w.world_id, w.outcome.as_str());
                }
            })?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_proposal(project: &Project, command: ProposalCommand, format: OutputFormat) -> Result<ExitCode, WorldlineError> {
    let ProposalCommand::Show { proposal_id } = command;
    let proposal = serde_json::to_value(project.runtime.get_proposal(&proposal_id)?)?;
    match format {
        OutputFormat::Json => print_json(&time::command_envelope(
            "proposal.show",
            "ok",
            json!({ "proposal": proposal }),
        ))?,
        OutputFormat::Text => print_json(&proposal)?,
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_schema(project: &Project, command: SchemaCommand, format: OutputFormat) -> Result<ExitCode, WorldlineError> {
    let runtime = &project.runtime;
    let schema = runtime.schema();
    match command {
        SchemaCommand::Hash => {
            let hash = runtime.schema_hash();
            emit(format, "schema.hash", json!({ "schema_hash": hash }), || println!("{}", hash))?;
        }
        SchemaCommand::Show => {
            let actions: Vec<&ActionSpec> = schema.actions().collect();
            let value = json!({
                "schema_id": schema.schema_id(),
                "version": schema.version(),
                "schema_hash": runtime.schema_hash(),
                "actions": actions,
                "system_actions": system::ALL
                    .iter()
                    .map(|name| project.system_action(name))
                    .collect::<Vec<_>>(),
                "builtin_effects": effects::describe_builtins(),
            });
            emit(format, "schema.show", value, || {
                println!(
                    "{} v{}  {}",
                    schema.schema_id().bright_white().bold(),
                    schema.version(),
                    short(runtime.schema_hash())
                );
                for a in &actions {
                    let required = if a.required.is_empty() {
                        String::new()
                    } else {
                        format!("  requires {}", a.required.join(", "))
                    };
                    println!("  {}{}", a.action_type.bright_cyan(), required);
                }
            })?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn open_project(dir: Option<PathBuf>, current_dir: &Path) -> Result<Project, WorldlineError> {
    let root = match dir {
        Some(dir) => dir,
        None => find_project_root(current_dir)?,
    };
    let cfg = config::load_config(&root)?;
    telemetry::init(&cfg.log.filter);
    Project::open(&root, cfg)
}

pub fn run() -> Result<ExitCode, WorldlineError> {
    let cli = Cli::parse();
    let current_dir = std::env::current_dir()?;
    let format = cli.format;
    let dir = cli.dir;

    match cli.command {
        Command::Init { force } => {
            telemetry::init("warn");
            cmd_init(&dir.unwrap_or(current_dir), force, format)
        }
        Command::Act(act) => cmd_act(&open_project(dir, &current_dir)?, act, format),
        Command::Branch(branch) => cmd_branch(&open_project(dir, &current_dir)?, branch.command, format),
        Command::Snapshot(snapshot) => cmd_snapshot(&open_project(dir, &current_dir)?, snapshot.command, format),
        Command::Log { world_id, limit } => cmd_log(&open_project(dir, &current_dir)?, world_id, limit, format),
        Command::Audit { limit } => cmd_audit(&open_project(dir, &current_dir)?, limit, format),
        Command::Head => cmd_head(&open_project(dir, &current_dir)?, format),
        Command::World(world) => cmd_world(&open_project(dir, &current_dir)?, world.command, format),
        Command::Proposal(proposal) => cmd_proposal(&open_project(dir, &current_dir)?, proposal.command, format),
        Command::Schema(schema) => cmd_schema(&open_project(dir, &current_dir)?, schema.command, format),
    }
}
