//! Host executor: runs an intent's effect against a frozen base snapshot.
//!
//! Effects never touch the snapshot. They read it through `EffectContext`
//! and describe changes through `PatchBuilder`; the executor folds the
//! collected patches into a new terminal snapshot. A failed, cancelled, or
//! timed-out effect contributes no patches at all.

use crate::core::error::WorldlineError;
use crate::core::patch::Patch;
use crate::core::proposal::Intent;
use crate::core::queue::InFlight;
use crate::core::schema::DomainSchema;
use crate::core::snapshot::{ErrorValue, Snapshot, SystemStatus};
use crate::core::state_map;
use crate::plugins::effects;
use crossbeam::channel::{self, Receiver, Sender};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use thiserror::Error;

pub const EFFECT_FAILED: &str = "EFFECT_FAILED";
pub const EFFECT_TIMEOUT: &str = "EFFECT_TIMEOUT";
pub const EFFECT_CANCELLED: &str = "EFFECT_CANCELLED";
pub const EFFECT_PANICKED: &str = "EFFECT_PANICKED";
pub const PATCH_FAILED: &str = "PATCH_FAILED";
/// Bound on the error history kept in a snapshot's system block.
pub const MAX_ERROR_HISTORY: usize = 32;

static EFFECT_TYPE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[a-z][a-z0-9_]*(\.[a-z][a-z0-9_]*)*$").expect("static regex")
});

/// Identifier of a registered effect handler, e.g. `billing.charge`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EffectType(String);

impl EffectType {
    pub fn new(raw: &str) -> Result<Self, WorldlineError> {
        if EFFECT_TYPE_RE.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(WorldlineError::ValidationError(format!(
                "invalid effect type '{}': expected dotted lowercase identifiers",
                raw
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EffectType {
    type Error = WorldlineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        EffectType::new(&value)
    }
}

impl From<EffectType> for String {
    fn from(value: EffectType) -> Self {
        value.0
    }
}

/// How an action produces patches.
///
/// The builtin variants cover plain collection and field edits and need no
/// code; `Custom` dispatches to a handler in the `EffectRegistry`. Builtin
/// paths are relative to `data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EffectBinding {
    /// Append the input object to a collection, optionally stamping an `id`.
    Append {
        path: String,
        #[serde(default)]
        assign_id: bool,
    },
    /// Set a path to the input, or to one field of it.
    Set {
        path: String,
        #[serde(default)]
        field: Option<String>,
    },
    /// Shallow-merge the input object into the object at `path`.
    Merge { path: String },
    Unset { path: String },
    /// Soft-remove the element whose id is `input[id_field]`.
    Remove {
        path: String,
        #[serde(default = "default_id_field")]
        id_field: String,
    },
    /// Undo a soft removal.
    Restore {
        path: String,
        #[serde(default = "default_id_field")]
        id_field: String,
    },
    Noop,
    Custom { effect: EffectType },
}

fn default_id_field() -> String {
    "id".to_string()
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct EffectError {
    pub code: String,
    pub message: String,
}

impl EffectError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: EFFECT_FAILED.to_string(),
            message: message.into(),
        }
    }

    pub fn with_code(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Shared cancellation signal. Cloning shares it.
#[derive(Debug, Clone)]
pub struct CancellationToken(Arc<CancelState>);

#[derive(Debug)]
struct CancelState {
    cancelled: AtomicBool,
    // Nothing is ever sent; dropping the sender disconnects `closed`, which
    // wakes every receiver at once.
    trigger: Mutex<Option<Sender<()>>>,
    closed: Receiver<()>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        let (trigger, closed) = channel::bounded(0);
        Self(Arc::new(CancelState {
            cancelled: AtomicBool::new(false),
            trigger: Mutex::new(Some(trigger)),
            closed,
        }))
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0
            .trigger
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Becomes ready (disconnected) once the token is cancelled.
    pub fn signal(&self) -> &Receiver<()> {
        &self.0.closed
    }
}

/// Lets effect handlers submit follow-up actions through the runtime.
pub trait ActionSubmitter: Send + Sync {
    fn submit_from(
        &self,
        origin: Option<&InFlight>,
        action_type: &str,
        input: Value,
    ) -> Result<String, WorldlineError>;
}

/// Read-only view handed to effect handlers.
#[derive(Clone)]
pub struct EffectContext {
    snapshot: Arc<Snapshot>,
    execution_key: String,
    action_type: String,
    random_seed: u64,
    now: u64,
    cancel: CancellationToken,
    in_flight: Option<InFlight>,
    submitter: Option<Arc<dyn ActionSubmitter>>,
}

impl EffectContext {
    /// Context with no runtime attached, for driving a handler directly.
    pub fn detached(snapshot: Arc<Snapshot>, execution_key: &str, action_type: &str) -> Self {
        Self {
            snapshot,
            execution_key: execution_key.to_string(),
            action_type: action_type.to_string(),
            random_seed: seed_from_key(execution_key),
            now: crate::core::time::now_millis(),
            cancel: CancellationToken::new(),
            in_flight: None,
            submitter: None,
        }
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn execution_key(&self) -> &str {
        &self.execution_key
    }

    pub fn action_type(&self) -> &str {
        &self.action_type
    }

    /// Seed for any non-deterministic choice; stable for a given execution key.
    pub fn random_seed(&self) -> u64 {
        self.random_seed
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue another action. Domain actions are refused while this effect is in flight.
    pub fn submit(&self, action_type: &str, input: Value) -> Result<String, WorldlineError> {
        let submitter = self.submitter.as_ref().ok_or_else(|| {
            WorldlineError::ValidationError("no runtime attached to this effect".to_string())
        })?;
        submitter.submit_from(self.in_flight.as_ref(), action_type, input)
    }
}

/// Collects patches for an effect. Paths are relative to `data`.
#[derive(Debug, Default)]
pub struct PatchBuilder {
    patches: Vec<Patch>,
}

impl PatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: &str, value: Value) -> &mut Self {
        self.patches.push(Patch::Set { path: path.to_string(), value });
        self
    }

    pub fn merge(&mut self, path: &str, value: Value) -> &mut Self {
        self.patches.push(Patch::Merge { path: path.to_string(), value });
        self
    }

    pub fn unset(&mut self, path: &str) -> &mut Self {
        self.patches.push(Patch::Unset { path: path.to_string() });
        self
    }

    pub fn append(&mut self, path: &str, value: Value) -> &mut Self {
        self.patches.push(Patch::Append { path: path.to_string(), value });
        self
    }

    pub fn remove(&mut self, path: &str, matcher: Value) -> &mut Self {
        self.patches.push(Patch::Remove { path: path.to_string(), matcher });
        self
    }

    pub fn restore(&mut self, path: &str, matcher: Value) -> &mut Self {
        self.patches.push(Patch::Restore { path: path.to_string(), matcher });
        self
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn into_patches(self) -> Vec<Patch> {
        self.patches.into_iter().map(|p| p.rooted("data")).collect()
    }
}

pub trait EffectHandler: Send + Sync {
    fn handle(
        &self,
        ctx: &EffectContext,
        input: &Value,
        patches: &mut PatchBuilder,
    ) -> Result<(), EffectError>;
}

impl<F> EffectHandler for F
where
    F: Fn(&EffectContext, &Value, &mut PatchBuilder) -> Result<(), EffectError> + Send + Sync,
{
    fn handle(
        &self,
        ctx: &EffectContext,
        input: &Value,
        patches: &mut PatchBuilder,
    ) -> Result<(), EffectError> {
        self(ctx, input, patches)
    }
}

#[derive(Clone, Default)]
pub struct EffectRegistry {
    handlers: FxHashMap<EffectType, Arc<dyn EffectHandler>>,
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, effect: &str, handler: H) -> Result<&mut Self, WorldlineError>
    where
        H: EffectHandler + 'static,
    {
        let key = EffectType::new(effect)?;
        if self.handlers.insert(key, Arc::new(handler)).is_some() {
            tracing::warn!(effect, "effect handler replaced");
        }
        Ok(self)
    }

    pub fn get(&self, effect: &EffectType) -> Result<Arc<dyn EffectHandler>, WorldlineError> {
        self.handlers
            .get(effect)
            .cloned()
            .ok_or_else(|| WorldlineError::EffectNotRegistered(effect.as_str().to_string()))
    }

    pub fn contains(&self, effect: &EffectType) -> bool {
        self.handlers.contains_key(effect)
    }

    pub fn effect_types(&self) -> Vec<String> {
        let mut out: Vec<String> = self.handlers.keys().map(|k| k.as_str().to_string()).collect();
        out.sort();
        out
    }
}

#[derive(Clone, Default)]
pub struct ExecuteOptions {
    pub cancel: Option<CancellationToken>,
    pub timeout: Option<Duration>,
    pub in_flight: Option<InFlight>,
    pub submitter: Option<Arc<dyn ActionSubmitter>>,
    /// Clock reading for the terminal snapshot; defaults to now.
    pub now: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub terminal_snapshot: Snapshot,
    pub outcome: ExecutionOutcome,
    pub error: Option<ErrorValue>,
    /// Patches the effect produced; empty on failure.
    pub patches: Vec<Patch>,
}

pub struct HostExecutor {
    schema: Arc<DomainSchema>,
    registry: EffectRegistry,
}

/// Seed derived from the execution key, so replays of the same request see
/// the same randomness.
pub fn seed_from_key(execution_key: &str) -> u64 {
    let hex = crate::core::digest::sha256_hex(execution_key.as_bytes());
    u64::from_str_radix(&hex[..16], 16).unwrap_or(0)
}

/// Terminal snapshot for a failed execution: base content, error recorded.
pub fn failed_snapshot(
    base: &Snapshot,
    error: &ErrorValue,
    action_type: &str,
    random_seed: u64,
    now: u64,
) -> Snapshot {
    let mut next = base.clone();
    next.system.status = SystemStatus::Error;
    next.system.last_error = Some(error.clone());
    next.system.errors.push(error.clone());
    if next.system.errors.len() > MAX_ERROR_HISTORY {
        let overflow = next.system.errors.len() - MAX_ERROR_HISTORY;
        next.system.errors.drain(..overflow);
    }
    next.system.current_action = Some(action_type.to_string());
    next.meta.version = base.meta.version + 1;
    next.meta.timestamp = now;
    next.meta.random_seed = random_seed;
    next
}

impl HostExecutor {
    pub fn new(schema: Arc<DomainSchema>, registry: EffectRegistry) -> Self {
        Self { schema, registry }
    }

    pub fn registry(&self) -> &EffectRegistry {
        &self.registry
    }

    /// Every custom binding in the schema must have a handler.
    pub fn verify_bindings(&self) -> Result<(), WorldlineError> {
        for spec in self.schema.actions() {
            if let EffectBinding::Custom { effect } = &spec.effect {
                self.registry.get(effect)?;
            }
        }
        Ok(())
    }

    pub fn execute(
        &self,
        execution_key: &str,
        base: Arc<Snapshot>,
        intent: &Intent,
        opts: ExecuteOptions,
    ) -> Result<ExecutionResult, WorldlineError> {
        let spec = self.schema.action(&intent.action_type).ok_or_else(|| {
            WorldlineError::ValidationError(format!(
                "action '{}' is not declared by schema {}",
                intent.action_type,
                self.schema.schema_id()
            ))
        })?;
        let now = opts.now.unwrap_or_else(crate::core::time::now_millis);
        let seed = seed_from_key(execution_key);
        let cancel = opts.cancel.clone().unwrap_or_default();
        let ctx = EffectContext {
            snapshot: Arc::clone(&base),
            execution_key: execution_key.to_string(),
            action_type: intent.action_type.clone(),
            random_seed: seed,
            now,
            cancel: cancel.clone(),
            in_flight: opts.in_flight.clone(),
            submitter: opts.submitter.clone(),
        };

        let fail = |code: &str, message: String| {
            let error = ErrorValue::new(code, message, Some(&intent.action_type), now);
            tracing::debug!(action = %intent.action_type, code, "effect failed");
            Ok(ExecutionResult {
                terminal_snapshot: failed_snapshot(&base, &error, &intent.action_type, seed, now),
                outcome: ExecutionOutcome::Failed,
                error: Some(error),
                patches: Vec::new(),
            })
        };

        if cancel.is_cancelled() {
            return fail(EFFECT_CANCELLED, "cancelled before start".to_string());
        }

        let collected = match &spec.effect {
            EffectBinding::Custom { effect } => {
                let handler = self.registry.get(effect)?;
                run_handler(handler, ctx, intent.input.clone(), &opts, &cancel)
            }
            builtin => {
                let mut builder = PatchBuilder::new();
                effects::builtin_patches(builtin, &ctx, &intent.input, &mut builder)
                    .map(|()| builder)
                    .map_err(HandlerFailure::Error)
            }
        };

        let builder = match collected {
            Ok(builder) => builder,
            Err(HandlerFailure::Error(e)) => return fail(&e.code, e.message),
            Err(HandlerFailure::Timeout(limit)) => {
                return fail(EFFECT_TIMEOUT, format!("effect exceeded {} ms", limit.as_millis()));
            }
            Err(HandlerFailure::Cancelled) => {
                return fail(EFFECT_CANCELLED, "cancelled during execution".to_string());
            }
            Err(HandlerFailure::Panicked(msg)) => return fail(EFFECT_PANICKED, msg),
        };
        if cancel.is_cancelled() {
            return fail(EFFECT_CANCELLED, "cancelled during execution".to_string());
        }

        let patches = builder.into_patches();
        let mut terminal = match state_map::apply(&base, &patches, now) {
            Ok(s) => s,
            Err(e) => return fail(PATCH_FAILED, e.to_string()),
        };
        terminal.computed = self.schema.compute(&terminal.data);
        terminal.system.status = SystemStatus::Idle;
        terminal.system.last_error = None;
        terminal.system.current_action = Some(intent.action_type.clone());
        terminal.meta.version = base.meta.version + 1;
        terminal.meta.timestamp = now;
        terminal.meta.random_seed = seed;
        terminal.meta.schema_hash = self.schema.schema_hash();

        Ok(ExecutionResult {
            terminal_snapshot: terminal,
            outcome: ExecutionOutcome::Completed,
            error: None,
            patches,
        })
    }
}

enum HandlerFailure {
    Error(EffectError),
    Timeout(Duration),
    Cancelled,
    Panicked(String),
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "effect handler panicked".to_string()
    }
}

fn invoke(handler: &dyn EffectHandler, ctx: &EffectContext, input: &Value) -> Result<PatchBuilder, HandlerFailure> {
    let mut builder = PatchBuilder::new();
    match catch_unwind(AssertUnwindSafe(|| handler.handle(ctx, input, &mut builder))) {
        Ok(Ok(())) => Ok(builder),
        Ok(Err(e)) => Err(HandlerFailure::Error(e)),
        Err(payload) => Err(HandlerFailure::Panicked(panic_message(payload))),
    }
}

/// Run a custom handler. With no timeout or cancel token it runs inline;
/// otherwise it runs on its own thread while this one waits on the result,
/// the token, and the deadline. An abandoned handler's output is dropped.
fn run_handler(
    handler: Arc<dyn EffectHandler>,
    ctx: EffectContext,
    input: Value,
    opts: &ExecuteOptions,
    cancel: &CancellationToken,
) -> Result<PatchBuilder, HandlerFailure> {
    if opts.timeout.is_none() && opts.cancel.is_none() {
        return invoke(handler.as_ref(), &ctx, &input);
    }

    let (tx, rx) = channel::bounded(1);
    let spawned = std::thread::Builder::new()
        .name(format!("worldline-effect-{}", ctx.action_type))
        .spawn(move || {
            let _ = tx.send(invoke(handler.as_ref(), &ctx, &input));
        });
    if let Err(e) = spawned {
        return Err(HandlerFailure::Error(EffectError::new(format!(
            "failed to spawn effect thread: {}",
            e
        ))));
    }

    let deadline = opts.timeout.map_or_else(channel::never, channel::after);
    crossbeam::select! {
        recv(rx) -> result => result.unwrap_or_else(|_| {
            Err(HandlerFailure::Panicked(
                "effect thread exited without a result".to_string(),
            ))
        }),
        recv(cancel.signal()) -> _ => Err(HandlerFailure::Cancelled),
        recv(deadline) -> _ => {
            cancel.cancel();
            Err(HandlerFailure::Timeout(opts.timeout.unwrap_or_default()))
        }
    }
}
