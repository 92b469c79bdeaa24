//! Core of the worldline runtime.
//!
//! History primitives (proposals, snapshots, worlds, branches), the stores
//! that persist them, and the runtime that drives actions through policy and
//! effect execution.

pub mod branch;
pub mod broker;
pub mod config;
pub mod db;
pub mod digest;
pub mod error;
pub mod handle;
pub mod host;
pub mod orchestrator;
pub mod patch;
pub mod proposal;
pub mod queue;
pub mod schema;
pub mod schemas;
pub mod snapshot;
pub mod sqlite_store;
pub mod state_map;
pub mod store;
pub mod subscription;
pub mod system;
pub mod telemetry;
pub mod time;
pub mod world;
