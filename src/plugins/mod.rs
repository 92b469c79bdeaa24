//! Pluggable services: approval policies and the standard effect handlers.

pub mod effects;
pub mod policy;
