//! Administrative actions handled by the runtime itself.
//!
//! These run on the system lane, go through the same proposal lifecycle as
//! domain actions, and never create a World: they move branch pointers or
//! write the actor registry.

use crate::core::branch::ForkOptions;
use crate::core::proposal::{ActorKind, ActorRef};
use crate::core::schema::{INVALID_INPUT, UNKNOWN_ACTION};
use crate::core::snapshot::ErrorValue;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub const ACTOR_REGISTER: &str = "actor.register";
pub const BRANCH_FORK: &str = "branch.fork";
pub const BRANCH_SWITCH: &str = "branch.switch";
pub const BRANCH_RESET: &str = "branch.reset";

pub const ALL: [&str; 4] = [ACTOR_REGISTER, BRANCH_FORK, BRANCH_SWITCH, BRANCH_RESET];

#[derive(Debug, Clone, PartialEq)]
pub enum SystemAction {
    RegisterActor(ActorRef),
    Fork(ForkOptions),
    Switch { branch_id: String },
    Reset { branch_id: Option<String>, world_id: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RegisterInput {
    actor_id: String,
    #[serde(default)]
    kind: Option<ActorKind>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ForkInput {
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    at_world: Option<String>,
    #[serde(default)]
    switch: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SwitchInput {
    branch_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ResetInput {
    #[serde(default)]
    branch_id: Option<String>,
    world_id: String,
}

fn decode<T: DeserializeOwned>(action_type: &str, input: &Value, now: u64) -> Result<T, ErrorValue> {
    let input = if input.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        input.clone()
    };
    serde_json::from_value(input).map_err(|e| {
        ErrorValue::new(
            INVALID_INPUT,
            format!("invalid input for {}: {}", action_type, e),
            Some(action_type),
            now,
        )
    })
}

impl SystemAction {
    /// `name` is the action type with the system prefix stripped.
    pub fn parse(action_type: &str, name: &str, input: &Value, now: u64) -> Result<Self, ErrorValue> {
        match name {
            ACTOR_REGISTER => {
                let raw: RegisterInput = decode(action_type, input, now)?;
                if raw.actor_id.trim().is_empty() {
                    return Err(ErrorValue::new(
                        INVALID_INPUT,
                        "actorId must not be empty",
                        Some(action_type),
                        now,
                    ));
                }
                Ok(SystemAction::RegisterActor(ActorRef {
                    actor_id: raw.actor_id,
                    kind: raw.kind.unwrap_or(ActorKind::Agent),
                    name: raw.name,
                }))
            }
            BRANCH_FORK => {
                let raw: ForkInput = decode(action_type, input, now)?;
                Ok(SystemAction::Fork(ForkOptions {
                    from_branch: raw.from,
                    name: raw.name,
                    at_world: raw.at_world,
                    switch: raw.switch,
                }))
            }
            BRANCH_SWITCH => {
                let raw: SwitchInput = decode(action_type, input, now)?;
                Ok(SystemAction::Switch { branch_id: raw.branch_id })
            }
            BRANCH_RESET => {
                let raw: ResetInput = decode(action_type, input, now)?;
                Ok(SystemAction::Reset {
                    branch_id: raw.branch_id,
                    world_id: raw.world_id,
                })
            }
            other => Err(ErrorValue::new(
                UNKNOWN_ACTION,
                format!("unknown system action '{}' (known: {})", other, ALL.join(", ")),
                Some(action_type),
                now,
            )),
        }
    }

    /// Branch the action targets, when it names one.
    pub fn target_branch(&self) -> Option<&str> {
        match self {
            SystemAction::Fork(opts) => opts.from_branch.as_deref(),
            SystemAction::Switch { branch_id } => Some(branch_id),
            SystemAction::Reset { branch_id, .. } => branch_id.as_deref(),
            SystemAction::RegisterActor(_) => None,
        }
    }
}
