//! Wire protocol types for orchestrator-agent communication.
//!
//! One TCP connection per agent, strictly half-duplex after the handshake:
//! - **Handshake**: the agent announces itself with `Response::Hello` right after connecting
//! - **Round trips**: the orchestrator sends one `Request`, the agent answers with one `Response`

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Debug key/value pairs published by a plugin during one call.
pub type DebugState = BTreeMap<String, String>;

/// Per-agent status pushed by the world simulation every iteration.
///
/// Only `alive` is interpreted here; `state` belongs to the world collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub alive: bool,
    #[serde(default)]
    pub tick: u64,
    #[serde(default)]
    pub state: serde_json::Value,
}

impl AgentStatus {
    pub fn alive(tick: u64, state: serde_json::Value) -> Self {
        Self {
            alive: true,
            tick,
            state,
        }
    }

    pub fn eliminated(tick: u64) -> Self {
        Self {
            alive: false,
            tick,
            state: serde_json::Value::Null,
        }
    }
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::alive(0, serde_json::Value::Null)
    }
}

/// Opaque decision returned by an agent plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Decision(pub serde_json::Value);

impl Decision {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// Messages from orchestrator to agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// First request on a bound connection.
    Initialize {
        agent_name: String,
        agent_type: String,
        initial_status: AgentStatus,
    },

    Iteration {
        agent_name: String,
        /// Iteration counter, echoed back so late answers can be discarded.
        seq: u64,
        current_status: AgentStatus,
    },
}

impl Request {
    pub fn agent_name(&self) -> &str {
        match self {
            Self::Initialize { agent_name, .. } => agent_name,
            Self::Iteration { agent_name, .. } => agent_name,
        }
    }
}

/// Messages from agent to orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Identity announcement, must be the first message after connecting.
    Hello { agent_name: String },

    Initialize {
        /// Wall time spent in the plugin, in seconds.
        elapsed: f64,
    },

    Iteration {
        seq: u64,
        elapsed: f64,
        decision: Decision,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        debug: DebugState,
    },

    /// The plugin returned an error for the last request.
    Failed {
        /// Iteration being answered; absent when initialize failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        error: String,
    },
}
