//! lockstep: lock-step orchestration of out-of-process agents.

mod logging;

pub mod bridge;
pub mod client;
pub mod config;
pub mod engine;
pub mod playback;
pub mod pool;
pub mod receiver;
pub mod server;
pub mod supervisor;

pub use bridge::connection::{ProtocolError, TransportError};
pub use bridge::protocol::{AgentStatus, DebugState, Decision, Request, Response};
pub use client::{
    AgentClient, AgentPlugin, AgentRegistry, ClientError, ConnectOptions, PluginError,
    ServeOutcome, run_agent,
};
pub use config::{AgentConfig, ConfigError, EngineConfig};
pub use engine::{Engine, EngineError, EngineState};
pub use logging::init_tracing;
pub use playback::{PlaybackCommand, PlaybackController, PlaybackStatus, parse_command};
pub use server::{AgentResponse, BindReport, OrchestratorServer, ResponseTable, ServerConfig};
pub use supervisor::{AgentSpawner, BinarySpawner, ProcessSupervisor, SupervisorError};

/// Crate version, reported by the binaries.
pub const LOCKSTEP_VERSION: &str = env!("CARGO_PKG_VERSION");
