//! Engine configuration: builder methods plus `LOCKSTEP_*` environment overrides.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    InvalidEnv { key: &'static str, value: String },
    #[error("invalid agent '{0}', expected <name>:<type>")]
    InvalidAgent(String),
    #[error("agent '{0}' configured twice")]
    DuplicateAgent(String),
    #[error("no agents configured")]
    NoAgents,
    #[error("{0} must be positive")]
    NotPositive(&'static str),
    #[error("process capacity {capacity} is below the agent count {agents}")]
    CapacityTooSmall { capacity: usize, agents: usize },
}

/// One agent in the run: its unique name and the plugin type it hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: String,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
        }
    }
}

/// Parses `<name>:<type>`.
impl FromStr for AgentConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((name, agent_type)) if !name.is_empty() && !agent_type.is_empty() => {
                Ok(Self::new(name, agent_type))
            }
            _ => Err(ConfigError::InvalidAgent(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub host: IpAddr,
    /// 0 picks an ephemeral port; agents are told the bound address.
    pub port: u16,
    pub agents: Vec<AgentConfig>,
    /// Per-agent budget for one iteration round trip.
    pub agent_timeout: Duration,
    pub init_timeout: Duration,
    /// How long to wait for every agent to connect and say hello.
    pub accept_timeout: Duration,
    pub handshake_timeout: Duration,
    /// 0 means one pool worker per agent.
    pub pool_size: usize,
    /// 0 means one process slot per agent.
    pub max_processes: usize,
    pub max_frame_length: usize,
    /// Worker executable launched once per agent.
    pub agent_bin: PathBuf,
    /// Time agents get to exit after SIGTERM before they are killed.
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            agents: Vec::new(),
            agent_timeout: Duration::from_millis(100),
            init_timeout: Duration::from_secs(1),
            accept_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(1),
            pool_size: 0,
            max_processes: 0,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            agent_bin: PathBuf::from("lockstep-agent"),
            shutdown_grace: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    pub fn new(agents: Vec<AgentConfig>) -> Self {
        Self {
            agents,
            ..Self::default()
        }
    }

    /// Defaults overridden by `LOCKSTEP_*` environment variables.
    pub fn from_env(agents: Vec<AgentConfig>) -> Result<Self, ConfigError> {
        Self::new(agents).with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup; `from_env` uses the process environment.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("LOCKSTEP_HOST") {
            self.host = parse_env("LOCKSTEP_HOST", &host)?;
        }
        if let Some(port) = lookup("LOCKSTEP_PORT") {
            self.port = parse_env("LOCKSTEP_PORT", &port)?;
        }
        if let Some(ms) = lookup("LOCKSTEP_AGENT_TIMEOUT_MS") {
            self.agent_timeout =
                Duration::from_millis(parse_env("LOCKSTEP_AGENT_TIMEOUT_MS", &ms)?);
        }
        if let Some(ms) = lookup("LOCKSTEP_INIT_TIMEOUT_MS") {
            self.init_timeout = Duration::from_millis(parse_env("LOCKSTEP_INIT_TIMEOUT_MS", &ms)?);
        }
        if let Some(n) = lookup("LOCKSTEP_POOL_SIZE") {
            self.pool_size = parse_env("LOCKSTEP_POOL_SIZE", &n)?;
        }
        if let Some(bin) = lookup("LOCKSTEP_AGENT_BIN") {
            self.agent_bin = PathBuf::from(bin);
        }
        Ok(self)
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.host = addr.ip();
        self.port = addr.port();
        self
    }

    pub fn with_agent(mut self, agent: AgentConfig) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn with_pool_size(mut self, n: usize) -> Self {
        self.pool_size = n;
        self
    }

    pub fn with_max_processes(mut self, n: usize) -> Self {
        self.max_processes = n;
        self
    }

    pub fn with_agent_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.agent_bin = bin.into();
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn effective_pool_size(&self) -> usize {
        if self.pool_size == 0 {
            self.agents.len().max(1)
        } else {
            self.pool_size
        }
    }

    pub fn effective_max_processes(&self) -> usize {
        if self.max_processes == 0 {
            self.agents.len().max(1)
        } else {
            self.max_processes
        }
    }

    /// Startup checks; any failure is fatal for the run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::NoAgents);
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.name.as_str()) {
                return Err(ConfigError::DuplicateAgent(agent.name.clone()));
            }
        }
        if self.agent_timeout.is_zero() {
            return Err(ConfigError::NotPositive("agent_timeout"));
        }
        if self.init_timeout.is_zero() {
            return Err(ConfigError::NotPositive("init_timeout"));
        }
        if self.max_frame_length == 0 {
            return Err(ConfigError::NotPositive("max_frame_length"));
        }
        // every agent needs its own live process for the whole run
        let capacity = self.effective_max_processes();
        if capacity < self.agents.len() {
            return Err(ConfigError::CapacityTooSmall {
                capacity,
                agents: self.agents.len(),
            });
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key,
        value: value.to_string(),
    })
}
