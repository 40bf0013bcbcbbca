//! Top-level driver: one server plus one worker process per configured agent.

use std::collections::HashMap;
use std::sync::Arc;

use crate::bridge::connection::TransportError;
use crate::bridge::protocol::AgentStatus;
use crate::config::{ConfigError, EngineConfig};
use crate::pool::PoolError;
use crate::server::{BindReport, OrchestratorServer, ResponseTable, ServerConfig};
use crate::supervisor::{
    AgentSpawnConfig, AgentSpawner, BinarySpawner, ProcessSupervisor, SupervisorError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready,
    Terminated,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine is {actual:?}, operation needs {expected:?}")]
    InvalidState {
        expected: EngineState,
        actual: EngineState,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

pub struct Engine {
    config: EngineConfig,
    spawner: Arc<dyn AgentSpawner>,
    state: EngineState,
    server: Option<OrchestratorServer>,
    supervisor: ProcessSupervisor,
    statuses: HashMap<String, AgentStatus>,
    table: ResponseTable,
    bind_report: BindReport,
}

impl Engine {
    /// Validate `config` and prepare an engine that launches `config.agent_bin`.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let spawner = Arc::new(BinarySpawner::new(config.agent_bin.clone()));
        Self::with_spawner(config, spawner)
    }

    pub fn with_spawner(
        config: EngineConfig,
        spawner: Arc<dyn AgentSpawner>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let supervisor = ProcessSupervisor::new(config.effective_max_processes());
        Ok(Self {
            config,
            spawner,
            state: EngineState::Uninitialized,
            server: None,
            supervisor,
            statuses: HashMap::new(),
            table: ResponseTable::new(),
            bind_report: BindReport::default(),
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn expect_state(&self, expected: EngineState) -> Result<(), EngineError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    /// Listen, launch every agent's worker, accept their connections and bind them.
    ///
    /// Agents that fail anywhere along the way are crippled; only listen and
    /// configuration failures are errors.
    pub async fn initialize(&mut self) -> Result<&BindReport, EngineError> {
        self.expect_state(EngineState::Uninitialized)?;

        let expected = self.config.agents.len();
        let server_config =
            ServerConfig::new(self.config.addr(), self.config.effective_pool_size())
                .with_handshake_timeout(self.config.handshake_timeout)
                .with_close_timeout(self.config.shutdown_grace)
                .with_max_frame_length(self.config.max_frame_length);
        let mut server = OrchestratorServer::listen(server_config, expected).await?;
        let addr = server.local_addr();

        // Spawning never blocks on the agents; their connections wait in the backlog.
        let mut launched = 0;
        for agent in &self.config.agents {
            let command = self.spawner.command(&AgentSpawnConfig {
                agent_name: agent.name.clone(),
                agent_type: agent.agent_type.clone(),
                addr,
            });
            match self.supervisor.start(&agent.name, command).await {
                Ok(_) => launched += 1,
                Err(e) => tracing::error!(agent = %agent.name, error = %e, "Failed to launch agent"),
            }
        }

        let accepted = match server.accept_all(launched, self.config.accept_timeout).await {
            Ok(accepted) => accepted,
            Err(e) => {
                server.terminate().await;
                self.supervisor.kill_all().await;
                return Err(e.into());
            }
        };
        tracing::info!(expected, launched, accepted, "Agents connected");

        for agent in &self.config.agents {
            self.statuses
                .entry(agent.name.clone())
                .or_insert_with(AgentStatus::default);
        }
        self.bind_report = server
            .bind_agents(&self.config.agents, &self.statuses, self.config.init_timeout)
            .await;

        self.server = Some(server);
        self.state = EngineState::Ready;
        Ok(&self.bind_report)
    }

    /// Replace the statuses sent with the next iteration (or with initialize).
    pub fn set_status_map(
        &mut self,
        statuses: HashMap<String, AgentStatus>,
    ) -> Result<(), EngineError> {
        if self.state == EngineState::Terminated {
            return Err(EngineError::InvalidState {
                expected: EngineState::Ready,
                actual: self.state,
            });
        }
        self.statuses = statuses;
        Ok(())
    }

    /// Agents excluded by upstream policy; they are skipped until the set changes.
    pub fn set_excluded<I, S>(&mut self, names: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expect_state(EngineState::Ready)?;
        if let Some(server) = self.server.as_mut() {
            server.set_excluded(names);
        }
        Ok(())
    }

    /// Run one lock-step iteration over every live agent.
    pub async fn run_one_iteration(&mut self) -> Result<&ResponseTable, EngineError> {
        self.expect_state(EngineState::Ready)?;
        let Some(server) = self.server.as_mut() else {
            return Err(EngineError::InvalidState {
                expected: EngineState::Ready,
                actual: self.state,
            });
        };

        for report in self.supervisor.try_reap() {
            if !report.is_abnormal() {
                tracing::info!(agent = %report.agent_name, pid = report.pid, "Agent process exited");
            }
        }

        server
            .run_iteration(&self.statuses, self.config.agent_timeout)
            .await?;
        self.table = server.response_table();
        Ok(&self.table)
    }

    /// Answers from the last iteration.
    pub fn response_table(&self) -> &ResponseTable {
        &self.table
    }

    pub fn bind_report(&self) -> &BindReport {
        &self.bind_report
    }

    pub fn live_processes(&self) -> usize {
        self.supervisor.live_count()
    }

    /// Close every connection and stop every worker process.
    pub async fn terminate(&mut self) -> Result<(), EngineError> {
        if self.state == EngineState::Terminated {
            return Err(EngineError::InvalidState {
                expected: EngineState::Ready,
                actual: self.state,
            });
        }
        if let Some(mut server) = self.server.take() {
            server.terminate().await;
        }
        let reports = self
            .supervisor
            .terminate_all(self.config.shutdown_grace)
            .await;
        tracing::info!(reaped = reports.len(), "Engine terminated");
        self.state = EngineState::Terminated;
        Ok(())
    }
}
