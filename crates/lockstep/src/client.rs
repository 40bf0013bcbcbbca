//! Agent side of the protocol: connect, announce, then answer requests until told to stop.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::bridge::connection::{ClientConnection, Connection, TransportError};
use crate::bridge::protocol::{AgentStatus, DebugState, Decision, Request, Response};

/// Error returned by a plugin call; reported to the orchestrator as `failed`.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct PluginError {
    message: String,
}

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unknown agent type '{0}'")]
    UnknownAgentType(String),
    #[error("agent '{agent_name}' failed to initialize: {source}")]
    Initialize {
        agent_name: String,
        #[source]
        source: PluginError,
    },
}

/// Decision logic for one agent, hosted inside a worker process.
#[async_trait::async_trait]
pub trait AgentPlugin: Send + 'static {
    fn name(&self) -> &str;

    /// Called once with the agent's starting status.
    async fn initialize(&mut self, status: &AgentStatus) -> Result<(), PluginError>;

    async fn run_one_iteration(&mut self, status: &AgentStatus) -> Result<Decision, PluginError>;

    /// Take whatever debug values were published since the last call.
    fn debug_state(&mut self) -> DebugState {
        DebugState::new()
    }
}

type PluginFactory = Box<dyn Fn(&str) -> Box<dyn AgentPlugin> + Send + Sync>;

/// Maps agent type names to plugin constructors.
#[derive(Default)]
pub struct AgentRegistry {
    factories: BTreeMap<String, PluginFactory>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor; it receives the agent name.
    ///
    /// # Panics
    /// Panics if `agent_type` is already registered.
    pub fn register<F>(&mut self, agent_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&str) -> Box<dyn AgentPlugin> + Send + Sync + 'static,
    {
        let agent_type = agent_type.into();
        assert!(
            !self.factories.contains_key(&agent_type),
            "agent type '{agent_type}' registered twice"
        );
        self.factories.insert(agent_type, Box::new(factory));
        self
    }

    pub fn contains(&self, agent_type: &str) -> bool {
        self.factories.contains_key(agent_type)
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(
        &self,
        agent_type: &str,
        agent_name: &str,
    ) -> Result<Box<dyn AgentPlugin>, ClientError> {
        let factory = self
            .factories
            .get(agent_type)
            .ok_or_else(|| ClientError::UnknownAgentType(agent_type.to_string()))?;
        Ok(factory(agent_name))
    }
}

/// How an agent connects to the orchestrator.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub attempts: u32,
    pub backoff: Duration,
    pub max_frame_length: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ConnectOptions {
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }
}

/// Why [`AgentClient::serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// The orchestrator closed the connection.
    PeerClosed,
    /// The world reported the agent as no longer alive.
    Eliminated,
}

pub struct AgentClient {
    agent_name: String,
    conn: ClientConnection,
    registry: Arc<AgentRegistry>,
    plugin: Option<Box<dyn AgentPlugin>>,
}

impl AgentClient {
    /// Connect to the orchestrator and announce `agent_name`.
    pub async fn connect(
        agent_name: impl Into<String>,
        addr: SocketAddr,
        registry: Arc<AgentRegistry>,
        options: &ConnectOptions,
    ) -> Result<Self, ClientError> {
        let agent_name = agent_name.into();
        let attempts = options.attempts.max(1);

        let mut attempt = 1;
        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(source) if attempt >= attempts => {
                    return Err(TransportError::Connect {
                        addr,
                        attempts,
                        source,
                    }
                    .into());
                }
                Err(e) => {
                    tracing::debug!(agent = %agent_name, %addr, attempt, error = %e, "Connect failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(options.backoff).await;
                }
            }
        };

        let mut conn = Connection::new(stream, options.max_frame_length)?;
        conn.send_message(Response::Hello {
            agent_name: agent_name.clone(),
        })
        .await?;
        tracing::info!(agent = %agent_name, %addr, "Connected to orchestrator");

        Ok(Self {
            agent_name,
            conn,
            registry,
            plugin: None,
        })
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Answer requests until the orchestrator hangs up or the agent is eliminated.
    ///
    /// A failed initialization is reported to the orchestrator and then returned as an error.
    pub async fn serve(&mut self) -> Result<ServeOutcome, ClientError> {
        loop {
            let request = match self.conn.receive_message().await {
                Ok(request) => request,
                Err(TransportError::ConnectionClosed) => {
                    tracing::info!(agent = %self.agent_name, "Orchestrator closed the connection");
                    return Ok(ServeOutcome::PeerClosed);
                }
                Err(e) => return Err(e.into()),
            };

            if request.agent_name() != self.agent_name {
                tracing::warn!(
                    agent = %self.agent_name,
                    addressed_to = request.agent_name(),
                    "Request addressed to another agent"
                );
            }

            match request {
                Request::Initialize {
                    agent_type,
                    initial_status,
                    ..
                } => {
                    let started = Instant::now();
                    if let Err(e) = self.initialize(&agent_type, &initial_status).await {
                        self.conn
                            .send_message(Response::Failed {
                                seq: None,
                                error: e.to_string(),
                            })
                            .await?;
                        return Err(e);
                    }
                    let elapsed = started.elapsed().as_secs_f64();
                    tracing::info!(agent = %self.agent_name, %agent_type, elapsed, "Agent initialized");
                    self.conn
                        .send_message(Response::Initialize { elapsed })
                        .await?;
                }
                Request::Iteration {
                    seq,
                    current_status,
                    ..
                } => {
                    if !current_status.alive {
                        tracing::info!(agent = %self.agent_name, seq, "Agent eliminated, stopping");
                        return Ok(ServeOutcome::Eliminated);
                    }
                    let response = self.iterate(seq, &current_status).await;
                    self.conn.send_message(response).await?;
                }
            }
        }
    }

    async fn initialize(
        &mut self,
        agent_type: &str,
        status: &AgentStatus,
    ) -> Result<(), ClientError> {
        let mut plugin = self.registry.create(agent_type, &self.agent_name)?;
        plugin
            .initialize(status)
            .await
            .map_err(|source| ClientError::Initialize {
                agent_name: self.agent_name.clone(),
                source,
            })?;
        self.plugin = Some(plugin);
        Ok(())
    }

    async fn iterate(&mut self, seq: u64, status: &AgentStatus) -> Response {
        let Some(plugin) = self.plugin.as_mut() else {
            tracing::warn!(agent = %self.agent_name, seq, "Iteration before initialize");
            return Response::Failed {
                seq: Some(seq),
                error: "agent not initialized".to_string(),
            };
        };

        let started = Instant::now();
        let result = plugin.run_one_iteration(status).await;
        let elapsed = started.elapsed().as_secs_f64();
        let debug = plugin.debug_state();

        match result {
            Ok(decision) => {
                tracing::trace!(agent = %self.agent_name, seq, elapsed, "Iteration complete");
                Response::Iteration {
                    seq,
                    elapsed,
                    decision,
                    debug,
                }
            }
            Err(e) => {
                tracing::warn!(agent = %self.agent_name, seq, error = %e, "Plugin iteration failed");
                Response::Failed {
                    seq: Some(seq),
                    error: e.to_string(),
                }
            }
        }
    }

    /// Close the connection.
    pub async fn terminate(mut self) -> Result<(), ClientError> {
        let plugin = self.plugin.as_ref().map(|p| p.name().to_string());
        tracing::debug!(agent = %self.agent_name, ?plugin, "Agent client terminating");
        match self.conn.close().await {
            Ok(()) | Err(TransportError::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Connect, serve until done and hang up.
pub async fn run_agent(
    agent_name: &str,
    addr: SocketAddr,
    registry: Arc<AgentRegistry>,
    options: &ConnectOptions,
) -> Result<ServeOutcome, ClientError> {
    let mut client = AgentClient::connect(agent_name, addr, registry, options).await?;
    let outcome = client.serve().await;
    if let Err(e) = client.terminate().await {
        tracing::debug!(agent = %agent_name, error = %e, "Error closing connection");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::connection::ServerConnection;
    use serde_json::json;
    use tokio::net::TcpListener;

    struct Echo {
        name: String,
        calls: u64,
    }

    #[async_trait::async_trait]
    impl AgentPlugin for Echo {
        fn name(&self) -> &str {
            &self.name
        }

        async fn initialize(&mut self, _status: &AgentStatus) -> Result<(), PluginError> {
            Ok(())
        }

        async fn run_one_iteration(
            &mut self,
            status: &AgentStatus,
        ) -> Result<Decision, PluginError> {
            self.calls += 1;
            if status.tick == 13 {
                return Err(PluginError::new("unlucky tick"));
            }
            Ok(Decision::new(json!({ "tick": status.tick })))
        }

        fn debug_state(&mut self) -> DebugState {
            DebugState::from([("calls".to_string(), self.calls.to_string())])
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl AgentPlugin for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn initialize(&mut self, _status: &AgentStatus) -> Result<(), PluginError> {
            Err(PluginError::new("no map"))
        }

        async fn run_one_iteration(
            &mut self,
            _status: &AgentStatus,
        ) -> Result<Decision, PluginError> {
            Ok(Decision::default())
        }
    }

    fn registry() -> Arc<AgentRegistry> {
        let mut registry = AgentRegistry::new();
        registry
            .register("echo", |name| {
                Box::new(Echo {
                    name: name.to_string(),
                    calls: 0,
                })
            })
            .register("broken", |_| Box::new(Broken));
        Arc::new(registry)
    }

    /// Start a client for `agent_name` and return the orchestrator end after the hello.
    async fn accept_agent(
        agent_name: &'static str,
    ) -> (
        ServerConnection,
        tokio::task::JoinHandle<Result<ServeOutcome, ClientError>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let agent = tokio::spawn(async move {
            run_agent(agent_name, addr, registry(), &ConnectOptions::default()).await
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = Connection::new(stream, DEFAULT_MAX_FRAME_LENGTH).unwrap();
        let hello = conn.receive_message().await.unwrap();
        assert_eq!(
            hello,
            Response::Hello {
                agent_name: agent_name.to_string()
            }
        );
        (conn, agent)
    }

    fn initialize(agent_name: &str, agent_type: &str) -> Request {
        Request::Initialize {
            agent_name: agent_name.to_string(),
            agent_type: agent_type.to_string(),
            initial_status: AgentStatus::default(),
        }
    }

    fn iteration(agent_name: &str, seq: u64, status: AgentStatus) -> Request {
        Request::Iteration {
            agent_name: agent_name.to_string(),
            seq,
            current_status: status,
        }
    }

    #[tokio::test]
    async fn serves_initialize_and_iterations() {
        let (mut conn, agent) = accept_agent("car-0").await;

        conn.send_message(initialize("car-0", "echo")).await.unwrap();
        assert!(matches!(
            conn.receive_message().await.unwrap(),
            Response::Initialize { .. }
        ));

        for seq in 1..=2 {
            conn.send_message(iteration("car-0", seq, AgentStatus::alive(seq, json!({}))))
                .await
                .unwrap();
            let Response::Iteration {
                seq: got,
                decision,
                debug,
                ..
            } = conn.receive_message().await.unwrap()
            else {
                panic!("expected iteration response");
            };
            assert_eq!(got, seq);
            assert_eq!(decision.value(), &json!({ "tick": seq }));
            assert_eq!(debug["calls"], seq.to_string());
        }

        drop(conn);
        assert_eq!(agent.await.unwrap().unwrap(), ServeOutcome::PeerClosed);
    }

    #[tokio::test]
    async fn plugin_error_is_reported_and_loop_continues() {
        let (mut conn, agent) = accept_agent("car-1").await;

        conn.send_message(initialize("car-1", "echo")).await.unwrap();
        conn.receive_message().await.unwrap();

        conn.send_message(iteration("car-1", 1, AgentStatus::alive(13, json!(null))))
            .await
            .unwrap();
        assert_eq!(
            conn.receive_message().await.unwrap(),
            Response::Failed {
                seq: Some(1),
                error: "unlucky tick".to_string()
            }
        );

        conn.send_message(iteration("car-1", 2, AgentStatus::alive(14, json!(null))))
            .await
            .unwrap();
        assert!(matches!(
            conn.receive_message().await.unwrap(),
            Response::Iteration { seq: 2, .. }
        ));

        drop(conn);
        agent.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn eliminated_status_stops_serving() {
        let (mut conn, agent) = accept_agent("car-2").await;

        conn.send_message(initialize("car-2", "echo")).await.unwrap();
        conn.receive_message().await.unwrap();
        conn.send_message(iteration("car-2", 1, AgentStatus::eliminated(1)))
            .await
            .unwrap();

        assert_eq!(agent.await.unwrap().unwrap(), ServeOutcome::Eliminated);
        assert!(matches!(
            conn.receive_message().await,
            Err(TransportError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn unknown_agent_type_fails_initialize() {
        let (mut conn, agent) = accept_agent("car-3").await;

        conn.send_message(initialize("car-3", "teleport")).await.unwrap();
        let Response::Failed { seq: None, error } = conn.receive_message().await.unwrap() else {
            panic!("expected failure");
        };
        assert!(error.contains("teleport"));

        let err = agent.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::UnknownAgentType(t) if t == "teleport"));
    }

    #[tokio::test]
    async fn plugin_initialize_error_is_fatal() {
        let (mut conn, agent) = accept_agent("car-4").await;

        conn.send_message(initialize("car-4", "broken")).await.unwrap();
        assert!(matches!(
            conn.receive_message().await.unwrap(),
            Response::Failed { .. }
        ));
        assert!(matches!(
            agent.await.unwrap(),
            Err(ClientError::Initialize { .. })
        ));
    }

    #[tokio::test]
    async fn iteration_before_initialize_fails() {
        let (mut conn, agent) = accept_agent("car-5").await;

        conn.send_message(iteration("car-5", 1, AgentStatus::default()))
            .await
            .unwrap();
        assert!(matches!(
            conn.receive_message().await.unwrap(),
            Response::Failed { seq: Some(1), .. }
        ));

        drop(conn);
        agent.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn connect_gives_up_after_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let options = ConnectOptions::default()
            .with_attempts(2)
            .with_backoff(Duration::from_millis(10));
        let err = AgentClient::connect("car-0", addr, registry(), &options)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ClientError::Transport(TransportError::Connect { attempts: 2, .. })
        ));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_panics() {
        let mut registry = AgentRegistry::new();
        registry.register("broken", |_| Box::new(Broken));
        registry.register("broken", |_| Box::new(Broken));
    }

    #[test]
    fn registry_creates_by_type() {
        let registry = registry();
        assert_eq!(registry.types().collect::<Vec<_>>(), ["broken", "echo"]);
        assert_eq!(registry.create("echo", "car-7").unwrap().name(), "car-7");
        assert!(matches!(
            registry.create("hover", "car-7"),
            Err(ClientError::UnknownAgentType(_))
        ));
    }
}
