//! Orchestrator side: accepts agent connections, binds them by name and fans each
//! iteration out over the worker pool.
//!
//! Lifecycle: [`OrchestratorServer::listen`] → [`accept_all`](OrchestratorServer::accept_all)
//! → [`bind_agents`](OrchestratorServer::bind_agents) → repeated
//! [`run_iteration`](OrchestratorServer::run_iteration) → [`terminate`](OrchestratorServer::terminate).
//!
//! An agent that fails to bind is crippled for the rest of the run. An agent that fails
//! an iteration is only missing from that iteration's [`ResponseTable`]; the server never
//! retries, reconnects or restarts it.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::bridge::connection::{Connection, ConnectionWriter, ServerConnection, TransportError};
use crate::bridge::protocol::{AgentStatus, DebugState, Decision, Request, Response};
use crate::config::AgentConfig;
use crate::pool::{PoolError, WorkerPool};
use crate::receiver::Receiver;

/// One agent's answer for the current iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub decision: Decision,
    /// Seconds the agent spent deciding.
    pub elapsed: f64,
    pub debug: DebugState,
}

pub type ResponseTable = HashMap<String, AgentResponse>;

/// Outcome of [`OrchestratorServer::bind_agents`], in configured order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindReport {
    pub ready: Vec<String>,
    pub crippled: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Listen backlog; defaults to the number of expected agents.
    pub backlog: Option<u32>,
    pub pool_size: usize,
    pub handshake_timeout: Duration,
    /// How long `terminate` waits for each connection to flush before dropping it.
    pub close_timeout: Duration,
    pub max_frame_length: usize,
}

impl ServerConfig {
    pub fn new(addr: SocketAddr, pool_size: usize) -> Self {
        Self {
            addr,
            backlog: None,
            pool_size,
            handshake_timeout: Duration::from_secs(1),
            close_timeout: Duration::from_millis(500),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }
}

/// Write half plus receiver of a bound agent. Locked for a whole round trip, so
/// requests to one agent are strictly sequential.
struct AgentLink {
    writer: ConnectionWriter<Request>,
    receiver: Receiver,
}

struct BoundAgent {
    name: String,
    link: Arc<Mutex<AgentLink>>,
}

pub struct OrchestratorServer {
    config: ServerConfig,
    local_addr: SocketAddr,
    listener: Option<TcpListener>,
    /// Accepted and announced, not yet bound.
    pending: HashMap<String, ServerConnection>,
    /// Bound and initialized, in configured order.
    bound: Vec<BoundAgent>,
    crippled: Vec<String>,
    excluded: HashSet<String>,
    table: Arc<StdMutex<ResponseTable>>,
    pool: WorkerPool,
    seq: u64,
}

impl OrchestratorServer {
    /// Bind and listen. `expected_agents` sizes the backlog unless one is configured.
    pub async fn listen(
        config: ServerConfig,
        expected_agents: usize,
    ) -> Result<Self, TransportError> {
        let addr = config.addr;
        let bind_err = |source: io::Error| TransportError::Bind { addr, source };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;

        let backlog = config
            .backlog
            .unwrap_or_else(|| u32::try_from(expected_agents).unwrap_or(u32::MAX).max(1));
        let listener = socket.listen(backlog).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        tracing::info!(%local_addr, backlog, "Orchestrator listening");
        let pool = WorkerPool::new(config.pool_size.max(1));
        Ok(Self {
            config,
            local_addr,
            listener: Some(listener),
            pending: HashMap::new(),
            bound: Vec::new(),
            crippled: Vec::new(),
            excluded: HashSet::new(),
            table: Arc::new(StdMutex::new(ResponseTable::new())),
            pool,
            seq: 0,
        })
    }

    /// Address agents should connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `expected` agents have announced themselves or `timeout`
    /// passes. Returns the number of announced agents waiting to be bound.
    pub async fn accept_all(
        &mut self,
        expected: usize,
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let Some(listener) = self.listener.as_ref() else {
            return Err(TransportError::Accept(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener closed",
            )));
        };
        let deadline = Instant::now() + timeout;

        while self.pending.len() < expected {
            let (stream, peer) = match tokio::time::timeout_at(deadline, listener.accept()).await {
                Ok(Ok(accepted)) => accepted,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
                Err(_) => {
                    tracing::warn!(
                        accepted = self.pending.len(),
                        expected,
                        "Timed out waiting for agents to connect"
                    );
                    break;
                }
            };

            let mut conn = match Connection::new(stream, self.config.max_frame_length) {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "Failed to set up connection");
                    continue;
                }
            };

            let handshake_deadline = deadline.min(Instant::now() + self.config.handshake_timeout);
            let hello = tokio::time::timeout_at(handshake_deadline, conn.receive_message()).await;
            match hello {
                Ok(Ok(Response::Hello { agent_name })) => {
                    if self.pending.contains_key(&agent_name)
                        || self.bound.iter().any(|b| b.name == agent_name)
                    {
                        tracing::warn!(%peer, agent = %agent_name, "Duplicate agent name, dropping connection");
                        continue;
                    }
                    tracing::debug!(%peer, agent = %agent_name, "Agent connected");
                    self.pending.insert(agent_name, conn);
                }
                Ok(Ok(other)) => {
                    tracing::warn!(%peer, ?other, "Expected hello, dropping connection");
                }
                Ok(Err(e)) => {
                    tracing::warn!(%peer, error = %e, "Handshake failed");
                }
                Err(_) => {
                    tracing::warn!(%peer, "Handshake timed out");
                }
            }
        }

        tracing::info!(accepted = self.pending.len(), expected, "Accept phase finished");
        Ok(self.pending.len())
    }

    /// Initialize every configured agent in order.
    ///
    /// Agents that never connected, fail to send, answer with `failed` or miss
    /// `init_timeout` are crippled for the run.
    pub async fn bind_agents(
        &mut self,
        agents: &[AgentConfig],
        initial_statuses: &HashMap<String, AgentStatus>,
        init_timeout: Duration,
    ) -> BindReport {
        let mut report = BindReport::default();

        for agent in agents {
            match self.bind_one(agent, initial_statuses, init_timeout).await {
                Ok(link) => {
                    report.ready.push(agent.name.clone());
                    self.bound.push(BoundAgent {
                        name: agent.name.clone(),
                        link: Arc::new(Mutex::new(link)),
                    });
                }
                Err(reason) => {
                    tracing::error!(agent = %agent.name, %reason, "Agent crippled for this run");
                    report.crippled.push(agent.name.clone());
                    self.crippled.push(agent.name.clone());
                }
            }
        }

        for (name, conn) in self.pending.drain() {
            tracing::warn!(agent = %name, peer = %conn.peer(), "Connected agent is not configured, dropping");
        }

        tracing::info!(
            ready = report.ready.len(),
            crippled = report.crippled.len(),
            "Agents bound"
        );
        report
    }

    async fn bind_one(
        &mut self,
        agent: &AgentConfig,
        initial_statuses: &HashMap<String, AgentStatus>,
        init_timeout: Duration,
    ) -> Result<AgentLink, String> {
        let mut conn = self
            .pending
            .remove(&agent.name)
            .ok_or_else(|| "never connected".to_string())?;
        // nothing is owed after hello; anything still queued would desync the first answer
        let stale = conn.drain();
        if stale > 0 {
            tracing::warn!(agent = %agent.name, stale, "Discarded bytes sent before initialize");
        }
        let (reader, mut writer) = conn.into_split();

        let request = Request::Initialize {
            agent_name: agent.name.clone(),
            agent_type: agent.agent_type.clone(),
            initial_status: initial_statuses
                .get(&agent.name)
                .cloned()
                .unwrap_or_default(),
        };
        writer
            .send_message(request)
            .await
            .map_err(|e| format!("initialize send failed: {e}"))?;

        let mut receiver = Receiver::spawn(agent.name.clone(), reader);
        match receiver.pull_with_timeout(init_timeout).await {
            Some(Response::Initialize { elapsed }) => {
                tracing::info!(agent = %agent.name, agent_type = %agent.agent_type, elapsed, "Agent ready");
                Ok(AgentLink { writer, receiver })
            }
            Some(Response::Failed { error, .. }) => Err(format!("initialize failed: {error}")),
            Some(other) => Err(format!("unexpected initialize answer: {other:?}")),
            None => Err("no initialize answer".to_string()),
        }
    }

    /// Agents excluded by upstream policy are skipped until the set changes.
    pub fn set_excluded<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded = names.into_iter().map(Into::into).collect();
    }

    /// Run one lock-step iteration and return how many agents were asked.
    ///
    /// Only bound, non-excluded agents whose status says alive take part. When this
    /// returns, every scheduled round trip has either answered or hit
    /// `per_agent_timeout`, which covers both sending the request and the answer.
    pub async fn run_iteration(
        &mut self,
        statuses: &HashMap<String, AgentStatus>,
        per_agent_timeout: Duration,
    ) -> Result<usize, PoolError> {
        self.seq += 1;
        let seq = self.seq;
        lock_table(&self.table).clear();

        let mut scheduled = 0;
        for agent in &self.bound {
            if self.excluded.contains(&agent.name) {
                continue;
            }
            let Some(status) = statuses.get(&agent.name) else {
                tracing::debug!(agent = %agent.name, seq, "No status for agent, skipping");
                continue;
            };
            if !status.alive {
                continue;
            }

            self.pool.schedule(round_trip(
                agent.name.clone(),
                Arc::clone(&agent.link),
                Arc::clone(&self.table),
                seq,
                status.clone(),
                per_agent_timeout,
            ))?;
            scheduled += 1;
        }

        self.pool.wait_for_batch_done().await;

        let answered = lock_table(&self.table).len();
        tracing::debug!(seq, scheduled, answered, "Iteration complete");
        Ok(scheduled)
    }

    /// Snapshot of the last iteration's answers.
    pub fn response_table(&self) -> ResponseTable {
        lock_table(&self.table).clone()
    }

    /// Sequence number of the last iteration started.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn ready_agents(&self) -> Vec<&str> {
        self.bound.iter().map(|b| b.name.as_str()).collect()
    }

    pub fn crippled_agents(&self) -> &[String] {
        &self.crippled
    }

    /// Close the listener and every connection, then stop the pool.
    pub async fn terminate(&mut self) {
        if self.listener.take().is_some() {
            tracing::debug!(addr = %self.local_addr, "Listener closed");
        }
        self.pending.clear();
        let close_timeout = self.config.close_timeout;
        for agent in self.bound.drain(..) {
            let mut link = agent.link.lock().await;
            match tokio::time::timeout(close_timeout, link.writer.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(agent = %agent.name, error = %e, "Error closing connection");
                }
                Err(_) => {
                    tracing::warn!(agent = %agent.name, ?close_timeout, "Agent not reading, dropping connection unflushed");
                }
            }
        }
        self.pool.shutdown().await;
        tracing::info!("Orchestrator terminated");
    }
}

fn lock_table(table: &StdMutex<ResponseTable>) -> MutexGuard<'_, ResponseTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn round_trip(
    agent_name: String,
    link: Arc<Mutex<AgentLink>>,
    table: Arc<StdMutex<ResponseTable>>,
    seq: u64,
    status: AgentStatus,
    timeout: Duration,
) {
    let deadline = Instant::now() + timeout;
    let mut link = link.lock().await;
    link.receiver.clear();

    let request = Request::Iteration {
        agent_name: agent_name.clone(),
        seq,
        current_status: status,
    };
    // An unsent tail stays buffered in the writer and goes out ahead of the next frame.
    match tokio::time::timeout_at(deadline, link.writer.send_message(request)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(agent = %agent_name, seq, error = %e, "Iteration send failed");
            return;
        }
        Err(_) => {
            tracing::warn!(agent = %agent_name, seq, ?timeout, "Agent not reading, iteration send timed out");
            return;
        }
    }

    match link.receiver.pull_iteration_until(seq, deadline).await {
        Some(Response::Iteration {
            elapsed,
            decision,
            debug,
            ..
        }) => {
            lock_table(&table).insert(
                agent_name,
                AgentResponse {
                    decision,
                    elapsed,
                    debug,
                },
            );
        }
        Some(Response::Failed { error, .. }) => {
            tracing::warn!(agent = %agent_name, seq, %error, "Agent reported failure");
        }
        Some(other) => {
            tracing::warn!(agent = %agent_name, seq, ?other, "Unexpected iteration answer");
        }
        None => {
            tracing::warn!(agent = %agent_name, seq, ?timeout, "No iteration answer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::connection::ClientConnection;
    use crate::client::{AgentPlugin, AgentRegistry, ConnectOptions, PluginError, run_agent};
    use serde_json::json;

    /// Answers every tick; sleeps for `delay` on ticks listed in `slow_ticks`.
    struct Ticker {
        delay: Duration,
        slow_ticks: Vec<u64>,
    }

    #[async_trait::async_trait]
    impl AgentPlugin for Ticker {
        fn name(&self) -> &str {
            "ticker"
        }

        async fn initialize(&mut self, _status: &AgentStatus) -> Result<(), PluginError> {
            Ok(())
        }

        async fn run_one_iteration(
            &mut self,
            status: &AgentStatus,
        ) -> Result<Decision, PluginError> {
            if self.slow_ticks.contains(&status.tick) {
                tokio::time::sleep(self.delay).await;
            }
            Ok(Decision::new(json!({ "tick": status.tick })))
        }
    }

    fn registry() -> Arc<AgentRegistry> {
        let mut registry = AgentRegistry::new();
        registry
            .register("ticker", |_| {
                Box::new(Ticker {
                    delay: Duration::ZERO,
                    slow_ticks: Vec::new(),
                })
            })
            .register("hang", |_| {
                Box::new(Ticker {
                    delay: Duration::from_secs(30),
                    slow_ticks: (0..100).collect(),
                })
            })
            .register("slow-start", |_| {
                Box::new(Ticker {
                    delay: Duration::from_millis(300),
                    slow_ticks: vec![1],
                })
            });
        Arc::new(registry)
    }

    async fn server(expected: usize) -> OrchestratorServer {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), expected)
            .with_handshake_timeout(Duration::from_millis(500));
        OrchestratorServer::listen(config, expected).await.unwrap()
    }

    fn spawn_agents(server: &OrchestratorServer, agents: &[AgentConfig]) {
        let addr = server.local_addr();
        for agent in agents {
            let name = agent.name.clone();
            tokio::spawn(async move {
                let _ = run_agent(&name, addr, registry(), &ConnectOptions::default()).await;
            });
        }
    }

    fn statuses(agents: &[AgentConfig], tick: u64) -> HashMap<String, AgentStatus> {
        agents
            .iter()
            .map(|a| (a.name.clone(), AgentStatus::alive(tick, json!({}))))
            .collect()
    }

    async fn bound_server(agents: &[AgentConfig]) -> (OrchestratorServer, BindReport) {
        let mut server = server(agents.len()).await;
        spawn_agents(&server, agents);
        let accepted = server
            .accept_all(agents.len(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(accepted, agents.len());
        let report = server
            .bind_agents(agents, &statuses(agents, 0), Duration::from_secs(1))
            .await;
        (server, report)
    }

    #[tokio::test]
    async fn two_agents_answer_every_iteration() {
        let agents = [
            AgentConfig::new("car-0", "ticker"),
            AgentConfig::new("car-1", "ticker"),
        ];
        let (mut server, report) = bound_server(&agents).await;
        assert_eq!(report.ready, ["car-0", "car-1"]);
        assert!(report.crippled.is_empty());

        for tick in 1..=3 {
            let scheduled = server
                .run_iteration(&statuses(&agents, tick), Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(scheduled, 2);

            let table = server.response_table();
            assert_eq!(table.len(), 2);
            for agent in &agents {
                let response = &table[&agent.name];
                assert!(response.elapsed >= 0.0);
                assert_eq!(response.decision.value(), &json!({ "tick": tick }));
            }
        }

        server.terminate().await;
    }

    #[tokio::test]
    async fn hung_agent_is_absent_and_does_not_stall() {
        let agents = [
            AgentConfig::new("healthy", "ticker"),
            AgentConfig::new("stuck", "hang"),
        ];
        let (mut server, report) = bound_server(&agents).await;
        assert_eq!(report.ready.len(), 2);

        let started = std::time::Instant::now();
        server
            .run_iteration(&statuses(&agents, 1), Duration::from_millis(200))
            .await
            .unwrap();
        let took = started.elapsed();

        assert!(took >= Duration::from_millis(200));
        assert!(took < Duration::from_secs(1), "iteration took {took:?}");
        let table = server.response_table();
        assert_eq!(table.keys().collect::<Vec<_>>(), ["healthy"]);

        server.terminate().await;
    }

    #[tokio::test]
    async fn late_answer_is_not_used_for_next_iteration() {
        let agents = [AgentConfig::new("car-0", "slow-start")];
        let (mut server, _) = bound_server(&agents).await;

        server
            .run_iteration(&statuses(&agents, 1), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(server.response_table().is_empty());

        server
            .run_iteration(&statuses(&agents, 2), Duration::from_secs(1))
            .await
            .unwrap();
        let table = server.response_table();
        assert_eq!(table["car-0"].decision.value(), &json!({ "tick": 2 }));

        server.terminate().await;
    }

    #[tokio::test]
    async fn missing_and_failing_agents_are_crippled() {
        let agents = [
            AgentConfig::new("car-0", "ticker"),
            AgentConfig::new("car-1", "warp-drive"),
            AgentConfig::new("car-2", "ticker"),
        ];
        let mut server = server(agents.len()).await;
        // car-2 never starts
        spawn_agents(&server, &agents[..2]);

        let accepted = server
            .accept_all(agents.len(), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(accepted, 2);

        let report = server
            .bind_agents(&agents, &statuses(&agents, 0), Duration::from_secs(1))
            .await;
        assert_eq!(report.ready, ["car-0"]);
        assert_eq!(report.crippled, ["car-1", "car-2"]);

        let scheduled = server
            .run_iteration(&statuses(&agents, 1), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(scheduled, 1);
        assert_eq!(server.response_table().len(), 1);

        server.terminate().await;
    }

    #[tokio::test]
    async fn excluded_and_eliminated_agents_are_skipped() {
        let agents = [
            AgentConfig::new("car-0", "ticker"),
            AgentConfig::new("car-1", "ticker"),
            AgentConfig::new("car-2", "ticker"),
        ];
        let (mut server, _) = bound_server(&agents).await;

        let mut statuses = statuses(&agents, 1);
        statuses.insert("car-1".to_string(), AgentStatus::eliminated(1));
        server.set_excluded(["car-2"]);

        let scheduled = server
            .run_iteration(&statuses, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(scheduled, 1);
        assert_eq!(
            server.response_table().keys().collect::<Vec<_>>(),
            ["car-0"]
        );

        server.set_excluded(Vec::<String>::new());
        statuses.insert("car-1".to_string(), AgentStatus::alive(2, json!({})));
        server
            .run_iteration(&statuses, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(server.response_table().len(), 2);

        server.terminate().await;
    }

    /// Connects as `name`, prefixes the hello frame with `after_hello` raw bytes,
    /// answers initialize and then never reads again.
    fn spawn_deaf_peer(
        addr: SocketAddr,
        name: &'static str,
        after_hello: Vec<u8>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            let mut conn: ClientConnection =
                Connection::new(stream, DEFAULT_MAX_FRAME_LENGTH).unwrap();
            conn.send_message(Response::Hello {
                agent_name: name.to_string(),
            })
            .await
            .unwrap();
            if !after_hello.is_empty() {
                conn.send_bytes(&after_hello).await.unwrap();
            }

            let request = conn.receive_message().await.unwrap();
            assert!(matches!(request, Request::Initialize { .. }));
            conn.send_message(Response::Initialize { elapsed: 0.0 })
                .await
                .unwrap();

            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(conn);
        })
    }

    #[tokio::test]
    async fn agent_that_stops_reading_cannot_stall_iterations() {
        let agents = [
            AgentConfig::new("healthy", "ticker"),
            AgentConfig::new("deaf", "ticker"),
        ];
        let mut server = server(agents.len()).await;
        spawn_agents(&server, &agents[..1]);
        let _deaf = spawn_deaf_peer(server.local_addr(), "deaf", Vec::new());

        assert_eq!(
            server
                .accept_all(agents.len(), Duration::from_secs(5))
                .await
                .unwrap(),
            2
        );
        let report = server
            .bind_agents(&agents, &statuses(&agents, 0), Duration::from_secs(1))
            .await;
        assert_eq!(report.ready.len(), 2);

        // large enough that a few unread requests fill the socket buffers
        let blob = "x".repeat(3 * 1024 * 1024);
        for tick in 1..=4 {
            let mut statuses = statuses(&agents, tick);
            statuses.insert("deaf".to_string(), AgentStatus::alive(tick, json!({ "blob": blob })));

            let started = std::time::Instant::now();
            let finished = tokio::time::timeout(
                Duration::from_secs(5),
                server.run_iteration(&statuses, Duration::from_millis(200)),
            )
            .await;
            let took = started.elapsed();

            assert!(finished.is_ok(), "iteration {tick} stalled");
            assert!(took < Duration::from_secs(1), "iteration {tick} took {took:?}");
            let table = server.response_table();
            assert_eq!(table.keys().collect::<Vec<_>>(), ["healthy"]);
            assert_eq!(table["healthy"].decision.value(), &json!({ "tick": tick }));
        }

        let closed = tokio::time::timeout(Duration::from_secs(3), server.terminate()).await;
        assert!(closed.is_ok(), "terminate blocked on an agent that is not reading");
    }

    #[tokio::test]
    async fn bytes_sent_before_initialize_are_discarded() {
        let agents = [AgentConfig::new("chatty", "ticker")];
        let mut server = server(1).await;

        let mut junk = 3u32.to_be_bytes().to_vec();
        junk.extend_from_slice(b"???");
        let _peer = spawn_deaf_peer(server.local_addr(), "chatty", junk);

        assert_eq!(
            server.accept_all(1, Duration::from_secs(5)).await.unwrap(),
            1
        );
        // let the junk frame land before binding
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = server
            .bind_agents(&agents, &statuses(&agents, 0), Duration::from_secs(1))
            .await;
        assert_eq!(report.ready, ["chatty"]);
        assert!(report.crippled.is_empty());

        server.terminate().await;
    }

    #[tokio::test]
    async fn connection_without_hello_is_dropped() {
        let mut server = server(1).await;
        let addr = server.local_addr();
        let _silent = tokio::net::TcpStream::connect(addr).await.unwrap();

        let accepted = server
            .accept_all(1, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(accepted, 0);
        server.terminate().await;
    }

    #[tokio::test]
    async fn accept_after_terminate_fails() {
        let mut server = server(1).await;
        server.terminate().await;
        assert!(matches!(
            server.accept_all(1, Duration::from_millis(10)).await,
            Err(TransportError::Accept(_))
        ));
    }
}
