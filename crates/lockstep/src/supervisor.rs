//! Process supervisor - launches, kills and reaps one OS process per agent.
//!
//! Every child gets a supervising task that waits for it to exit (or for a kill request)
//! and reports the exit over a channel. The supervisor never tracks more than
//! `capacity` live children: `start` blocks on `wait_for_one` when the cap is reached.

use std::ffi::OsString;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker for agent '{agent_name}': {source}")]
    Spawn {
        agent_name: String,
        #[source]
        source: io::Error,
    },
    #[error("worker for agent '{0}' exited before its pid could be read")]
    NoPid(String),
    #[error("no tracked worker processes")]
    Empty,
}

/// What happened to a tracked child.
#[derive(Debug)]
pub struct ExitReport {
    pub pid: u32,
    pub agent_name: String,
    /// `None` when waiting on the child itself failed.
    pub status: Option<ExitStatus>,
    /// The supervisor asked for this exit.
    pub killed: bool,
}

impl ExitReport {
    pub fn is_abnormal(&self) -> bool {
        !self.killed && !self.status.is_some_and(|s| s.success())
    }
}

struct WorkerRecord {
    pid: u32,
    agent_name: String,
    kill: CancellationToken,
    stopping: bool,
}

struct ChildExit {
    pid: u32,
    status: io::Result<ExitStatus>,
    killed: bool,
}

pub struct ProcessSupervisor {
    capacity: usize,
    records: Vec<WorkerRecord>,
    exits_tx: mpsc::UnboundedSender<ChildExit>,
    exits_rx: mpsc::UnboundedReceiver<ChildExit>,
}

impl ProcessSupervisor {
    /// # Panics
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "supervisor capacity must be positive");
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            capacity,
            records: Vec::with_capacity(capacity),
            exits_tx,
            exits_rx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn live_count(&self) -> usize {
        self.records.len()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.records.iter().map(|r| r.pid).collect()
    }

    /// Launch `command` for `agent_name`, waiting for a free slot first if at capacity.
    pub async fn start(
        &mut self,
        agent_name: &str,
        mut command: Command,
    ) -> Result<u32, SupervisorError> {
        if self.records.len() >= self.capacity {
            tracing::debug!(capacity = self.capacity, "At process capacity, waiting for an exit");
            self.wait_for_one().await?;
        }

        command.kill_on_drop(true);
        let mut child = command.spawn().map_err(|source| SupervisorError::Spawn {
            agent_name: agent_name.to_string(),
            source,
        })?;
        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::NoPid(agent_name.to_string()))?;

        let kill = CancellationToken::new();
        let token = kill.clone();
        let exits_tx = self.exits_tx.clone();
        let name = agent_name.to_string();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                status = child.wait() => Some(status),
                _ = token.cancelled() => None,
            };
            let (status, killed) = match outcome {
                Some(status) => (status, false),
                None => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(agent = %name, pid, error = %e, "Failed to kill worker");
                    }
                    (child.wait().await, true)
                }
            };
            let _ = exits_tx.send(ChildExit {
                pid,
                status,
                killed,
            });
        });

        tracing::info!(agent = %agent_name, pid, "Worker process started");
        self.records.push(WorkerRecord {
            pid,
            agent_name: agent_name.to_string(),
            kill,
            stopping: false,
        });
        Ok(pid)
    }

    /// Wait until any tracked child exits and stop tracking it.
    pub async fn wait_for_one(&mut self) -> Result<ExitReport, SupervisorError> {
        loop {
            if self.records.is_empty() {
                return Err(SupervisorError::Empty);
            }
            let Some(exit) = self.exits_rx.recv().await else {
                // we hold a sender, so the channel never closes
                return Err(SupervisorError::Empty);
            };
            if let Some(report) = self.settle(exit) {
                return Ok(report);
            }
        }
    }

    /// Collect children that have already exited, without blocking.
    pub fn try_reap(&mut self) -> Vec<ExitReport> {
        let mut reports = Vec::new();
        while let Ok(exit) = self.exits_rx.try_recv() {
            if let Some(report) = self.settle(exit) {
                reports.push(report);
            }
        }
        reports
    }

    /// Force-terminate every tracked child and reap all of them.
    pub async fn kill_all(&mut self) -> Vec<ExitReport> {
        for record in &self.records {
            record.kill.cancel();
        }
        let mut reports = Vec::with_capacity(self.records.len());
        while let Ok(report) = self.wait_for_one().await {
            reports.push(report);
        }
        reports
    }

    /// Ask every child to exit with SIGTERM, then kill whatever is left after `grace`.
    #[cfg(unix)]
    pub async fn terminate_all(&mut self, grace: Duration) -> Vec<ExitReport> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        for record in &mut self.records {
            record.stopping = true;
            if let Err(e) = kill(Pid::from_raw(record.pid as i32), Signal::SIGTERM) {
                tracing::debug!(agent = %record.agent_name, pid = record.pid, error = %e, "SIGTERM failed");
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        let mut reports = Vec::with_capacity(self.records.len());
        while !self.records.is_empty() {
            match tokio::time::timeout_at(deadline, self.wait_for_one()).await {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(_)) | Err(_) => break,
            }
        }
        if !self.records.is_empty() {
            tracing::warn!(remaining = self.records.len(), "Workers ignored SIGTERM, killing");
        }
        reports.extend(self.kill_all().await);
        reports
    }

    #[cfg(not(unix))]
    pub async fn terminate_all(&mut self, _grace: Duration) -> Vec<ExitReport> {
        self.kill_all().await
    }

    fn settle(&mut self, exit: ChildExit) -> Option<ExitReport> {
        let index = self.records.iter().position(|r| r.pid == exit.pid)?;
        let record = self.records.swap_remove(index);

        let status = match exit.status {
            Ok(status) => Some(status),
            Err(e) => {
                tracing::error!(agent = %record.agent_name, pid = exit.pid, error = %e, "Failed to wait on worker");
                None
            }
        };
        let report = ExitReport {
            pid: exit.pid,
            agent_name: record.agent_name,
            status,
            killed: exit.killed || record.stopping,
        };

        if report.is_abnormal() {
            tracing::warn!(
                agent = %report.agent_name,
                pid = report.pid,
                status = ?report.status,
                "Worker process exited abnormally"
            );
        } else {
            tracing::debug!(agent = %report.agent_name, pid = report.pid, status = ?report.status, "Worker process reaped");
        }
        Some(report)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        for record in &self.records {
            record.kill.cancel();
        }
    }
}

/// Everything a spawner needs to launch the worker for one agent.
#[derive(Debug, Clone)]
pub struct AgentSpawnConfig {
    pub agent_name: String,
    pub agent_type: String,
    pub addr: SocketAddr,
}

/// Extension point for different worker launch strategies.
pub trait AgentSpawner: Send + Sync {
    fn command(&self, config: &AgentSpawnConfig) -> Command;
}

/// Launches a worker executable that speaks the agent protocol.
///
/// The executable receives `--name <agent> --type <plugin> --addr <host:port>`.
#[derive(Debug, Clone)]
pub struct BinarySpawner {
    program: PathBuf,
    extra_args: Vec<OsString>,
    inherit_stderr: bool,
}

impl BinarySpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
            inherit_stderr: true,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_inherit_stderr(mut self, inherit: bool) -> Self {
        self.inherit_stderr = inherit;
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl AgentSpawner for BinarySpawner {
    fn command(&self, config: &AgentSpawnConfig) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--name")
            .arg(&config.agent_name)
            .arg("--type")
            .arg(&config.agent_type)
            .arg("--addr")
            .arg(config.addr.to_string())
            .args(&self.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null());
        if !self.inherit_stderr {
            cmd.stderr(Stdio::null());
        }
        cmd
    }
}
