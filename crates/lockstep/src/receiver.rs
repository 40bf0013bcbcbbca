//! Background receive task with a one-slot mailbox.
//!
//! Each bound connection gets a task that keeps reading responses and parks the latest
//! one in a [`Mailbox`]. Callers pull from the mailbox with a deadline; a timeout does not
//! cancel the socket read, so a late response simply lands in the slot and is
//! overwritten or discarded later.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bridge::connection::FrameReader;
use crate::bridge::protocol::Response;

#[derive(Default)]
struct MailboxState {
    slot: Option<Response>,
    closed: bool,
    overwritten: u64,
}

/// Single-slot, latest-wins buffer between the receive task and the puller.
#[derive(Default)]
pub struct Mailbox {
    state: StdMutex<MailboxState>,
    notify: Notify,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a response, replacing any undelivered one.
    pub fn put(&self, response: Response) {
        {
            let mut state = self.lock();
            if state.slot.replace(response).is_some() {
                state.overwritten += 1;
                tracing::debug!(
                    overwritten = state.overwritten,
                    "Undelivered response overwritten"
                );
            }
        }
        self.notify.notify_one();
    }

    pub fn take(&self) -> Option<Response> {
        self.lock().slot.take()
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of responses that were replaced before anyone pulled them.
    pub fn overwritten(&self) -> u64 {
        self.lock().overwritten
    }
}

/// Owns the receive task for one connection.
///
/// Pulling takes `&mut self`, so there is never more than one outstanding pull.
pub struct Receiver {
    agent_name: String,
    mailbox: Arc<Mailbox>,
    task: JoinHandle<()>,
    presumed_dead: bool,
}

impl Receiver {
    /// Start the receive task. Must be called from within a tokio runtime.
    pub fn spawn(agent_name: impl Into<String>, reader: FrameReader<Response>) -> Self {
        let agent_name = agent_name.into();
        let mailbox = Arc::new(Mailbox::new());
        let task = tokio::spawn(receive_loop(
            agent_name.clone(),
            reader,
            Arc::clone(&mailbox),
        ));
        Self {
            agent_name,
            mailbox,
            task,
            presumed_dead: false,
        }
    }

    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Set when the last pull timed out or the connection is gone.
    pub fn is_presumed_dead(&self) -> bool {
        self.presumed_dead
    }

    /// Discard a buffered response, if any.
    pub fn clear(&mut self) -> Option<Response> {
        let stale = self.mailbox.take();
        if stale.is_some() {
            tracing::debug!(agent = %self.agent_name, "Discarded unread response");
        }
        stale
    }

    /// Wait up to `timeout` for a response and take it out of the mailbox.
    ///
    /// Returns `None` on timeout or when the connection has closed with nothing buffered.
    pub async fn pull_with_timeout(&mut self, timeout: Duration) -> Option<Response> {
        self.pull_until(Instant::now() + timeout).await
    }

    async fn pull_until(&mut self, deadline: Instant) -> Option<Response> {
        loop {
            if let Some(response) = self.mailbox.take() {
                self.presumed_dead = false;
                return Some(response);
            }
            if self.mailbox.is_closed() {
                tracing::debug!(agent = %self.agent_name, "Pull on closed connection");
                self.presumed_dead = true;
                return None;
            }
            if tokio::time::timeout_at(deadline, self.mailbox.notify.notified())
                .await
                .is_err()
            {
                if let Some(response) = self.mailbox.take() {
                    self.presumed_dead = false;
                    return Some(response);
                }
                tracing::warn!(agent = %self.agent_name, "No response before deadline");
                self.presumed_dead = true;
                return None;
            }
        }
    }

    /// Pull the answer to iteration `seq`, dropping answers to earlier iterations.
    ///
    /// A `Failed` response counts as the answer unless it names another iteration.
    pub async fn pull_iteration(&mut self, seq: u64, timeout: Duration) -> Option<Response> {
        self.pull_iteration_until(seq, Instant::now() + timeout).await
    }

    /// Like [`pull_iteration`](Self::pull_iteration), against an absolute deadline.
    pub async fn pull_iteration_until(&mut self, seq: u64, deadline: Instant) -> Option<Response> {
        loop {
            let response = self.pull_until(deadline).await?;
            match response {
                Response::Iteration { seq: got, .. } if got == seq => return Some(response),
                Response::Iteration { seq: got, .. } => {
                    tracing::debug!(
                        agent = %self.agent_name,
                        expected = seq,
                        got,
                        "Dropping stale iteration response"
                    );
                }
                Response::Failed { seq: Some(got), .. } if got != seq => {
                    tracing::debug!(
                        agent = %self.agent_name,
                        expected = seq,
                        got,
                        "Dropping stale failure report"
                    );
                }
                Response::Failed { .. } => return Some(response),
                other => {
                    tracing::warn!(agent = %self.agent_name, ?other, "Unexpected response while waiting for iteration");
                }
            }
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn receive_loop(agent_name: String, mut reader: FrameReader<Response>, mailbox: Arc<Mailbox>) {
    loop {
        match reader.next().await {
            Some(Ok(response)) => mailbox.put(response),
            Some(Err(e)) => {
                tracing::error!(agent = %agent_name, error = %e, "Receive failed, connection unusable");
                break;
            }
            None => {
                tracing::debug!(agent = %agent_name, "Connection closed by agent");
                break;
            }
        }
    }
    mailbox.close();
}
