//! Pause / speed / step control for the world loop.
//!
//! Commands can be pushed from any thread (e.g. a stdin reader) and take effect on the
//! next [`PlaybackController::flush`], so the loop sees one consistent status per tick.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

pub const MIN_SPEED: f64 = 0.1;
pub const MAX_SPEED: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlaybackCommand {
    TogglePause,
    SetSpeed(f64),
    Terminate,
    /// Pause and allow this many more iterations.
    Step(u32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackStatus {
    pub paused: bool,
    pub speed: f64,
    pub terminated: bool,
    pub remaining_steps: u32,
}

impl Default for PlaybackStatus {
    fn default() -> Self {
        Self {
            paused: false,
            speed: 1.0,
            terminated: false,
            remaining_steps: 0,
        }
    }
}

impl PlaybackStatus {
    fn apply(&mut self, command: PlaybackCommand) {
        match command {
            PlaybackCommand::TogglePause => self.paused = !self.paused,
            PlaybackCommand::SetSpeed(speed) if speed.is_finite() => {
                self.speed = speed.clamp(MIN_SPEED, MAX_SPEED);
            }
            PlaybackCommand::SetSpeed(speed) => {
                tracing::warn!(speed, "Ignoring non-finite speed");
            }
            PlaybackCommand::Terminate => self.terminated = true,
            PlaybackCommand::Step(n) => {
                self.paused = true;
                self.remaining_steps = self.remaining_steps.saturating_add(n);
            }
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseCommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("invalid argument '{0}'")]
    InvalidArgument(String),
}

/// Parse one line of user input: `p`, `speed <x>`, `step [n]` or `q`.
pub fn parse_command(line: &str) -> Result<PlaybackCommand, ParseCommandError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err(ParseCommandError::Empty);
    };
    let arg = words.next();

    match verb {
        "p" | "pause" => Ok(PlaybackCommand::TogglePause),
        "q" | "quit" => Ok(PlaybackCommand::Terminate),
        "speed" => {
            let arg = arg.ok_or_else(|| ParseCommandError::InvalidArgument(String::new()))?;
            arg.parse::<f64>()
                .ok()
                .filter(|s| s.is_finite())
                .map(PlaybackCommand::SetSpeed)
                .ok_or_else(|| ParseCommandError::InvalidArgument(arg.to_string()))
        }
        "s" | "step" => match arg {
            None => Ok(PlaybackCommand::Step(1)),
            Some(n) => n
                .parse()
                .map(PlaybackCommand::Step)
                .map_err(|_| ParseCommandError::InvalidArgument(n.to_string())),
        },
        other => Err(ParseCommandError::Unknown(other.to_string())),
    }
}

#[derive(Debug, Default)]
pub struct PlaybackController {
    queue: Mutex<VecDeque<PlaybackCommand>>,
    status: Mutex<PlaybackStatus>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PlaybackController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a command; it takes effect on the next `flush`.
    pub fn push(&self, command: PlaybackCommand) {
        tracing::debug!(?command, "Playback command queued");
        lock(&self.queue).push_back(command);
    }

    /// Queue `Terminate` once `signal` fires, e.g. `tokio::signal::ctrl_c()`.
    ///
    /// The watcher is spawned right away, so a signal that arrives while the loop is busy
    /// mid-iteration is still seen on the next flush.
    pub fn terminate_on<F>(self: &Arc<Self>, signal: F) -> JoinHandle<()>
    where
        F: Future<Output = io::Result<()>> + Send + 'static,
    {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            match signal.await {
                Ok(()) => {
                    tracing::info!("Interrupted");
                    controller.push(PlaybackCommand::Terminate);
                }
                Err(e) => tracing::warn!(error = %e, "Interrupt watcher unavailable"),
            }
        })
    }

    /// Apply every queued command in order and return the resulting status.
    pub fn flush(&self) -> PlaybackStatus {
        let commands: Vec<_> = lock(&self.queue).drain(..).collect();
        let mut status = lock(&self.status);
        for command in commands {
            status.apply(command);
        }
        *status
    }

    pub fn status(&self) -> PlaybackStatus {
        *lock(&self.status)
    }

    pub fn is_terminated(&self) -> bool {
        lock(&self.status).terminated
    }

    /// Whether the loop should advance this tick. Consumes one step while paused.
    pub fn maybe_step(&self) -> bool {
        let mut status = lock(&self.status);
        if !status.paused {
            return true;
        }
        if status.remaining_steps > 0 {
            status.remaining_steps -= 1;
            return true;
        }
        false
    }

    /// Wall time between ticks at the current speed.
    pub fn tick_interval(&self, base: Duration) -> Duration {
        base.div_f64(lock(&self.status).speed)
    }
}
