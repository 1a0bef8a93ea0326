//! Side-effecting actions fired by the proxy, usually to wake or stop a
//! backend, and the combinators that schedule them.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("rate limit exceeded: {max_allowed} firings per {window:?}")]
    RateLimitExceeded { max_allowed: usize, window: Duration },

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with status {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("delay trigger worker has stopped")]
    WorkerStopped,

    #[error("invalid command line '{command_line}': {reason}")]
    InvalidCommandLine { command_line: String, reason: String },
}

/// A parameterless action. Safe to fire from any task.
#[async_trait]
pub trait Trigger: Send + Sync {
    async fn fire(&self) -> Result<(), TriggerError>;
}

/// Fires each trigger in order, stopping at the first failure
pub struct CompoundTrigger {
    triggers: Vec<Arc<dyn Trigger>>,
}

impl CompoundTrigger {
    pub fn new(triggers: Vec<Arc<dyn Trigger>>) -> Self {
        Self { triggers }
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}

#[async_trait]
impl Trigger for CompoundTrigger {
    async fn fire(&self) -> Result<(), TriggerError> {
        for trigger in &self.triggers {
            trigger.fire().await?;
        }
        Ok(())
    }
}

#[derive(Debug)]
enum DelayMessage {
    Reset,
    Shutdown,
}

enum WorkerState {
    Idle,
    Running(mpsc::UnboundedSender<DelayMessage>),
    Closed,
}

/// Fires its target once `delay` has passed without another `fire`.
///
/// The worker task is started by the first `fire` and owns the timer; callers
/// only ever send it messages.
pub struct DelayTrigger {
    target: Arc<dyn Trigger>,
    delay: Duration,
    worker: Mutex<WorkerState>,
}

impl DelayTrigger {
    pub fn new(target: Arc<dyn Trigger>, delay: Duration) -> Self {
        Self {
            target,
            delay,
            worker: Mutex::new(WorkerState::Idle),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Stop the worker, dropping any pending firing
    pub fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.worker.lock(), WorkerState::Closed);
        if let WorkerState::Running(tx) = previous {
            let _ = tx.send(DelayMessage::Shutdown);
        }
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<DelayMessage>, TriggerError> {
        let mut worker = self.worker.lock();
        match &*worker {
            WorkerState::Running(tx) if !tx.is_closed() => Ok(tx.clone()),
            WorkerState::Closed => Err(TriggerError::WorkerStopped),
            _ => {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(delay_worker(Arc::clone(&self.target), self.delay, rx));
                *worker = WorkerState::Running(tx.clone());
                Ok(tx)
            }
        }
    }
}

impl fmt::Debug for DelayTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayTrigger")
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl Drop for DelayTrigger {
    fn drop(&mut self) {
        if let WorkerState::Running(tx) = &*self.worker.get_mut() {
            let _ = tx.send(DelayMessage::Shutdown);
        }
    }
}

#[async_trait]
impl Trigger for DelayTrigger {
    async fn fire(&self) -> Result<(), TriggerError> {
        self.sender()?
            .send(DelayMessage::Reset)
            .map_err(|_| TriggerError::WorkerStopped)
    }
}

async fn delay_worker(
    target: Arc<dyn Trigger>,
    delay: Duration,
    mut rx: mpsc::UnboundedReceiver<DelayMessage>,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(DelayMessage::Reset) => {
                    deadline = Some(Instant::now() + delay);
                }
                Some(DelayMessage::Shutdown) | None => {
                    debug!("Delay trigger worker exiting");
                    return;
                }
            },
            _ = sleep_until(deadline), if deadline.is_some() => {
                deadline = None;
                if let Err(e) = target.fire().await {
                    error!(error = %e, "Delayed trigger failed");
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}

/// Passes at most `max_allowed` firings per rolling `window` to its target
pub struct RateLimitTrigger {
    target: Arc<dyn Trigger>,
    max_allowed: usize,
    window: Duration,
    history: Mutex<VecDeque<Instant>>,
}

impl RateLimitTrigger {
    pub fn new(target: Arc<dyn Trigger>, max_allowed: usize, window: Duration) -> Self {
        Self {
            target,
            max_allowed,
            window,
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a firing if the window allows it
    fn admit(&self) -> bool {
        let now = Instant::now();
        let mut history = self.history.lock();

        while let Some(&oldest) = history.front() {
            if now.duration_since(oldest) >= self.window {
                history.pop_front();
            } else {
                break;
            }
        }

        if history.len() >= self.max_allowed {
            return false;
        }
        history.push_back(now);
        true
    }
}

#[async_trait]
impl Trigger for RateLimitTrigger {
    async fn fire(&self) -> Result<(), TriggerError> {
        if !self.admit() {
            warn!(
                max_allowed = self.max_allowed,
                window_secs = self.window.as_secs_f64(),
                "Trigger rate limit exceeded"
            );
            return Err(TriggerError::RateLimitExceeded {
                max_allowed: self.max_allowed,
                window: self.window,
            });
        }
        self.target.fire().await
    }
}

/// Runs an external command, failing on a non-zero exit
#[derive(Debug, Clone)]
pub struct ShellTrigger {
    command: String,
    args: Vec<String>,
}

impl ShellTrigger {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    /// Split a shell-style command line into a command and its arguments
    pub fn from_command_line(command_line: &str) -> Result<Self, TriggerError> {
        let mut words = shell_words::split(command_line).map_err(|e| TriggerError::InvalidCommandLine {
            command_line: command_line.to_string(),
            reason: e.to_string(),
        })?;
        if words.is_empty() {
            return Err(TriggerError::InvalidCommandLine {
                command_line: command_line.to_string(),
                reason: "empty command".to_string(),
            });
        }
        let command = words.remove(0);
        Ok(Self::new(command, words))
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl Trigger for ShellTrigger {
    async fn fire(&self) -> Result<(), TriggerError> {
        debug!(command = %self.command, args = ?self.args, "Running trigger command");

        let output = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TriggerError::Spawn {
                command: self.command.clone(),
                source: e,
            })?;

        if !output.stdout.is_empty() {
            debug!(
                command = %self.command,
                stdout = %String::from_utf8_lossy(&output.stdout).trim_end(),
                "Trigger command output"
            );
        }

        if !output.status.success() {
            return Err(TriggerError::CommandFailed {
                command: self.command.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            });
        }
        Ok(())
    }
}
