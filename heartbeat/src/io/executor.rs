//! Executor abstraction for agent delegation.
//!
//! The [`Executor`] trait decouples the cycle loop from the agent backend
//! (by default a `codex exec` child process). An invocation returns a
//! [`Completion`] immediately; the caller blocks on it for the final reply.
//! Tests substitute scripted executors that answer without spawning anything.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::atomic::write_atomic;
use crate::io::config::ExecutorConfig;
use crate::io::process::run_command_with_timeout;

/// An isolated conversation opened for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub title: String,
}

impl Session {
    pub fn for_cycle(cycle: u64) -> Self {
        Self {
            id: format!("cycle-{cycle}"),
            title: format!("Heartbeat Cycle {cycle}"),
        }
    }
}

/// One-shot handle to an in-flight delegation.
#[derive(Debug)]
pub struct Completion {
    rx: Receiver<Result<String>>,
}

impl Completion {
    /// Create a pending completion and the sender that resolves it.
    pub fn channel() -> (Sender<Result<String>>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx })
    }

    /// A completion that is already resolved.
    pub fn ready(result: Result<String>) -> Self {
        let (tx, completion) = Self::channel();
        // The receiver is alive in `completion`, so this send cannot fail.
        let _ = tx.send(result);
        completion
    }

    /// Block until the executor reports its final text.
    pub fn wait(self) -> Result<String> {
        self.rx
            .recv()
            .map_err(|_| anyhow!("executor dropped the completion without replying"))?
    }
}

/// Abstraction over agent execution backends.
pub trait Executor {
    /// Open a fresh session for `cycle`.
    fn open_session(&self, cycle: u64) -> Result<Session> {
        Ok(Session::for_cycle(cycle))
    }

    /// Hand `prompt` to the agent within `session`.
    fn invoke(&self, session: &Session, prompt: &str) -> Result<Completion>;
}

/// Executor that runs the configured command with the prompt on stdin and
/// takes its stdout as the final reply.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    sessions_dir: PathBuf,
}

impl CommandExecutor {
    pub fn from_config(config: &ExecutorConfig, sessions_dir: PathBuf) -> Result<Self> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("executor.command must be a non-empty array"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
            sessions_dir,
        })
    }

    fn run(&self, session: &Session, prompt: &str) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run {}", self.program))?;

        let log_path = self.sessions_dir.join(format!("{}.log", session.id));
        if let Err(err) = write_atomic(&log_path, &output.transcript()) {
            warn!(log = %log_path.display(), err = ?err, "failed to write session log");
        }

        if output.timed_out {
            return Err(anyhow!(
                "{} timed out after {:?}",
                self.program,
                self.timeout
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "{} failed with status {:?}",
                self.program,
                output.status.code()
            ));
        }
        Ok(output.stdout_lossy())
    }
}

impl Executor for CommandExecutor {
    #[instrument(skip_all, fields(session = %session.id, program = %self.program))]
    fn invoke(&self, session: &Session, prompt: &str) -> Result<Completion> {
        fs::create_dir_all(&self.sessions_dir)
            .with_context(|| format!("create sessions dir {}", self.sessions_dir.display()))?;
        info!(title = %session.title, prompt_bytes = prompt.len(), "delegating to agent");

        let (tx, completion) = Completion::channel();
        let worker = self.clone();
        let session = session.clone();
        let prompt = prompt.to_string();
        thread::Builder::new()
            .name(format!("executor-{}", session.id))
            .spawn(move || {
                let result = worker.run(&session, &prompt);
                debug!(session = %session.id, ok = result.is_ok(), "agent finished");
                let _ = tx.send(result);
            })
            .context("spawn executor thread")?;
        Ok(completion)
    }
}
