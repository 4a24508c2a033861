//! The heartbeat loop.
//!
//! Each cycle loads state, renders the prompt, delegates to the executor,
//! applies the returned memory commands, persists and logs. Cycles run on a
//! fixed tick grid until a stop request arrives. Only one delegation is ever
//! in flight: the loop blocks on each completion before scheduling the next.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::core::commands::{ApplyContext, ValidatedBlock, apply_block, validate_block};
use crate::core::extract::{CommandExtractor, Extraction, MarkerExtractor};
use crate::core::prompt::{PromptInputs, assemble_prompt};
use crate::core::record::{CycleRecord, extract_summary};
use crate::io::config::EngineConfig;
use crate::io::executor::Executor;
use crate::io::lock::{InstanceLock, LockStatus};
use crate::io::store::KnowledgeStore;

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running { cycle: u64 },
    WaitingForTick,
    Stopped,
}

/// Cloneable handle that asks a running loop to stop after its current cycle.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Sender<()>,
}

impl StopHandle {
    pub fn stop(&self) {
        // A closed channel means the scheduler is already gone.
        let _ = self.tx.send(());
    }
}

enum Wake {
    Tick,
    Stop,
}

pub struct Scheduler<E, X = MarkerExtractor> {
    store: KnowledgeStore,
    executor: E,
    extractor: X,
    config: EngineConfig,
    lock: InstanceLock,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    state: SchedulerState,
    last_completed: u64,
}

impl<E: Executor> Scheduler<E> {
    /// Scheduler locked by the current process at the store's lock path.
    pub fn new(store: KnowledgeStore, executor: E, config: EngineConfig) -> Self {
        let lock = InstanceLock::new(store.paths().lock_path.clone());
        let (stop_tx, stop_rx) = mpsc::channel();
        Self {
            store,
            executor,
            extractor: MarkerExtractor,
            config,
            lock,
            stop_tx,
            stop_rx,
            state: SchedulerState::Idle,
            last_completed: 0,
        }
    }
}

impl<E: Executor, X: CommandExtractor> Scheduler<E, X> {
    pub fn with_extractor<Y: CommandExtractor>(self, extractor: Y) -> Scheduler<E, Y> {
        Scheduler {
            store: self.store,
            executor: self.executor,
            extractor,
            config: self.config,
            lock: self.lock,
            stop_tx: self.stop_tx,
            stop_rx: self.stop_rx,
            state: self.state,
            last_completed: self.last_completed,
        }
    }

    pub fn with_lock(mut self, lock: InstanceLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Whether some process holds the instance lock, and which.
    pub fn status(&self) -> Result<LockStatus> {
        self.lock.status()
    }

    /// Run cycles on the tick grid until stopped. Blocks.
    ///
    /// Fails up front if another live process holds the lock. Individual
    /// cycle failures are logged and never end the loop.
    pub fn start(&mut self) -> Result<()> {
        self.config.validate().context("invalid heartbeat config")?;
        let guard = self.lock.acquire()?;
        self.last_completed = match self.store.load_knowledge() {
            Ok(kb) => kb.metadata.total_cycles,
            Err(err) => {
                warn!(err = ?err, "could not read knowledge base at startup");
                0
            }
        };

        let interval = self.config.interval();
        info!(
            interval_secs = interval.as_secs(),
            run_on_start = self.config.run_on_start,
            pid = self.lock.owner(),
            "heartbeat starting"
        );
        self.log_event(&format!(
            "**Cycle {} - Heartbeat Started**\n\nHeartbeat service activated. Interval: {}s\n",
            self.last_completed,
            interval.as_secs()
        ));

        let mut next_tick = if self.config.run_on_start {
            Instant::now()
        } else {
            tick_after(Instant::now(), interval)?
        };
        loop {
            self.state = SchedulerState::WaitingForTick;
            if let Wake::Stop = self.wait_until(next_tick) {
                break;
            }

            self.run_cycle();

            next_tick = tick_after(next_tick, interval)?;
            let now = Instant::now();
            if next_tick <= now {
                warn!(
                    behind_ms = (now - next_tick).as_millis() as u64,
                    "cycle overran its tick, starting next cycle now"
                );
                next_tick = now;
            }
        }

        self.state = SchedulerState::Stopped;
        info!("heartbeat stopped");
        self.log_event(&format!(
            "**Cycle {} - Heartbeat Stopped**\n\nHeartbeat service deactivated.\n",
            self.last_completed
        ));
        guard.release()
    }

    /// Run exactly one cycle under the instance lock.
    pub fn run_once(&mut self) -> Result<CycleRecord> {
        let guard = self.lock.acquire()?;
        let record = self.run_cycle();
        self.state = SchedulerState::Stopped;
        guard.release()?;
        Ok(record)
    }

    /// Run one cycle and append its record to the activity log.
    ///
    /// Never fails: errors are captured in the returned record.
    pub fn run_cycle(&mut self) -> CycleRecord {
        let started_at = Utc::now();
        let mut record = CycleRecord {
            cycle: self.last_completed + 1,
            started_at,
            ended_at: started_at,
            session_id: None,
            summary: String::new(),
            commands_applied: 0,
            commands_skipped: Vec::new(),
            backup: None,
            success: false,
            error: None,
        };

        match self.try_cycle(&mut record) {
            Ok(()) => {
                record.success = true;
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(cycle = record.cycle, err = %message, "cycle failed");
                record.error = Some(message);
            }
        }
        record.ended_at = Utc::now();
        if record.summary.is_empty() {
            record.summary = "(no reply)".to_string();
        }

        info!(
            cycle = record.cycle,
            success = record.success,
            applied = record.commands_applied,
            skipped = record.commands_skipped.len(),
            duration_ms = record.duration().as_millis() as u64,
            "cycle finished"
        );
        self.log_event(&record.to_log_entry());
        record
    }

    fn try_cycle(&mut self, record: &mut CycleRecord) -> Result<()> {
        let mut kb = self
            .store
            .load_knowledge()
            .context("load knowledge base")?;
        let cycle = kb.next_cycle();
        record.cycle = cycle;
        self.state = SchedulerState::Running { cycle };

        let goals = self.store.load_goals().context("load goals")?;
        let mission = self.store.load_mission().context("load mission")?;
        info!(
            cycle,
            observations = kb.observations.len(),
            lessons = kb.lessons.len(),
            active_goals = goals.active().count(),
            "state loaded"
        );

        let prompt = assemble_prompt(&PromptInputs {
            knowledge: &kb,
            goals: &goals,
            mission: &mission,
            cycle,
            now: record.started_at,
        })?;

        let session = self
            .executor
            .open_session(cycle)
            .context("open executor session")?;
        record.session_id = Some(session.id.clone());
        let reply = self
            .executor
            .invoke(&session, &prompt)
            .context("invoke executor")?
            .wait()
            .context("executor reply")?;
        record.summary = extract_summary(&reply);

        let block = self.validated_commands(cycle, &reply);
        record.commands_skipped = block.skipped.clone();

        if block.has_valid() {
            let backup = self
                .store
                .backup_knowledge(&kb, &format!("cycle_{cycle}"))
                .context("back up knowledge base")?;
            record.backup = backup
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());

            let ctx = ApplyContext {
                cycle,
                now: Utc::now(),
                keep_recent_observations: self.config.retention.keep_recent_observations,
            };
            record.commands_applied = apply_block(&mut kb, &block, &ctx);
            for command in &block.valid {
                info!(cycle, command = command.mutation.kind(), reason = %command.reason, "memory command applied");
            }
        }

        kb.metadata.total_cycles = cycle;
        self.store
            .save_knowledge(&mut kb)
            .context("save knowledge base")?;
        self.last_completed = cycle;
        Ok(())
    }

    fn validated_commands(&self, cycle: u64, reply: &str) -> ValidatedBlock {
        let block = match self.extractor.extract(reply) {
            Extraction::Absent => {
                debug!(cycle, "no memory commands in reply");
                return ValidatedBlock::default();
            }
            Extraction::Ambiguous { markers } => {
                warn!(cycle, markers, "multiple memory command blocks, ignoring all");
                return ValidatedBlock::default();
            }
            Extraction::Malformed { error } => {
                warn!(cycle, err = %error, "malformed memory command block");
                return ValidatedBlock::default();
            }
            Extraction::Block(items) => validate_block(&items),
        };
        for skipped in &block.skipped {
            warn!(
                cycle,
                index = skipped.index,
                kind = skipped.kind.as_deref().unwrap_or("?"),
                err = %skipped.error,
                "skipping memory command"
            );
        }
        block
    }

    fn wait_until(&self, deadline: Instant) -> Wake {
        let timeout = deadline.saturating_duration_since(Instant::now());
        debug!(wait_ms = timeout.as_millis() as u64, "waiting for next tick");
        match self.stop_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                info!("stop requested");
                Wake::Stop
            }
            Err(RecvTimeoutError::Timeout) => Wake::Tick,
        }
    }

    fn log_event(&self, entry: &str) {
        if let Err(err) = self.store.append_log(entry) {
            warn!(err = ?err, "failed to append activity log");
        }
    }
}

fn tick_after(from: Instant, interval: Duration) -> Result<Instant> {
    from.checked_add(interval)
        .ok_or_else(|| anyhow!("tick interval {interval:?} overflows the clock"))
}
