//! Test doubles and fixtures shared by unit and integration tests.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tempfile::TempDir;

use crate::core::extract::COMMAND_MARKER;
use crate::core::types::{Goal, GoalSet, GoalStatus, KnowledgeBase, Observation, Priority};
use crate::io::config::EngineConfig;
use crate::io::executor::{Completion, Executor, Session};
use crate::io::init::{InitOptions, StorePaths, init_home};
use crate::io::lock::{InstanceLock, LivenessProbe};
use crate::io::store::KnowledgeStore;
use crate::scheduler::StopHandle;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Script {
    replies: VecDeque<Result<String, String>>,
    prompts: Vec<String>,
    sessions: Vec<Session>,
    stop_when_exhausted: Option<StopHandle>,
}

/// Executor that answers from a queue of canned replies.
///
/// Clones share the same script, so a test can keep one handle while the
/// scheduler owns another.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    script: Arc<Mutex<Script>>,
}

impl ScriptedExecutor {
    pub fn reply(&self, text: impl Into<String>) -> &Self {
        locked(&self.script).replies.push_back(Ok(text.into()));
        self
    }

    pub fn fail(&self, error: impl Into<String>) -> &Self {
        locked(&self.script).replies.push_back(Err(error.into()));
        self
    }

    /// Request a stop as soon as the last queued reply is handed out.
    pub fn stop_when_exhausted(&self, handle: StopHandle) {
        locked(&self.script).stop_when_exhausted = Some(handle);
    }

    pub fn prompts(&self) -> Vec<String> {
        locked(&self.script).prompts.clone()
    }

    pub fn sessions(&self) -> Vec<Session> {
        locked(&self.script).sessions.clone()
    }
}

impl Executor for ScriptedExecutor {
    fn invoke(&self, session: &Session, prompt: &str) -> Result<Completion> {
        let mut script = locked(&self.script);
        script.prompts.push(prompt.to_string());
        script.sessions.push(session.clone());
        let next = script
            .replies
            .pop_front()
            .ok_or_else(|| anyhow!("scripted executor has no reply left"))?;
        if script.replies.is_empty()
            && let Some(handle) = &script.stop_when_exhausted
        {
            handle.stop();
        }
        Ok(Completion::ready(next.map_err(|err| anyhow!(err))))
    }
}

/// Liveness probe backed by an explicit set of "running" pids.
#[derive(Clone, Default)]
pub struct ScriptedProbe {
    alive: Arc<Mutex<HashSet<u32>>>,
}

impl ScriptedProbe {
    pub fn alive(pids: impl IntoIterator<Item = u32>) -> Self {
        let probe = Self::default();
        locked(&probe.alive).extend(pids);
        probe
    }

    pub fn revive(&self, pid: u32) {
        locked(&self.alive).insert(pid);
    }

    pub fn kill(&self, pid: u32) {
        locked(&self.alive).remove(&pid);
    }
}

impl LivenessProbe for ScriptedProbe {
    fn is_alive(&self, pid: u32) -> bool {
        locked(&self.alive).contains(&pid)
    }
}

/// Initialized home directory in a temp dir.
pub struct TestHome {
    pub dir: TempDir,
    pub paths: StorePaths,
    pub probe: ScriptedProbe,
}

impl TestHome {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = init_home(dir.path(), &InitOptions { force: false }).expect("init home");
        Self {
            dir,
            paths,
            probe: ScriptedProbe::default(),
        }
    }

    pub fn store(&self) -> KnowledgeStore {
        KnowledgeStore::new(self.paths.clone())
    }

    /// Fast config: one-second ticks, first cycle immediately.
    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            interval_secs: 1,
            run_on_start: true,
            ..EngineConfig::default()
        }
    }

    /// Lock on this home owned by `owner`, which the shared probe treats as alive.
    pub fn lock(&self, owner: u32) -> InstanceLock {
        self.probe.revive(owner);
        InstanceLock::with_owner(
            self.paths.lock_path.clone(),
            owner,
            Arc::new(self.probe.clone()),
        )
    }
}

impl Default for TestHome {
    fn default() -> Self {
        Self::new()
    }
}

/// Agent reply with a summary line and a fenced command block.
pub fn commands_reply(summary: &str, commands: Value) -> String {
    let body = serde_json::to_string_pretty(&commands).expect("serialize commands");
    format!("{summary}\n\nWork notes here.\n\n{COMMAND_MARKER}\n```json\n{body}\n```\n")
}

/// Knowledge base holding `count` observations named `obs-1..=count`.
pub fn knowledge_with_observations(count: u64, now: DateTime<Utc>) -> KnowledgeBase {
    let mut kb = KnowledgeBase::empty(now);
    for cycle in 1..=count {
        kb.observations.push(Observation {
            content: format!("obs-{cycle}"),
            timestamp: now,
            cycle,
        });
    }
    kb.metadata.total_cycles = count;
    kb
}

/// Goal with deterministic defaults.
pub fn goal(id: u64, title: &str, status: GoalStatus, now: DateTime<Utc>) -> Goal {
    Goal {
        id,
        title: title.to_string(),
        description: format!("{title} description"),
        priority: Priority::Medium,
        status,
        created_at: now,
        progress: Vec::new(),
    }
}

/// Goal set containing `goals`, with `next_id` just past the largest id.
pub fn goal_set(goals: Vec<Goal>, now: DateTime<Utc>) -> GoalSet {
    let mut set = GoalSet::empty(now);
    set.metadata.next_id = goals.iter().map(|g| g.id).max().unwrap_or(0) + 1;
    set.goals = goals;
    set
}
