//! Durable storage for the knowledge base, goal set, mission and activity log.
//!
//! Every state write goes through [`write_json_atomic`], so an interrupted
//! save leaves the previous file in place rather than a truncated one.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::core::types::{GoalSet, KnowledgeBase};
use crate::io::atomic::write_json_atomic;
use crate::io::init::StorePaths;

const BACKUP_PREFIX: &str = "context_";

/// Owner of all persisted engine state under one home root.
#[derive(Debug, Clone)]
pub struct KnowledgeStore {
    paths: StorePaths,
    max_backups: Option<usize>,
}

impl KnowledgeStore {
    pub fn new(paths: StorePaths) -> Self {
        Self {
            paths,
            max_backups: None,
        }
    }

    /// Cap the number of retained backups. `None` keeps all of them.
    pub fn with_max_backups(mut self, max_backups: Option<usize>) -> Self {
        self.max_backups = max_backups;
        self
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Load the knowledge base; a missing file yields an empty one.
    pub fn load_knowledge(&self) -> Result<KnowledgeBase> {
        let path = &self.paths.knowledge_path;
        let Some(kb) = read_json::<KnowledgeBase>(path)? else {
            debug!(path = %path.display(), "no knowledge base yet, starting empty");
            return Ok(KnowledgeBase::empty(Utc::now()));
        };
        debug!(
            total_cycles = kb.metadata.total_cycles,
            observations = kb.observations.len(),
            lessons = kb.lessons.len(),
            "knowledge base loaded"
        );
        Ok(kb)
    }

    /// Persist the knowledge base, stamping `updated_at`.
    pub fn save_knowledge(&self, kb: &mut KnowledgeBase) -> Result<()> {
        kb.metadata.updated_at = Utc::now();
        write_json_atomic(&self.paths.knowledge_path, kb)?;
        debug!(total_cycles = kb.metadata.total_cycles, "knowledge base saved");
        Ok(())
    }

    /// Load the goal set; a missing file yields an empty one.
    pub fn load_goals(&self) -> Result<GoalSet> {
        let path = &self.paths.goals_path;
        let Some(goals) = read_json::<GoalSet>(path)? else {
            return Ok(GoalSet::empty(Utc::now()));
        };
        let errors = goals.validate();
        if !errors.is_empty() {
            return Err(anyhow!(
                "invalid goal set {}: {}",
                path.display(),
                errors.join("; ")
            ));
        }
        Ok(goals)
    }

    /// Persist the goal set, stamping `updated_at`.
    pub fn save_goals(&self, goals: &mut GoalSet) -> Result<()> {
        let errors = goals.validate();
        if !errors.is_empty() {
            return Err(anyhow!("refusing to save goal set: {}", errors.join("; ")));
        }
        goals.metadata.updated_at = Utc::now();
        write_json_atomic(&self.paths.goals_path, goals)
    }

    /// Read the mission statement; a missing file is an empty mission.
    pub fn load_mission(&self) -> Result<String> {
        let path = &self.paths.mission_path;
        if !path.exists() {
            return Ok(String::new());
        }
        fs::read_to_string(path).with_context(|| format!("read mission {}", path.display()))
    }

    /// Append a timestamped section to the activity log.
    pub fn append_log(&self, entry: &str) -> Result<()> {
        self.append_log_at(entry, Utc::now())
    }

    pub fn append_log_at(&self, entry: &str, at: DateTime<Utc>) -> Result<()> {
        let path = &self.paths.log_path;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open activity log {}", path.display()))?;
        let section = format!(
            "\n### {}\n{}\n",
            at.format("%Y-%m-%d %H:%M:%S UTC"),
            entry.trim_end()
        );
        file.write_all(section.as_bytes())
            .with_context(|| format!("append activity log {}", path.display()))
    }

    /// Snapshot `kb` into `backups/` tagged with `reason`, then apply the
    /// retention cap. Returns the backup path.
    pub fn backup_knowledge(&self, kb: &KnowledgeBase, reason: &str) -> Result<PathBuf> {
        let now = Utc::now();
        let name = format!(
            "{BACKUP_PREFIX}{}_{}.json",
            now.format("%Y%m%d_%H%M%S_%3f"),
            sanitize_reason(reason)
        );
        let path = self.paths.backups_dir.join(name);
        write_json_atomic(&path, kb)?;
        info!(backup = %path.display(), reason, "knowledge base backed up");

        if let Some(max) = self.max_backups {
            self.prune_backups(max)?;
        }
        Ok(path)
    }

    /// Backup files, oldest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>> {
        let dir = &self.paths.backups_dir;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut backups = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
            let path = entry
                .with_context(|| format!("read entry in {}", dir.display()))?
                .path();
            let is_backup = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(BACKUP_PREFIX) && name.ends_with(".json"));
            if is_backup {
                backups.push(path);
            }
        }
        // Names start with a fixed-width timestamp, so lexical order is age order.
        backups.sort();
        Ok(backups)
    }

    fn prune_backups(&self, max: usize) -> Result<()> {
        let backups = self.list_backups()?;
        let excess = backups.len().saturating_sub(max);
        for path in &backups[..excess] {
            if let Err(err) = fs::remove_file(path) {
                warn!(backup = %path.display(), err = %err, "failed to prune backup");
            } else {
                debug!(backup = %path.display(), "pruned backup");
            }
        }
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

fn sanitize_reason(reason: &str) -> String {
    let cleaned: String = reason
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "manual".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Goal, GoalStatus, Observation, Priority};

    fn store(root: &Path) -> KnowledgeStore {
        KnowledgeStore::new(StorePaths::new(root))
    }

    #[test]
    fn missing_files_load_as_empty_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());

        let kb = store.load_knowledge().expect("load kb");
        assert_eq!(kb.metadata.total_cycles, 0);
        assert_eq!(kb.metadata.version, "1.0");
        let goals = store.load_goals().expect("load goals");
        assert_eq!(goals.metadata.next_id, 1);
        assert_eq!(store.load_mission().expect("mission"), "");
    }

    #[test]
    fn knowledge_round_trips_and_stamps_updated_at() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let created = DateTime::from_timestamp(0, 0).expect("timestamp");
        let mut kb = KnowledgeBase::empty(created);
        kb.observations.push(Observation {
            content: "noted".to_string(),
            timestamp: created,
            cycle: 1,
        });
        kb.metadata.total_cycles = 1;

        store.save_knowledge(&mut kb).expect("save");
        assert!(kb.metadata.updated_at > created);

        let loaded = store.load_knowledge().expect("load");
        assert_eq!(loaded, kb);
    }

    #[test]
    fn unparsable_knowledge_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        fs::write(&store.paths().knowledge_path, "{ not json").expect("write");

        let err = store.load_knowledge().unwrap_err();
        assert!(format!("{err:#}").contains("parse"));
    }

    #[test]
    fn goal_set_with_reused_id_fails_to_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let now = Utc::now();
        let goal = Goal {
            id: 3,
            title: "t".to_string(),
            description: "d".to_string(),
            priority: Priority::High,
            status: GoalStatus::Active,
            created_at: now,
            progress: Vec::new(),
        };
        let mut goals = GoalSet::empty(now);
        goals.goals.push(goal);
        goals.metadata.next_id = 4;
        store.save_goals(&mut goals).expect("save");
        assert_eq!(store.load_goals().expect("load").goals.len(), 1);

        goals.metadata.next_id = 2;
        write_json_atomic(&store.paths().goals_path, &goals).expect("write raw");
        let err = store.load_goals().unwrap_err();
        assert!(err.to_string().contains("next_id"));
    }

    #[test]
    fn append_log_adds_timestamped_sections() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let at = DateTime::from_timestamp(86_400, 0).expect("timestamp");

        store.append_log_at("first", at).expect("append");
        store.append_log_at("second\n", at).expect("append");

        let log = fs::read_to_string(&store.paths().log_path).expect("read log");
        assert_eq!(
            log,
            "\n### 1970-01-02 00:00:00 UTC\nfirst\n\n### 1970-01-02 00:00:00 UTC\nsecond\n"
        );
    }

    #[test]
    fn backups_are_tagged_and_pruned_oldest_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path()).with_max_backups(Some(2));
        let kb = KnowledgeBase::empty(Utc::now());

        let first = store.backup_knowledge(&kb, "cycle_1").expect("backup 1");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store.backup_knowledge(&kb, "cycle_2").expect("backup 2");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let third = store.backup_knowledge(&kb, "cycle 3/x").expect("backup 3");

        let name = third.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with("context_"));
        assert!(name.ends_with("_cycle_3_x.json"));

        let backups = store.list_backups().expect("list");
        assert_eq!(backups, vec![second, third]);
        assert!(!first.exists());
    }

    #[test]
    fn backups_are_unbounded_by_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let kb = KnowledgeBase::empty(Utc::now());
        for cycle in 0..3 {
            store
                .backup_knowledge(&kb, &format!("cycle_{cycle}"))
                .expect("backup");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(store.list_backups().expect("list").len(), 3);
    }
}
