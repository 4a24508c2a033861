//! Home-directory layout and scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::info;

use crate::core::types::{GoalSet, KnowledgeBase};
use crate::io::atomic::{write_atomic, write_json_atomic};
use crate::io::config::{EngineConfig, write_config};

/// Directory name used under the user's home when no root is given.
pub const DEFAULT_HOME_DIR: &str = ".mcp";

/// Environment variable that overrides the default home root.
pub const HOME_ENV: &str = "HEARTBEAT_HOME";

/// All canonical paths under an engine home root.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub home: PathBuf,
    pub knowledge_path: PathBuf,
    pub goals_path: PathBuf,
    pub mission_path: PathBuf,
    pub log_path: PathBuf,
    pub backups_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub lock_path: PathBuf,
    pub config_path: PathBuf,
}

impl StorePaths {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            knowledge_path: home.join("context.json"),
            goals_path: home.join("active-goals.json"),
            mission_path: home.join("mission.md"),
            log_path: home.join("mission-log.md"),
            backups_dir: home.join("backups"),
            sessions_dir: home.join("sessions"),
            lock_path: home.join("heartbeat.pid"),
            config_path: home.join("config.toml"),
            home,
        }
    }
}

/// Resolve the home root: explicit path, then `HEARTBEAT_HOME`, then `~/.mcp`.
pub fn resolve_home(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(value) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(value));
    }
    let user_home =
        dirs::home_dir().ok_or_else(|| anyhow!("cannot determine home directory; pass --home"))?;
    Ok(user_home.join(DEFAULT_HOME_DIR))
}

/// Options for `init_home`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Overwrite the config and mission placeholder. State files are never overwritten.
    pub force: bool,
}

/// Create the home layout with empty state files where missing.
pub fn init_home(home: &Path, options: &InitOptions) -> Result<StorePaths> {
    let paths = StorePaths::new(home);
    if paths.home.exists() && !paths.home.is_dir() {
        return Err(anyhow!(
            "init: {} exists but is not a directory",
            paths.home.display()
        ));
    }

    create_dir(&paths.home)?;
    create_dir(&paths.backups_dir)?;
    create_dir(&paths.sessions_dir)?;

    let now = Utc::now();
    if !paths.knowledge_path.exists() {
        write_json_atomic(&paths.knowledge_path, &KnowledgeBase::empty(now))?;
    }
    if !paths.goals_path.exists() {
        write_json_atomic(&paths.goals_path, &GoalSet::empty(now))?;
    }
    if options.force || !paths.mission_path.exists() {
        write_atomic(&paths.mission_path, MISSION_PLACEHOLDER)?;
    }
    if options.force || !paths.config_path.exists() {
        write_config(&paths.config_path, &EngineConfig::default())?;
    }

    info!(home = %paths.home.display(), "home initialized");
    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const MISSION_PLACEHOLDER: &str =
    "# Mission\n\nDescribe what the agent should work toward across cycles.\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn paths_are_stable() {
        let paths = StorePaths::new("/srv/hb");
        assert_eq!(paths.knowledge_path, Path::new("/srv/hb/context.json"));
        assert_eq!(paths.goals_path, Path::new("/srv/hb/active-goals.json"));
        assert_eq!(paths.mission_path, Path::new("/srv/hb/mission.md"));
        assert_eq!(paths.log_path, Path::new("/srv/hb/mission-log.md"));
        assert_eq!(paths.lock_path, Path::new("/srv/hb/heartbeat.pid"));
        assert!(paths.backups_dir.ends_with("backups"));
    }

    #[test]
    fn explicit_home_wins() {
        let home = resolve_home(Some(Path::new("/tmp/explicit"))).expect("resolve");
        assert_eq!(home, Path::new("/tmp/explicit"));
    }

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_home(&temp.path().join("home"), &InitOptions { force: false })
            .expect("init");

        assert!(paths.backups_dir.is_dir());
        assert!(paths.sessions_dir.is_dir());
        assert!(paths.knowledge_path.is_file());
        assert!(paths.goals_path.is_file());
        assert_eq!(
            fs::read_to_string(&paths.mission_path).expect("mission"),
            MISSION_PLACEHOLDER
        );
        assert_eq!(
            load_config(&paths.config_path).expect("config"),
            EngineConfig::default()
        );
    }

    #[test]
    fn init_never_overwrites_state_even_with_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let home = temp.path();
        let paths = init_home(home, &InitOptions { force: false }).expect("init");
        fs::write(&paths.knowledge_path, "custom").expect("write custom");
        fs::write(&paths.mission_path, "custom").expect("write custom");

        init_home(home, &InitOptions { force: true }).expect("re-init");

        assert_eq!(
            fs::read_to_string(&paths.knowledge_path).expect("read"),
            "custom"
        );
        assert_eq!(
            fs::read_to_string(&paths.mission_path).expect("read"),
            MISSION_PLACEHOLDER
        );
    }
}
