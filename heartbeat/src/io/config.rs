//! Engine configuration stored under `<home>/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::atomic::write_atomic;

/// Engine configuration (TOML).
///
/// Edited by humans; missing fields fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds between cycle ticks.
    pub interval_secs: u64,

    /// Run the first cycle immediately instead of one interval after start.
    pub run_on_start: bool,

    pub executor: ExecutorConfig,

    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Agent command; the prompt is written to its stdin and its stdout is
    /// taken as the final reply.
    pub command: Vec<String>,

    /// Wall-clock limit for one delegation.
    pub timeout_secs: u64,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// Growth caps. Both default to unbounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    /// Keep at most this many knowledge-base backups (oldest pruned first).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_backups: Option<usize>,

    /// Observation count `prune_old` trims down to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_recent_observations: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: ["codex", "exec", "--skip-git-repo-check", "-"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

/// Longest accepted tick interval.
pub const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5 * 60,
            run_on_start: false,
            executor: ExecutorConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(anyhow!("interval_secs must be > 0"));
        }
        if self.interval_secs > MAX_INTERVAL_SECS {
            return Err(anyhow!("interval_secs must be at most {MAX_INTERVAL_SECS} (one year)"));
        }
        if self.executor.timeout_secs == 0 {
            return Err(anyhow!("executor.timeout_secs must be > 0"));
        }
        if self.executor.output_limit_bytes == 0 {
            return Err(anyhow!("executor.output_limit_bytes must be > 0"));
        }
        if self.executor.command.is_empty() || self.executor.command[0].trim().is_empty() {
            return Err(anyhow!("executor.command must be a non-empty array"));
        }
        if self.retention.max_backups == Some(0) {
            return Err(anyhow!("retention.max_backups must be > 0 when set"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.interval(), Duration::from_secs(300));
    }

    #[test]
    fn write_then_load_round_trips_with_caps() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = EngineConfig {
            interval_secs: 60,
            retention: RetentionConfig {
                max_backups: Some(10),
                keep_recent_observations: None,
            },
            ..EngineConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "interval_secs = 10\n[executor]\ntimeout_secs = 5\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.interval_secs, 10);
        assert_eq!(cfg.executor.timeout_secs, 5);
        assert_eq!(cfg.executor.command, ExecutorConfig::default().command);
        assert_eq!(cfg.retention, RetentionConfig::default());
    }

    #[test]
    fn rejects_zero_interval() {
        let cfg = EngineConfig {
            interval_secs: 0,
            ..EngineConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("interval_secs"));
    }

    #[test]
    fn rejects_interval_beyond_a_year() {
        let cfg = EngineConfig {
            interval_secs: u64::MAX,
            ..EngineConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("at most"));

        let capped = EngineConfig {
            interval_secs: MAX_INTERVAL_SECS,
            ..EngineConfig::default()
        };
        capped.validate().expect("one year is accepted");
    }

    #[test]
    fn oversized_interval_in_file_fails_to_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "interval_secs = 9223372036854775807\n").expect("write");
        assert!(load_config(&path).is_err());
    }
}
