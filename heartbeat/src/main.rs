//! Autonomous heartbeat service.
//!
//! Runs an agent on a fixed interval against a persistent knowledge base in
//! the home directory (`~/.mcp` unless overridden).

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use heartbeat::exit_codes;
use heartbeat::io::config::load_config;
use heartbeat::io::executor::CommandExecutor;
use heartbeat::io::init::{HOME_ENV, InitOptions, StorePaths, init_home, resolve_home};
use heartbeat::io::lock::{AlreadyRunningError, InstanceLock, request_shutdown};
use heartbeat::io::store::KnowledgeStore;
use heartbeat::logging;
use heartbeat::scheduler::Scheduler;

#[derive(Parser)]
#[command(name = "heartbeat", version, about = "Autonomous agent heartbeat service")]
struct Cli {
    /// Home directory holding state (defaults to $HEARTBEAT_HOME, then ~/.mcp).
    #[arg(long, global = true, env = HOME_ENV, value_name = "DIR")]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the home layout, empty state files and a default config.
    Init {
        /// Overwrite config.toml and mission.md. Knowledge and goals are kept.
        #[arg(short, long)]
        force: bool,
    },
    /// Run cycles in the foreground until interrupted.
    Start {
        /// Seconds between cycles (overrides config.toml).
        #[arg(short, long, value_name = "SECS")]
        interval: Option<u64>,
        /// Run the first cycle immediately.
        #[arg(long)]
        now: bool,
    },
    /// Run a single cycle and exit.
    RunOnce,
    /// Ask the running instance to stop after its current cycle.
    Stop,
    /// Show whether an instance is running and summarize stored knowledge.
    Status,
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            if err.downcast_ref::<AlreadyRunningError>().is_some() {
                exit_codes::ALREADY_RUNNING
            } else {
                exit_codes::INVALID
            }
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let home = resolve_home(cli.home.as_deref())?;
    debug!(home = %home.display(), "resolved home");
    match cli.command {
        Command::Init { force } => cmd_init(&home, force),
        Command::Start { interval, now } => cmd_start(&home, interval, now),
        Command::RunOnce => cmd_run_once(&home),
        Command::Stop => cmd_stop(&home),
        Command::Status => cmd_status(&home),
    }
}

fn cmd_init(home: &Path, force: bool) -> Result<i32> {
    let paths = init_home(home, &InitOptions { force })?;
    println!("initialized {}", paths.home.display());
    Ok(exit_codes::OK)
}

fn build_scheduler(
    home: &Path,
    interval: Option<u64>,
    now: bool,
) -> Result<Scheduler<CommandExecutor>> {
    let paths = init_home(home, &InitOptions { force: false })?;
    let mut config = load_config(&paths.config_path)?;
    if let Some(secs) = interval {
        config.interval_secs = secs;
    }
    config.run_on_start |= now;
    config.validate()?;

    let store = KnowledgeStore::new(paths.clone()).with_max_backups(config.retention.max_backups);
    let executor = CommandExecutor::from_config(&config.executor, paths.sessions_dir.clone())?;
    Ok(Scheduler::new(store, executor, config))
}

fn cmd_start(home: &Path, interval: Option<u64>, now: bool) -> Result<i32> {
    let mut scheduler = build_scheduler(home, interval, now)?;
    let handle = scheduler.stop_handle();
    ctrlc::set_handler(move || handle.stop()).context("install signal handler")?;

    println!("heartbeat starting in {} (Ctrl+C to stop)", home.display());
    scheduler.start()?;
    println!("heartbeat stopped");
    Ok(exit_codes::OK)
}

fn cmd_run_once(home: &Path) -> Result<i32> {
    let mut scheduler = build_scheduler(home, None, true)?;
    let record = scheduler.run_once()?;
    print!("{}", record.to_log_entry());
    if record.success {
        Ok(exit_codes::OK)
    } else {
        Ok(exit_codes::INVALID)
    }
}

fn cmd_stop(home: &Path) -> Result<i32> {
    let paths = StorePaths::new(home);
    let lock = InstanceLock::new(paths.lock_path);
    let status = lock.status()?;
    let Some(pid) = status.owner.filter(|_| status.running) else {
        println!("heartbeat is not running");
        return Ok(exit_codes::NOT_RUNNING);
    };

    println!("stopping heartbeat (pid {pid})");
    request_shutdown(pid)?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if !lock.status()?.running {
            println!("heartbeat stopped");
            return Ok(exit_codes::OK);
        }
        thread::sleep(Duration::from_millis(200));
    }
    println!("heartbeat is finishing its current cycle; it will stop afterwards");
    Ok(exit_codes::OK)
}

fn cmd_status(home: &Path) -> Result<i32> {
    let paths = StorePaths::new(home);
    let status = InstanceLock::new(paths.lock_path.clone()).status()?;
    match (status.owner, status.stale_owner) {
        (Some(pid), _) => println!("status: running (pid {pid})"),
        (None, Some(pid)) => println!("status: stopped (stale marker for pid {pid})"),
        (None, None) => println!("status: stopped"),
    }
    println!("home: {}", paths.home.display());

    let store = KnowledgeStore::new(paths);
    let kb = store.load_knowledge()?;
    let goals = store.load_goals()?;
    println!("cycles: {}", kb.metadata.total_cycles);
    println!(
        "updated: {}",
        kb.metadata.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!(
        "knowledge: observations={} lessons={} hypotheses={} strategies={}",
        kb.observations.len(),
        kb.lessons.len(),
        kb.hypotheses.len(),
        kb.strategies.len()
    );
    println!(
        "goals: active={} total={}",
        goals.active().count(),
        goals.goals.len()
    );
    println!("backups: {}", store.list_backups()?.len());
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_start_with_overrides() {
        let cli = Cli::parse_from(["heartbeat", "--home", "/tmp/hb", "start", "-i", "60", "--now"]);
        assert_eq!(cli.home.as_deref(), Some(Path::new("/tmp/hb")));
        assert!(matches!(
            cli.command,
            Command::Start {
                interval: Some(60),
                now: true
            }
        ));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["heartbeat", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_once() {
        let cli = Cli::parse_from(["heartbeat", "run-once"]);
        assert!(matches!(cli.command, Command::RunOnce));
    }
}
