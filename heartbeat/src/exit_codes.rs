//! Stable exit codes for heartbeat CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid home/config/state or other errors.
pub const INVALID: i32 = 1;
/// `heartbeat start` or `run-once` found another live instance holding the lock.
pub const ALREADY_RUNNING: i32 = 2;
/// `heartbeat stop` found no running instance.
pub const NOT_RUNNING: i32 = 3;
