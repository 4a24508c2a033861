//! Side-effecting operations: filesystem state, locking, process execution.

pub mod atomic;
pub mod config;
pub mod executor;
pub mod init;
pub mod lock;
pub mod process;
pub mod store;
