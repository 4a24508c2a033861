//! Autonomous heartbeat engine.
//!
//! On a fixed interval the engine hands an agent a prompt built from a
//! persistent knowledge base, goal list and mission statement, then folds the
//! memory commands in the agent's reply back into the knowledge base.
//!
//! - **[`core`]**: Pure, deterministic logic (command protocol, extraction,
//!   prompt rendering, cycle records). No I/O.
//! - **[`io`]**: Side-effecting operations (store, lock, config, executor).
//!   Isolated behind traits so tests can substitute doubles.
//!
//! [`scheduler`] coordinates the two into the running loop.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
