//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod commands;
pub mod extract;
pub mod prompt;
pub mod record;
pub mod types;
