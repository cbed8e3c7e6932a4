//! Deterministic, pure logic shared by the arena.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod lifecycle;
pub mod outcome;
pub mod timers;
pub mod types;
