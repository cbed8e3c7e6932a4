//! Caller-facing errors that must be matched on.
//!
//! Collaborator plumbing uses `anyhow`; these are the failures the transport
//! and API layers are expected to branch on.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArenaError {
    /// The live-match cap is reached; retry after a match finishes.
    #[error("capacity exceeded: {live} live matches (cap {cap})")]
    CapacityExceeded { live: usize, cap: usize },

    #[error("difficulty {0} out of range")]
    InvalidDifficulty(u8),

    /// Agent code failed to compile or lacks a single callable entry point.
    #[error("failed to load agent '{agent}': {reason}")]
    LoadFailure { agent: String, reason: String },
}
