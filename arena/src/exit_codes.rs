//! Stable exit codes for arena CLI commands.

/// Command succeeded; `invoke` produced an action.
pub const OK: i32 = 0;
/// Invalid config, unreadable input, or an agent that failed to load.
pub const INVALID: i32 = 1;
/// `arena invoke` ran but the agent produced no action (or forfeited).
pub const NO_ACTION: i32 = 2;
