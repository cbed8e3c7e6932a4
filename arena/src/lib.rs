//! Real-time maze arena: sandboxed agents, match orchestration, and pairing
//! scheduling.
//!
//! The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (types, lifecycle graph, outcome
//!   rules, timer fencing). No I/O, fully testable in isolation.
//! - **[`io`]**: Collaborator seams and side effects (config file, tick engine,
//!   wagering, lobby broadcast). Isolated to enable scripted fakes in tests.
//!
//! The orchestration modules ([`sandbox`], [`orchestrator`], [`scheduler`])
//! coordinate core logic with those seams.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod sandbox;
pub mod scheduler;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::ArenaError;
pub use orchestrator::MatchOrchestrator;
pub use sandbox::SandboxRuntime;
pub use scheduler::Scheduler;
