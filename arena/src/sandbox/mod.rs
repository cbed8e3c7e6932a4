//! Sandboxed execution boundary for untrusted agent code.

pub mod runtime;
pub mod schema;

pub use runtime::{InvokeFault, SandboxLimits, SandboxRuntime, SandboxStats};
