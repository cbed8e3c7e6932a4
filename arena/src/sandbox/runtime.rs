//! Sandboxed execution of untrusted per-tick agent code.
//!
//! Agent code is a rhai script exposing exactly one public function of one
//! argument. Each load builds a fresh engine with no module resolver, no host
//! functions, and data-size ceilings derived from the memory limit. The live
//! values of a call are tallied at every variable definition and the call is
//! cut off once their total passes the same limit. Every call runs under a
//! wall-clock deadline enforced from the engine's progress hook. State crosses
//! the boundary as a deep copy in both directions.
//!
//! Every failure after a successful load degrades to `None` ("no action
//! this tick"); nothing escapes as an error or panic.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rhai::module_resolvers::DummyModuleResolver;
use rhai::{AST, CallFnOptions, Dynamic, Engine, EvalAltResult, FnAccess, Position, Scope};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::Direction;
use crate::error::ArenaError;
use crate::io::config::SandboxConfig;
use crate::io::tick_engine::Decide;
use crate::sandbox::schema::ActionValidator;

/// Operations between two deadline checks in the progress hook.
const PROGRESS_CHECK_INTERVAL: u64 = 64;
/// Rough per-element cost used to turn the byte ceiling into element counts.
const VALUE_SLOT_BYTES: usize = 64;
const MAX_EXPR_DEPTH: usize = 64;
const MAX_FN_EXPR_DEPTH: usize = 32;
/// Extra time the async backstop allows on top of the deadline.
const BACKSTOP_GRACE: Duration = Duration::from_millis(50);

/// Resource limits for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    pub deadline: Duration,
    pub memory_limit_bytes: usize,
    pub max_call_depth: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::from(&SandboxConfig::default())
    }
}

impl From<&SandboxConfig> for SandboxLimits {
    fn from(cfg: &SandboxConfig) -> Self {
        Self {
            deadline: cfg.deadline(),
            memory_limit_bytes: cfg.memory_limit_bytes,
            max_call_depth: cfg.max_call_depth,
        }
    }
}

/// Why an invocation produced no action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeFault {
    NoSession,
    Timeout,
    MemoryExceeded,
    InvalidOutput,
    Runtime,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SandboxStats {
    pub invocations: u64,
    pub forfeits: u64,
}

#[derive(Debug)]
struct Forfeit {
    fault: InvokeFault,
    detail: String,
}

impl Forfeit {
    fn new(fault: InvokeFault, detail: impl Into<String>) -> Self {
        Self {
            fault,
            detail: detail.into(),
        }
    }
}

struct SandboxSession {
    engine: Engine,
    ast: AST,
    entry: String,
    agent_name: String,
    origin: Instant,
    /// Nanoseconds since `origin` at which the running call is terminated; 0 when idle.
    deadline_nanos: Arc<AtomicU64>,
    code_bytes: usize,
    last_footprint: AtomicUsize,
    disposed: AtomicBool,
    call_lock: Mutex<()>,
}

impl SandboxSession {
    fn arm_deadline(&self, deadline: Duration) {
        let at = self.origin.elapsed() + deadline;
        self.deadline_nanos
            .store(duration_nanos(at).max(1), Ordering::Release);
    }

    fn disarm_deadline(&self) {
        self.deadline_nanos.store(0, Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        // Terminates an in-flight call at its next progress check.
        self.deadline_nanos.store(1, Ordering::Release);
    }
}

struct RuntimeInner {
    limits: SandboxLimits,
    validator: ActionValidator,
    session: Mutex<Option<Arc<SandboxSession>>>,
    invocations: AtomicU64,
    forfeits: AtomicU64,
    last_fault: Mutex<Option<InvokeFault>>,
}

/// Isolated runtime for one agent. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct SandboxRuntime {
    inner: Arc<RuntimeInner>,
}

impl SandboxRuntime {
    pub fn new(limits: SandboxLimits) -> anyhow::Result<Self> {
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                limits,
                validator: ActionValidator::new()?,
                session: Mutex::new(None),
                invocations: AtomicU64::new(0),
                forfeits: AtomicU64::new(0),
                last_fault: Mutex::new(None),
            }),
        })
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.inner.limits
    }

    /// Compile `code` into a fresh isolated session, replacing any prior one.
    #[instrument(skip_all, fields(agent = agent_name, code_bytes = code.len()))]
    pub fn load(&self, code: &str, agent_name: &str) -> Result<(), ArenaError> {
        self.dispose();
        let fail = |reason: String| ArenaError::LoadFailure {
            agent: agent_name.to_string(),
            reason,
        };

        let origin = Instant::now();
        let deadline_nanos = Arc::new(AtomicU64::new(0));
        let engine = build_engine(
            &self.inner.limits,
            origin,
            deadline_nanos.clone(),
            agent_name,
        );
        let ast = engine
            .compile(code)
            .map_err(|err| fail(format!("compile error: {err}")))?;
        let entry = find_entry_point(&ast).map_err(fail)?;

        let session = Arc::new(SandboxSession {
            engine,
            ast,
            entry,
            agent_name: agent_name.to_string(),
            origin,
            deadline_nanos,
            code_bytes: code.len(),
            last_footprint: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            call_lock: Mutex::new(()),
        });
        info!(entry = %session.entry, "agent loaded");
        if let Ok(mut slot) = self.inner.session.lock() {
            *slot = Some(session);
        }
        Ok(())
    }

    /// Run one decision on the blocking pool behind a timeout backstop.
    ///
    /// The snapshot is copied; the caller keeps ownership of its state.
    pub async fn invoke(&self, state: &Value) -> Option<Direction> {
        let runtime = self.clone();
        let snapshot = state.clone();
        let budget = self.inner.limits.deadline + BACKSTOP_GRACE;
        let task = tokio::task::spawn_blocking(move || runtime.invoke_blocking(&snapshot));
        match tokio::time::timeout(budget, task).await {
            Ok(Ok(action)) => action,
            Ok(Err(err)) => {
                self.record_forfeit(&Forfeit::new(InvokeFault::Runtime, err.to_string()));
                None
            }
            Err(_) => {
                warn!(
                    budget_ms = budget.as_millis() as u64,
                    "agent call exceeded backstop, forfeiting tick"
                );
                None
            }
        }
    }

    /// Run one decision on the current thread.
    pub fn invoke_blocking(&self, state: &Value) -> Option<Direction> {
        self.inner.invocations.fetch_add(1, Ordering::Relaxed);
        match self.try_invoke(state) {
            Ok(action) => action,
            Err(forfeit) => {
                self.record_forfeit(&forfeit);
                None
            }
        }
    }

    /// Best-effort bytes attributed to the loaded agent; 0 without a session.
    pub fn memory_usage(&self) -> usize {
        self.current_session().map_or(0, |session| {
            session.code_bytes + session.last_footprint.load(Ordering::Relaxed)
        })
    }

    /// Tear down the current session. Idempotent.
    pub fn dispose(&self) {
        let previous = match self.inner.session.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(session) = previous {
            session.dispose();
            info!(agent = %session.agent_name, "agent disposed");
        }
    }

    pub fn agent_name(&self) -> Option<String> {
        self.current_session()
            .map(|session| session.agent_name.clone())
    }

    pub fn stats(&self) -> SandboxStats {
        SandboxStats {
            invocations: self.inner.invocations.load(Ordering::Relaxed),
            forfeits: self.inner.forfeits.load(Ordering::Relaxed),
        }
    }

    pub fn last_fault(&self) -> Option<InvokeFault> {
        self.inner.last_fault.lock().ok().and_then(|fault| *fault)
    }

    fn current_session(&self) -> Option<Arc<SandboxSession>> {
        self.inner
            .session
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
    }

    fn try_invoke(&self, state: &Value) -> Result<Option<Direction>, Forfeit> {
        let session = self
            .current_session()
            .ok_or_else(|| Forfeit::new(InvokeFault::NoSession, "no agent loaded"))?;
        let _serial = session
            .call_lock
            .lock()
            .map_err(|_| Forfeit::new(InvokeFault::Runtime, "call lock poisoned"))?;
        if session.is_disposed() {
            return Err(Forfeit::new(InvokeFault::NoSession, "agent disposed"));
        }

        let limits = &self.inner.limits;
        let input_bytes = json_size(state);
        if input_bytes > limits.memory_limit_bytes {
            return Err(Forfeit::new(
                InvokeFault::MemoryExceeded,
                format!("snapshot of {input_bytes} bytes exceeds ceiling"),
            ));
        }
        let input = rhai::serde::to_dynamic(state)
            .map_err(|err| Forfeit::new(InvokeFault::Runtime, format!("copy snapshot: {err}")))?;

        let started = Instant::now();
        session.arm_deadline(limits.deadline);
        let result = session.engine.call_fn_with_options::<Dynamic>(
            CallFnOptions::new().eval_ast(false).rewind_scope(true),
            &mut Scope::new(),
            &session.ast,
            &session.entry,
            (input,),
        );
        session.disarm_deadline();
        let elapsed = started.elapsed();

        if session.is_disposed() {
            return Err(Forfeit::new(InvokeFault::NoSession, "agent disposed during call"));
        }
        let output = result.map_err(|err| Forfeit::new(classify(&err), err.to_string()))?;
        if elapsed > limits.deadline {
            return Err(Forfeit::new(
                InvokeFault::Timeout,
                format!("returned after {}ms", elapsed.as_millis()),
            ));
        }

        let value: Value = rhai::serde::from_dynamic(&output).map_err(|err| {
            Forfeit::new(InvokeFault::InvalidOutput, format!("copy result: {err}"))
        })?;
        session
            .last_footprint
            .store(input_bytes + json_size(&value), Ordering::Relaxed);

        let action = self
            .inner
            .validator
            .parse_action(&value)
            .map_err(|err| Forfeit::new(InvokeFault::InvalidOutput, format!("{err:#}")))?;
        debug!(agent = %session.agent_name, action = ?action, elapsed_us = elapsed.as_micros() as u64, "agent decided");
        Ok(action)
    }

    fn record_forfeit(&self, forfeit: &Forfeit) {
        self.inner.forfeits.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.inner.last_fault.lock() {
            *last = Some(forfeit.fault);
        }
        if forfeit.fault == InvokeFault::NoSession {
            debug!(detail = %forfeit.detail, "no agent session, forfeiting tick");
        } else {
            warn!(fault = ?forfeit.fault, detail = %forfeit.detail, "agent call failed, forfeiting tick");
        }
    }
}

impl Decide for SandboxRuntime {
    fn decide(&self, state: &Value) -> Option<Direction> {
        self.invoke_blocking(state)
    }
}

fn build_engine(
    limits: &SandboxLimits,
    origin: Instant,
    deadline_nanos: Arc<AtomicU64>,
    agent_name: &str,
) -> Engine {
    let mut engine = Engine::new();
    engine.set_module_resolver(DummyModuleResolver::new());
    engine.disable_symbol("eval");
    engine.set_max_call_levels(limits.max_call_depth);
    engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_FN_EXPR_DEPTH);
    engine.set_max_string_size(limits.memory_limit_bytes);
    let max_elements = (limits.memory_limit_bytes / VALUE_SLOT_BYTES).max(1);
    engine.set_max_array_size(max_elements);
    engine.set_max_map_size(max_elements);

    // Per-value ceilings alone let many values just under the limit pile up.
    let budget = limits.memory_limit_bytes;
    #[allow(deprecated)]
    engine.on_def_var(move |_, _, ctx| {
        let live: usize = ctx
            .scope()
            .iter_raw()
            .map(|(_, _, value)| dynamic_size(value))
            .sum();
        if live > budget {
            Err(EvalAltResult::ErrorDataTooLarge(
                format!("live agent data of {live} bytes"),
                Position::NONE,
            )
            .into())
        } else {
            Ok(true)
        }
    });

    let print_agent = agent_name.to_string();
    engine.on_print(move |text| debug!(agent = %print_agent, text, "agent print"));
    let debug_agent = agent_name.to_string();
    engine.on_debug(move |text, _source, _pos| debug!(agent = %debug_agent, text, "agent debug"));

    engine.on_progress(move |ops| {
        if ops % PROGRESS_CHECK_INTERVAL != 0 {
            return None;
        }
        let limit = deadline_nanos.load(Ordering::Acquire);
        if limit != 0 && duration_nanos(origin.elapsed()) >= limit {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });
    engine
}

/// Locate the single public one-argument function.
fn find_entry_point(ast: &AST) -> Result<String, String> {
    let public: Vec<_> = ast
        .iter_functions()
        .filter(|f| matches!(f.access, FnAccess::Public) && !f.name.starts_with("anon$"))
        .collect();
    match public.as_slice() {
        [] => Err("no public entry function".to_string()),
        [entry] if entry.params.len() == 1 => Ok(entry.name.to_string()),
        [entry] => Err(format!(
            "entry function '{}' must take exactly one argument, found {}",
            entry.name,
            entry.params.len()
        )),
        many => {
            let names: Vec<&str> = many.iter().map(|f| f.name).collect();
            Err(format!(
                "expected exactly one public function, found {}: {}",
                many.len(),
                names.join(", ")
            ))
        }
    }
}

fn classify(err: &EvalAltResult) -> InvokeFault {
    match err {
        EvalAltResult::ErrorTerminated(..) | EvalAltResult::ErrorTooManyOperations(..) => {
            InvokeFault::Timeout
        }
        EvalAltResult::ErrorDataTooLarge(..) | EvalAltResult::ErrorStackOverflow(..) => {
            InvokeFault::MemoryExceeded
        }
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => classify(inner),
        _ => InvokeFault::Runtime,
    }
}

fn json_size(value: &Value) -> usize {
    serde_json::to_vec(value).map_or(0, |bytes| bytes.len())
}

/// Approximate heap bytes held by a script value.
fn dynamic_size(value: &Dynamic) -> usize {
    if let Ok(text) = value.as_immutable_string_ref() {
        return text.len();
    }
    if let Ok(blob) = value.as_blob_ref() {
        return blob.len();
    }
    if let Ok(items) = value.as_array_ref() {
        return VALUE_SLOT_BYTES + items.iter().map(dynamic_size).sum::<usize>();
    }
    if let Ok(map) = value.as_map_ref() {
        return VALUE_SLOT_BYTES
            + map
                .iter()
                .map(|(key, item)| key.len() + dynamic_size(item))
                .sum::<usize>();
    }
    VALUE_SLOT_BYTES
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn runtime() -> SandboxRuntime {
        SandboxRuntime::new(SandboxLimits {
            deadline: Duration::from_millis(50),
            memory_limit_bytes: 1024 * 1024,
            max_call_depth: 16,
        })
        .expect("runtime")
    }

    const FOLLOW_PELLET: &str = r#"
        fn decide(state) {
            if state.pellet_x > state.x { "right" } else { #{ direction: "left" } }
        }
    "#;

    #[test]
    fn load_and_invoke_returns_direction() {
        let rt = runtime();
        rt.load(FOLLOW_PELLET, "follower").expect("load");
        assert_eq!(
            rt.invoke_blocking(&json!({"x": 1, "pellet_x": 5})),
            Some(Direction::Right)
        );
        assert_eq!(
            rt.invoke_blocking(&json!({"x": 9, "pellet_x": 5})),
            Some(Direction::Left)
        );
        assert_eq!(rt.stats().forfeits, 0);
        assert!(rt.memory_usage() > FOLLOW_PELLET.len());
    }

    #[test]
    fn private_helpers_are_allowed() {
        let rt = runtime();
        let code = r#"
            private fn pick(n) { if n > 0 { "up" } else { "down" } }
            fn decide(state) { pick(state.n) }
        "#;
        rt.load(code, "helper").expect("load");
        assert_eq!(rt.invoke_blocking(&json!({"n": 1})), Some(Direction::Up));
    }

    #[test]
    fn compile_error_is_load_failure() {
        let err = runtime().load("fn decide(state) {", "broken").unwrap_err();
        assert!(matches!(err, ArenaError::LoadFailure { ref agent, .. } if agent == "broken"));
    }

    #[test]
    fn missing_or_ambiguous_entry_is_load_failure() {
        let rt = runtime();
        let none = rt.load("let x = 1;", "empty").unwrap_err();
        assert!(none.to_string().contains("no public entry function"));

        let two = rt
            .load("fn a(s) { \"up\" } fn b(s) { \"down\" }", "two")
            .unwrap_err();
        assert!(two.to_string().contains("exactly one public function"));

        let arity = rt.load("fn decide(a, b) { \"up\" }", "arity").unwrap_err();
        assert!(arity.to_string().contains("exactly one argument"));
    }

    #[test]
    fn top_level_statements_never_run() {
        let rt = runtime();
        rt.load("loop { } fn decide(s) { \"up\" }", "toplevel")
            .expect("load");
        assert_eq!(rt.invoke_blocking(&json!({})), Some(Direction::Up));
    }

    #[test]
    fn infinite_loop_times_out() {
        let rt = runtime();
        rt.load("fn decide(s) { let n = 0; loop { n += 1; } }", "spinner")
            .expect("load");
        let started = Instant::now();
        assert_eq!(rt.invoke_blocking(&json!({})), None);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(rt.last_fault(), Some(InvokeFault::Timeout));
    }

    #[test]
    fn throwing_code_forfeits() {
        let rt = runtime();
        rt.load("fn decide(s) { throw \"boom\"; }", "thrower")
            .expect("load");
        assert_eq!(rt.invoke_blocking(&json!({})), None);
        assert_eq!(rt.last_fault(), Some(InvokeFault::Runtime));
    }

    #[test]
    fn oversized_data_forfeits_as_memory() {
        let rt = runtime();
        let code = r#"
            fn decide(s) {
                let a = [];
                a.pad(1000000000, 0);
                "up"
            }
        "#;
        rt.load(code, "hog").expect("load");
        assert_eq!(rt.invoke_blocking(&json!({})), None);
        assert_eq!(rt.last_fault(), Some(InvokeFault::MemoryExceeded));
    }

    #[test]
    fn many_values_under_the_ceiling_still_breach_the_budget() {
        let rt = SandboxRuntime::new(SandboxLimits {
            deadline: Duration::from_secs(2),
            memory_limit_bytes: 1024 * 1024,
            max_call_depth: 16,
        })
        .expect("runtime");
        let code = r#"
            fn decide(s) {
                let a = "";
                a.pad(1000000, 'x');
                let b = a + "1";
                let c = a + "2";
                let d = a + "3";
                let e = a + "4";
                let f = a + "5";
                let g = a + "6";
                let h = a + "7";
                let i = a + "8";
                "up"
            }
        "#;
        rt.load(code, "hoarder").expect("load");
        assert_eq!(rt.invoke_blocking(&json!({})), None);
        assert_eq!(rt.last_fault(), Some(InvokeFault::MemoryExceeded));
    }

    #[test]
    fn small_locals_stay_within_the_budget() {
        let rt = runtime();
        let code = r#"
            fn decide(s) {
                let path = [1, 2, 3];
                let seen = #{ start: "a", goal: "b" };
                let label = "walk";
                if path.len() == 3 { "down" } else { label }
            }
        "#;
        rt.load(code, "walker").expect("load");
        assert_eq!(rt.invoke_blocking(&json!({})), Some(Direction::Down));
        assert_eq!(rt.stats().forfeits, 0);
    }

    #[test]
    fn value_sizes_count_nested_data() {
        let text = Dynamic::from(rhai::ImmutableString::from("abcd"));
        assert_eq!(dynamic_size(&text), 4);
        let nested = Dynamic::from_array(vec![text.clone(), text]);
        assert_eq!(dynamic_size(&nested), VALUE_SLOT_BYTES + 8);
        assert_eq!(dynamic_size(&Dynamic::from(7_i64)), VALUE_SLOT_BYTES);
    }

    #[test]
    fn malformed_output_forfeits() {
        let rt = runtime();
        rt.load("fn decide(s) { 42 }", "numbers").expect("load");
        assert_eq!(rt.invoke_blocking(&json!({})), None);
        assert_eq!(rt.last_fault(), Some(InvokeFault::InvalidOutput));
    }

    #[test]
    fn unit_result_is_idle_not_forfeit() {
        let rt = runtime();
        rt.load("fn decide(s) { }", "idle").expect("load");
        assert_eq!(rt.invoke_blocking(&json!({})), None);
        assert_eq!(rt.stats().forfeits, 0);
    }

    #[test]
    fn agent_mutations_do_not_reach_host_state() {
        let rt = runtime();
        rt.load("fn decide(s) { s.x = 99; \"up\" }", "mutator")
            .expect("load");
        let state = json!({"x": 1});
        rt.invoke_blocking(&state);
        assert_eq!(state["x"], 1);
    }

    #[test]
    fn dispose_is_idempotent_and_silences_invoke() {
        let rt = runtime();
        rt.load(FOLLOW_PELLET, "follower").expect("load");
        rt.dispose();
        rt.dispose();
        assert_eq!(rt.memory_usage(), 0);
        assert_eq!(rt.invoke_blocking(&json!({"x": 1, "pellet_x": 5})), None);
        assert_eq!(rt.last_fault(), Some(InvokeFault::NoSession));
    }

    #[test]
    fn reload_replaces_previous_agent() {
        let rt = runtime();
        rt.load("fn decide(s) { \"up\" }", "first").expect("load first");
        rt.load("fn decide(s) { \"down\" }", "second")
            .expect("load second");
        assert_eq!(rt.agent_name().as_deref(), Some("second"));
        assert_eq!(rt.invoke_blocking(&json!({})), Some(Direction::Down));
    }

    #[test]
    fn failed_reload_leaves_no_session() {
        let rt = runtime();
        rt.load("fn decide(s) { \"up\" }", "first").expect("load first");
        assert!(rt.load("not valid rhai (", "second").is_err());
        assert_eq!(rt.agent_name(), None);
        assert_eq!(rt.invoke_blocking(&json!({})), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_invoke_returns_within_deadline() {
        let rt = runtime();
        rt.load("fn decide(s) { let n = 0; loop { n += 1; } }", "spinner")
            .expect("load");
        let started = Instant::now();
        assert_eq!(rt.invoke(&json!({"tick": 1})).await, None);
        assert!(started.elapsed() < rt.limits().deadline + BACKSTOP_GRACE + Duration::from_millis(200));
    }
}
