//! Test-only collaborators: a scripted tick engine and a recording wagering
//! backend.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::oneshot;

use crate::core::types::{Direction, Side};
use crate::io::tick_engine::{
    Decide, GameOver, GameOverHub, SessionConfig, SessionSnapshot, TickEngine,
};
use crate::io::wagering::Wagering;

/// What the scripted engine remembers about one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub participant_id: String,
    pub difficulty: u8,
    pub seed: u64,
    pub maze_variant: Option<String>,
    pub started: bool,
    pub stopped: bool,
    pub removed: bool,
    pub inputs: Vec<Direction>,
    /// Decisions pulled from an in-process decider on start.
    pub decisions: Vec<Option<Direction>>,
    pub snapshot: Option<SessionSnapshot>,
}

#[derive(Default)]
struct EngineState {
    sessions: HashMap<String, SessionRecord>,
    order: Vec<String>,
    deciders: HashMap<String, Arc<dyn Decide>>,
    /// Outcome published as soon as a session for this participant starts.
    scripted: HashMap<String, (i64, i32)>,
    fail_create_for: HashSet<String>,
}

/// In-memory tick engine driven by the test.
///
/// Sessions never advance on their own: a test either scripts an outcome per
/// participant (published on start) or calls [`ScriptedTickEngine::finish`].
#[derive(Default)]
pub struct ScriptedTickEngine {
    state: Mutex<EngineState>,
    hub: GameOverHub,
    fail_next_create: AtomicBool,
    fail_next_start: AtomicBool,
    panic_on_replay: AtomicBool,
}

impl ScriptedTickEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn script_outcome(&self, participant_id: &str, score: i64, lives: i32) {
        self.state()
            .scripted
            .insert(participant_id.to_string(), (score, lives));
    }

    pub fn fail_next_create(&self) {
        self.fail_next_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_start(&self) {
        self.fail_next_start.store(true, Ordering::SeqCst);
    }

    /// Make every later `replay_data` call panic.
    pub fn panic_on_replay(&self) {
        self.panic_on_replay.store(true, Ordering::SeqCst);
    }

    pub fn fail_create_for(&self, participant_id: &str) {
        self.state()
            .fail_create_for
            .insert(participant_id.to_string());
    }

    /// Update the snapshot the engine reports without ending the session.
    pub fn set_progress(&self, session_id: &str, score: i64, lives: i32) {
        if let Some(record) = self.state().sessions.get_mut(session_id) {
            let tick = record.snapshot.as_ref().map_or(0, |s| s.tick) + 1;
            record.snapshot = Some(snapshot(tick, score, lives));
        }
    }

    /// End a session and notify its game-over subscribers.
    pub fn finish(&self, session_id: &str, score: i64, lives: i32) -> usize {
        self.set_progress(session_id, score, lives);
        self.hub.publish(&GameOver {
            session_id: session_id.to_string(),
            score,
            lives,
        })
    }

    pub fn session(&self, session_id: &str) -> Option<SessionRecord> {
        self.state().sessions.get(session_id).cloned()
    }

    /// Every session ever created, in creation order.
    pub fn sessions(&self) -> Vec<SessionRecord> {
        let state = self.state();
        state
            .order
            .iter()
            .filter_map(|id| state.sessions.get(id).cloned())
            .collect()
    }

    pub fn sessions_for(&self, participant_id: &str) -> Vec<SessionRecord> {
        self.sessions()
            .into_iter()
            .filter(|s| s.participant_id == participant_id)
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.sessions()
            .iter()
            .filter(|s| s.started && !s.stopped)
            .count()
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.hub.subscriber_count(session_id)
    }
}

fn snapshot(tick: u64, score: i64, lives: i32) -> SessionSnapshot {
    SessionSnapshot {
        tick,
        score,
        lives,
        state: json!({ "tick": tick, "score": score, "lives": lives }),
    }
}

impl TickEngine for ScriptedTickEngine {
    fn create_session(&self, config: &SessionConfig) -> Result<()> {
        if self.fail_next_create.swap(false, Ordering::SeqCst) {
            bail!("scripted create failure");
        }
        let mut state = self.state();
        if state.fail_create_for.contains(&config.participant_id) {
            bail!("scripted create failure for {}", config.participant_id);
        }
        if state.sessions.contains_key(&config.session_id) {
            bail!("duplicate session id {}", config.session_id);
        }
        state.sessions.insert(
            config.session_id.clone(),
            SessionRecord {
                session_id: config.session_id.clone(),
                participant_id: config.participant_id.clone(),
                difficulty: config.difficulty,
                seed: config.seed,
                maze_variant: config.maze_variant.clone(),
                started: false,
                stopped: false,
                removed: false,
                inputs: Vec::new(),
                decisions: Vec::new(),
                snapshot: None,
            },
        );
        state.order.push(config.session_id.clone());
        if let Some(decider) = &config.decider {
            state
                .deciders
                .insert(config.session_id.clone(), Arc::clone(decider));
        }
        Ok(())
    }

    fn start_session(&self, session_id: &str) -> Result<()> {
        if self.fail_next_start.swap(false, Ordering::SeqCst) {
            bail!("scripted start failure");
        }
        let (decider, scripted) = {
            let mut state = self.state();
            let decider = state.deciders.get(session_id).cloned();
            let record = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| anyhow!("unknown session {session_id}"))?;
            record.started = true;
            record.snapshot = Some(snapshot(0, 0, 3));
            let participant = record.participant_id.clone();
            (decider, state.scripted.get(&participant).copied())
        };

        if let Some(decider) = decider {
            let first = snapshot(0, 0, 3);
            let decision = decider.decide(&first.state);
            if let Some(record) = self.state().sessions.get_mut(session_id) {
                record.decisions.push(decision);
            }
        }
        if let Some((score, lives)) = scripted {
            self.finish(session_id, score, lives);
        }
        Ok(())
    }

    fn stop_session(&self, session_id: &str) -> Result<()> {
        let mut state = self.state();
        let record = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("unknown session {session_id}"))?;
        record.stopped = true;
        Ok(())
    }

    fn remove_session(&self, session_id: &str) -> Result<()> {
        {
            let mut state = self.state();
            state.deciders.remove(session_id);
            let record = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| anyhow!("unknown session {session_id}"))?;
            record.removed = true;
        }
        self.hub.forget(session_id);
        Ok(())
    }

    fn session_state(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.state()
            .sessions
            .get(session_id)
            .filter(|record| !record.removed)
            .and_then(|record| record.snapshot.clone())
    }

    fn handle_input(
        &self,
        session_id: &str,
        participant_id: &str,
        direction: Direction,
    ) -> Result<()> {
        let mut state = self.state();
        let record = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("unknown session {session_id}"))?;
        if !record.started || record.stopped {
            bail!("session {session_id} is not running");
        }
        if record.participant_id != participant_id {
            bail!("{participant_id} does not control session {session_id}");
        }
        record.inputs.push(direction);
        Ok(())
    }

    fn subscribe_game_over(&self, session_id: &str) -> oneshot::Receiver<GameOver> {
        self.hub.subscribe(session_id)
    }

    fn replay_data(&self, session_id: &str) -> Option<Vec<u8>> {
        if self.panic_on_replay.load(Ordering::SeqCst) {
            panic!("scripted replay panic for {session_id}");
        }
        self.state()
            .sessions
            .get(session_id)
            .map(|record| format!("replay:{}:{}", record.session_id, record.seed).into_bytes())
    }
}

/// One call observed by [`RecordingWagering`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WagerCall {
    Open {
        correlation_id: String,
        side_a: String,
        side_b: String,
        window: Duration,
    },
    Lock {
        correlation_id: String,
    },
    Settle {
        correlation_id: String,
        winner: Side,
    },
}

/// Wagering backend that records every call and can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingWagering {
    calls: Mutex<Vec<WagerCall>>,
    fail_open: AtomicBool,
    fail_lock: AtomicBool,
    fail_settle: AtomicBool,
}

impl RecordingWagering {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn fail_lock(&self, fail: bool) {
        self.fail_lock.store(fail, Ordering::SeqCst);
    }

    pub fn fail_settle(&self, fail: bool) {
        self.fail_settle.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<WagerCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn settlement_calls(&self) -> Vec<WagerCall> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, WagerCall::Settle { .. }))
            .collect()
    }

    fn record(&self, call: WagerCall, fail: &AtomicBool) -> BoxFuture<'_, Result<()>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        let fail = fail.load(Ordering::SeqCst);
        async move {
            if fail {
                bail!("scripted wagering failure");
            }
            Ok(())
        }
        .boxed()
    }
}

impl Wagering for RecordingWagering {
    fn open_betting_window(
        &self,
        correlation_id: String,
        side_a: String,
        side_b: String,
        window: Duration,
    ) -> BoxFuture<'_, Result<()>> {
        let call = WagerCall::Open {
            correlation_id,
            side_a,
            side_b,
            window,
        };
        self.record(call, &self.fail_open)
    }

    fn lock_bets(&self, correlation_id: String) -> BoxFuture<'_, Result<()>> {
        self.record(WagerCall::Lock { correlation_id }, &self.fail_lock)
    }

    fn settle_bets(&self, correlation_id: String, winner: Side) -> BoxFuture<'_, Result<()>> {
        self.record(
            WagerCall::Settle {
                correlation_id,
                winner,
            },
            &self.fail_settle,
        )
    }
}
