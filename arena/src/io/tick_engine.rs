//! Tick-engine collaborator seam.
//!
//! The maze simulation lives outside this crate. The orchestrator and the
//! scheduler drive it through [`TickEngine`]; tests use the scripted engine in
//! `test_support`. Game-over is observed through [`GameOverHub`], a
//! per-session subscriber list: every consumer gets its own receiver, so no
//! consumer can starve another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::types::Direction;

/// Per-tick decision source for an in-process agent.
///
/// Implementations must never panic or block past their own deadline; a
/// missing decision is `None` ("no input this tick").
pub trait Decide: Send + Sync {
    fn decide(&self, state: &Value) -> Option<Direction>;
}

/// Parameters for one tick session.
#[derive(Clone)]
pub struct SessionConfig {
    /// Globally unique across every consumer of the engine.
    pub session_id: String,
    /// Participant whose inputs drive the controlled player.
    pub participant_id: String,
    pub difficulty: u8,
    pub seed: u64,
    pub maze_variant: Option<String>,
    /// In-process decision source; `None` means inputs arrive through
    /// [`TickEngine::handle_input`] from a remote agent.
    pub decider: Option<Arc<dyn Decide>>,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub tick: u64,
    pub score: i64,
    pub lives: i32,
    /// Engine-specific state handed to agents.
    pub state: Value,
}

/// Terminal event for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameOver {
    pub session_id: String,
    pub score: i64,
    pub lives: i32,
}

/// Shared, session-multiplexed game engine.
pub trait TickEngine: Send + Sync {
    fn create_session(&self, config: &SessionConfig) -> Result<()>;
    fn start_session(&self, session_id: &str) -> Result<()>;
    fn stop_session(&self, session_id: &str) -> Result<()>;
    fn remove_session(&self, session_id: &str) -> Result<()>;
    fn session_state(&self, session_id: &str) -> Option<SessionSnapshot>;
    fn handle_input(
        &self,
        session_id: &str,
        participant_id: &str,
        direction: Direction,
    ) -> Result<()>;
    /// Register interest in the session's game-over event.
    fn subscribe_game_over(&self, session_id: &str) -> oneshot::Receiver<GameOver>;
    fn replay_data(&self, session_id: &str) -> Option<Vec<u8>>;
}

/// Create, subscribe to, and start a session.
///
/// The game-over subscription is registered before the session starts so a
/// session that ends immediately is still observed. A session that fails to
/// start is removed again.
pub fn launch_session(
    engine: &dyn TickEngine,
    config: &SessionConfig,
) -> Result<oneshot::Receiver<GameOver>> {
    engine
        .create_session(config)
        .with_context(|| format!("create tick session {}", config.session_id))?;
    let game_over = engine.subscribe_game_over(&config.session_id);
    if let Err(err) = engine.start_session(&config.session_id) {
        if let Err(cleanup) = engine.remove_session(&config.session_id) {
            warn!(session_id = %config.session_id, err = %cleanup, "remove after failed start");
        }
        return Err(err.context(format!("start tick session {}", config.session_id)));
    }
    debug!(session_id = %config.session_id, seed = config.seed, "tick session started");
    Ok(game_over)
}

/// Best-effort stop and removal of a session. Failures are logged only.
pub fn teardown_session(engine: &dyn TickEngine, session_id: &str) {
    if let Err(err) = engine.stop_session(session_id) {
        warn!(session_id, err = %err, "stop tick session failed");
    }
    if let Err(err) = engine.remove_session(session_id) {
        warn!(session_id, err = %err, "remove tick session failed");
    }
}

/// Per-session game-over subscriber lists for engine implementations.
#[derive(Debug, Default)]
pub struct GameOverHub {
    subscribers: Mutex<HashMap<String, Vec<oneshot::Sender<GameOver>>>>,
}

impl GameOverHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, session_id: &str) -> oneshot::Receiver<GameOver> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.entry(session_id.to_string()).or_default().push(tx);
        }
        rx
    }

    /// Deliver `event` to every subscriber of its session.
    ///
    /// Returns the number of live subscribers that received it. The
    /// session's list is consumed: game-over fires once per session.
    pub fn publish(&self, event: &GameOver) -> usize {
        let senders = match self.subscribers.lock() {
            Ok(mut subs) => subs.remove(&event.session_id).unwrap_or_default(),
            Err(_) => return 0,
        };
        let delivered = senders
            .into_iter()
            .filter(|tx| !tx.is_closed())
            .map(|tx| tx.send(event.clone()))
            .filter(Result::is_ok)
            .count();
        debug!(session_id = %event.session_id, delivered, "game over published");
        delivered
    }

    /// Drop all subscribers of a removed session; their receivers observe closure.
    pub fn forget(&self, session_id: &str) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.remove(session_id);
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.subscribers
            .lock()
            .map(|subs| subs.get(session_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}
