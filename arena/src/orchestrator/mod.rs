//! Match orchestrator: one state machine per match.
//!
//! All transitions for a match run under the registry lock, which is never
//! held across an `.await`; collaborator calls (tick engine, wagering) happen
//! before or after the locked section. Every timer is a spawned Tokio task
//! tracked in the match's [`TimerSlots`](crate::core::timers::TimerSlots);
//! a firing timer acts only if its token is still current and the match is
//! still in the status that timer guards.

mod registry;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::core::outcome::decide_winner;
use crate::core::timers::{TimerKind, TimerToken};
use crate::core::types::{
    Direction, FinishReason, MAX_DIFFICULTY, MIN_DIFFICULTY, MatchDescriptor, MatchStatus, Side,
};
use crate::error::ArenaError;
use crate::io::config::OrchestratorConfig;
use crate::io::lobby::{Lobby, LobbyEvent};
use crate::io::tick_engine::{
    GameOver, SessionConfig, TickEngine, launch_session, teardown_session,
};
use crate::io::wagering::Wagering;
use registry::{MatchRecord, Registry};

const COUNTDOWN_STEP: Duration = Duration::from_secs(1);

struct Inner {
    config: OrchestratorConfig,
    engine: Arc<dyn TickEngine>,
    wagering: Option<Arc<dyn Wagering>>,
    lobby: Lobby,
    registry: Mutex<Registry>,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drives matches from admission to settlement. Cheap to clone.
///
/// Must be used from within a Tokio runtime: transitions spawn timer tasks.
#[derive(Clone)]
pub struct MatchOrchestrator {
    inner: Arc<Inner>,
}

impl MatchOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        engine: Arc<dyn TickEngine>,
        wagering: Option<Arc<dyn Wagering>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                engine,
                wagering,
                lobby: Lobby::new(),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    pub fn lobby(&self) -> &Lobby {
        &self.inner.lobby
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LobbyEvent> {
        self.inner.lobby.subscribe()
    }

    /// Admit a new challenge if under the live-match cap.
    #[instrument(skip(self, token))]
    pub fn create_challenge(
        &self,
        agent_id: &str,
        difficulty: u8,
        token: &str,
    ) -> Result<MatchDescriptor, ArenaError> {
        if !(MIN_DIFFICULTY..=MAX_DIFFICULTY).contains(&difficulty) {
            return Err(ArenaError::InvalidDifficulty(difficulty));
        }
        let descriptor = {
            let mut registry = self.inner.registry();
            let live = registry.live_count();
            let cap = self.inner.config.max_live_matches;
            if live >= cap {
                warn!(live, cap, "challenge rejected, capacity exceeded");
                return Err(ArenaError::CapacityExceeded { live, cap });
            }
            let mut record = MatchRecord::new(agent_id, token, difficulty);
            record.transition(MatchStatus::WaitingAgent);
            self.arm_timer(
                &mut record,
                TimerKind::Connect,
                self.inner.config.connect_timeout(),
            );
            let descriptor = record.descriptor();
            registry.insert(record);
            descriptor
        };

        info!(match_id = %descriptor.id, "challenge created");
        self.inner.lobby.publish(LobbyEvent::ChallengeCreated {
            match_id: descriptor.id.clone(),
            agent_id: agent_id.to_string(),
            difficulty,
        });
        self.inner.lobby.feed(
            &descriptor.id,
            format!("{agent_id} entered the maze at difficulty {difficulty}"),
        );
        Ok(descriptor)
    }

    /// Bind the agent's transport and leave `waiting_agent`.
    #[instrument(skip(self))]
    pub async fn agent_connected(&self, match_id: &str, transport_id: &str) -> bool {
        let betting = {
            let mut registry = self.inner.registry();
            let Some(record) = registry.get_mut(match_id) else {
                debug!("connect for unknown match");
                return false;
            };
            if record.status != MatchStatus::WaitingAgent {
                debug!(status = ?record.status, "connect ignored");
                return false;
            }
            if let Some(handle) = record.timers.disarm(TimerKind::Connect) {
                handle.abort();
            }
            record.transport_id = Some(transport_id.to_string());
            if self.inner.wagering.is_some() {
                record.transition(MatchStatus::Betting);
                self.arm_timer(
                    record,
                    TimerKind::BettingWindow,
                    self.inner.config.betting_window(),
                );
                Some(record.correlation_id.clone())
            } else {
                self.enter_countdown(record);
                None
            }
        };

        info!("agent connected");
        if let (Some(correlation_id), Some(wagering)) = (betting, &self.inner.wagering) {
            let opened = wagering
                .open_betting_window(
                    correlation_id,
                    Side::Player.as_str().to_string(),
                    Side::Opponent.as_str().to_string(),
                    self.inner.config.betting_window(),
                )
                .await;
            if let Err(err) = opened {
                warn!(err = %format!("{err:#}"), "open betting window failed");
            }
        }
        true
    }

    /// Start the reconnect grace period for the match bound to `transport_id`.
    #[instrument(skip(self))]
    pub fn agent_disconnected(&self, transport_id: &str) -> bool {
        let mut registry = self.inner.registry();
        let Some(record) = registry.find_by_transport(transport_id) else {
            debug!("disconnect for unknown transport");
            return false;
        };
        if record.status != MatchStatus::Active {
            debug!(match_id = %record.id, status = ?record.status, "disconnect outside active play");
            return false;
        }
        self.arm_timer(
            record,
            TimerKind::ReconnectGrace,
            self.inner.config.reconnect_grace(),
        );
        info!(match_id = %record.id, "agent disconnected, grace period started");
        true
    }

    /// Cancel any pending forfeit and rebind the transport.
    #[instrument(skip(self))]
    pub fn agent_reconnected(&self, match_id: &str, transport_id: &str) -> bool {
        let mut registry = self.inner.registry();
        let Some(record) = registry.get_mut(match_id) else {
            debug!("reconnect for unknown match");
            return false;
        };
        if let Some(handle) = record.timers.disarm(TimerKind::ReconnectGrace) {
            handle.abort();
            info!("agent reconnected within grace");
        }
        record.transport_id = Some(transport_id.to_string());
        true
    }

    /// Forward an input to the tick engine. No-op outside active play.
    pub fn agent_action(&self, match_id: &str, direction: Direction) -> bool {
        let target = {
            let registry = self.inner.registry();
            match registry.get(match_id) {
                Some(record) if record.status == MatchStatus::Active => {
                    Some((record.session_id.clone(), record.agent_id.clone()))
                }
                _ => None,
            }
        };
        let Some((session_id, agent_id)) = target else {
            return false;
        };
        match self
            .inner
            .engine
            .handle_input(&session_id, &agent_id, direction)
        {
            Ok(()) => true,
            Err(err) => {
                warn!(match_id, err = %format!("{err:#}"), "input rejected by tick engine");
                false
            }
        }
    }

    /// React to a tick engine game-over event.
    pub async fn handle_game_over(&self, event: GameOver) -> bool {
        let match_id = self.inner.registry().id_for_session(&event.session_id);
        let Some(match_id) = match_id else {
            debug!(session_id = %event.session_id, "game over for unknown session");
            return false;
        };
        let winner = decide_winner(event.lives);
        self.finalize(&match_id, FinishReason::GameOver, winner, event.score)
            .await
    }

    pub fn get_match(&self, match_id: &str) -> Option<MatchDescriptor> {
        self.inner
            .registry()
            .get(match_id)
            .map(MatchRecord::descriptor)
    }

    /// Live matches in creation order.
    pub fn get_active_matches(&self) -> Vec<MatchDescriptor> {
        self.inner.registry().descriptors(MatchStatus::is_live)
    }

    /// Every retained match, including finished history.
    pub fn get_all_matches(&self) -> Vec<MatchDescriptor> {
        self.inner.registry().descriptors(|_| true)
    }

    pub fn live_count(&self) -> usize {
        self.inner.registry().live_count()
    }

    /// Check a capability token presented by a transport.
    pub fn authorize(&self, match_id: &str, token: &str) -> bool {
        self.inner
            .registry()
            .get(match_id)
            .is_some_and(|record| record.token == token)
    }

    /// Stop every live session, cancel every timer, and clear the registry.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        let records = self.inner.registry().drain();
        let mut sessions = Vec::new();
        for mut record in records {
            record.cancel_timers();
            if record.status == MatchStatus::Active {
                sessions.push(record.session_id);
            }
        }
        for session_id in &sessions {
            teardown_session(self.inner.engine.as_ref(), session_id);
        }
        info!(stopped_sessions = sessions.len(), "orchestrator shut down");
    }

    fn arm_timer(&self, record: &mut MatchRecord, kind: TimerKind, delay: Duration) {
        let token = record.timers.next_token(kind);
        let weak = Arc::downgrade(&self.inner);
        let match_id = record.id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(orchestrator) = upgrade(&weak) {
                orchestrator.on_timer(&match_id, token).await;
            }
        })
        .abort_handle();
        if let Some(previous) = record.timers.arm(token, handle) {
            previous.abort();
        }
    }

    fn watch_game_over(&self, record: &mut MatchRecord, game_over: oneshot::Receiver<GameOver>) {
        let token = record.timers.next_token(TimerKind::GameOverWatch);
        let weak = Arc::downgrade(&self.inner);
        let match_id = record.id.clone();
        let handle = tokio::spawn(async move {
            let Ok(event) = game_over.await else {
                debug!(%match_id, "game-over channel closed");
                return;
            };
            if let Some(orchestrator) = upgrade(&weak) {
                let current = orchestrator
                    .inner
                    .registry()
                    .get_mut(&match_id)
                    .is_some_and(|record| record.timers.fire(token));
                if current {
                    orchestrator.handle_game_over(event).await;
                }
            }
        })
        .abort_handle();
        if let Some(previous) = record.timers.arm(token, handle) {
            previous.abort();
        }
    }

    async fn on_timer(&self, match_id: &str, token: TimerToken) {
        {
            let mut registry = self.inner.registry();
            let Some(record) = registry.get_mut(match_id) else {
                return;
            };
            if !record.timers.fire(token) {
                debug!(match_id, kind = ?token.kind, "stale timer ignored");
                return;
            }
        }
        match token.kind {
            TimerKind::Connect => self.expire_unconnected(match_id),
            TimerKind::BettingWindow => self.close_betting_window(match_id).await,
            TimerKind::Countdown => self.countdown_step(match_id),
            TimerKind::Duration => self.duration_expired(match_id).await,
            TimerKind::ReconnectGrace => self.reconnect_grace_expired(match_id).await,
            TimerKind::GameOverWatch => {}
        }
    }

    fn expire_unconnected(&self, match_id: &str) {
        {
            let mut registry = self.inner.registry();
            let Some(record) = registry.get_mut(match_id) else {
                return;
            };
            if record.status != MatchStatus::WaitingAgent {
                return;
            }
            record.transition(MatchStatus::Expired);
            record.cancel_timers();
        }
        info!(match_id, "match expired, agent never connected");
        self.inner
            .lobby
            .feed(match_id, "match expired: agent never connected");
    }

    async fn close_betting_window(&self, match_id: &str) {
        let correlation_id = {
            let mut registry = self.inner.registry();
            let Some(record) = registry.get_mut(match_id) else {
                return;
            };
            if record.status != MatchStatus::Betting {
                return;
            }
            self.enter_countdown(record);
            record.correlation_id.clone()
        };
        if let Some(wagering) = &self.inner.wagering
            && let Err(err) = wagering.lock_bets(correlation_id).await
        {
            warn!(match_id, err = %format!("{err:#}"), "lock bets failed, continuing");
        }
    }

    fn enter_countdown(&self, record: &mut MatchRecord) {
        if !record.transition(MatchStatus::Countdown) {
            return;
        }
        let seconds = self.inner.config.countdown_secs;
        record.countdown_remaining = seconds;
        let delay = if seconds > 0 {
            self.inner.lobby.publish(LobbyEvent::CountdownTick {
                match_id: record.id.clone(),
                remaining: seconds,
            });
            COUNTDOWN_STEP
        } else {
            Duration::ZERO
        };
        self.arm_timer(record, TimerKind::Countdown, delay);
    }

    fn countdown_step(&self, match_id: &str) {
        {
            let mut registry = self.inner.registry();
            let Some(record) = registry.get_mut(match_id) else {
                return;
            };
            if record.status != MatchStatus::Countdown {
                return;
            }
            record.countdown_remaining = record.countdown_remaining.saturating_sub(1);
            if record.countdown_remaining > 0 {
                self.inner.lobby.publish(LobbyEvent::CountdownTick {
                    match_id: record.id.clone(),
                    remaining: record.countdown_remaining,
                });
                self.arm_timer(record, TimerKind::Countdown, COUNTDOWN_STEP);
                return;
            }
        }
        self.start_match(match_id);
    }

    fn start_match(&self, match_id: &str) {
        let config = {
            let registry = self.inner.registry();
            let Some(record) = registry.get(match_id) else {
                return;
            };
            if record.status != MatchStatus::Countdown {
                return;
            }
            SessionConfig {
                session_id: record.session_id.clone(),
                participant_id: record.agent_id.clone(),
                difficulty: record.difficulty,
                seed: rand::random(),
                maze_variant: None,
                decider: None,
            }
        };

        let launched = launch_session(self.inner.engine.as_ref(), &config);

        let mut registry = self.inner.registry();
        let still_counting = registry
            .get(match_id)
            .is_some_and(|record| record.status == MatchStatus::Countdown);
        if !still_counting {
            // Cleared or moved on while the session was starting.
            drop(registry);
            if launched.is_ok() {
                teardown_session(self.inner.engine.as_ref(), &config.session_id);
            }
            return;
        }
        let Some(record) = registry.get_mut(match_id) else {
            return;
        };
        match launched {
            Ok(game_over) => {
                record.transition(MatchStatus::Active);
                self.arm_timer(
                    record,
                    TimerKind::Duration,
                    self.inner.config.match_duration(),
                );
                self.watch_game_over(record, game_over);
                info!(match_id, session_id = %config.session_id, "match started");
                self.inner.lobby.publish(LobbyEvent::MatchStart {
                    match_id: match_id.to_string(),
                    session_id: config.session_id.clone(),
                });
            }
            Err(err) => {
                record.transition(MatchStatus::Expired);
                record.cancel_timers();
                warn!(match_id, err = %format!("{err:#}"), "tick session failed, match expired");
                self.inner
                    .lobby
                    .feed(match_id, "match expired: game session could not start");
            }
        }
    }

    async fn duration_expired(&self, match_id: &str) {
        let Some((score, lives)) = self.current_standing(match_id) else {
            return;
        };
        self.finalize(
            match_id,
            FinishReason::DurationExpired,
            decide_winner(lives),
            score,
        )
        .await;
    }

    async fn reconnect_grace_expired(&self, match_id: &str) {
        let Some((score, _)) = self.current_standing(match_id) else {
            return;
        };
        info!(match_id, "reconnect grace expired, agent forfeits");
        self.finalize(match_id, FinishReason::Forfeit, Side::Opponent, score)
            .await;
    }

    /// Score and lives of an active match, from the engine when it has a snapshot.
    fn current_standing(&self, match_id: &str) -> Option<(i64, i32)> {
        let (session_id, recorded_score) = {
            let registry = self.inner.registry();
            let record = registry.get(match_id)?;
            if record.status != MatchStatus::Active {
                return None;
            }
            (record.session_id.clone(), record.score)
        };
        let standing = self
            .inner
            .engine
            .session_state(&session_id)
            .map_or((recorded_score, 1), |snap| (snap.score, snap.lives));
        Some(standing)
    }

    /// Complete an active match exactly once.
    ///
    /// Returns false if the match is unknown or no longer active, which is how
    /// racing terminal triggers lose.
    async fn finalize(
        &self,
        match_id: &str,
        reason: FinishReason,
        winner: Side,
        score: i64,
    ) -> bool {
        let (session_id, correlation_id, agent_id, settle) = {
            let mut registry = self.inner.registry();
            let Some(record) = registry.get_mut(match_id) else {
                return false;
            };
            if record.status != MatchStatus::Active {
                debug!(match_id, ?reason, status = ?record.status, "finalize lost the race");
                return false;
            }
            record.transition(MatchStatus::Completed);
            record.winner = Some(winner);
            record.score = score;
            record.finish_reason = Some(reason);
            record.cancel_timers();
            let settle = self.inner.wagering.is_some() && !record.settlement_requested;
            record.settlement_requested |= settle;
            (
                record.session_id.clone(),
                record.correlation_id.clone(),
                record.agent_id.clone(),
                settle,
            )
        };

        info!(match_id, ?reason, ?winner, score, "match completed");
        self.inner.lobby.publish(LobbyEvent::MatchResult {
            match_id: match_id.to_string(),
            winner,
            score,
            reason,
        });
        let verb = match winner {
            Side::Player => "beat",
            Side::Opponent => "fell to",
        };
        self.inner
            .lobby
            .feed(match_id, format!("{agent_id} {verb} the maze with {score} points"));
        teardown_session(self.inner.engine.as_ref(), &session_id);

        if settle {
            self.settle(match_id, correlation_id, winner).await;
        }
        true
    }

    async fn settle(&self, match_id: &str, correlation_id: String, winner: Side) {
        let Some(wagering) = &self.inner.wagering else {
            return;
        };
        match wagering.settle_bets(correlation_id, winner).await {
            Ok(()) => {
                let mut registry = self.inner.registry();
                if let Some(record) = registry.get_mut(match_id)
                    && record.status == MatchStatus::Completed
                {
                    record.transition(MatchStatus::Settled);
                }
                info!(match_id, "match settled");
            }
            Err(err) => {
                warn!(match_id, err = %format!("{err:#}"), "settlement failed, match stays completed");
            }
        }
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<MatchOrchestrator> {
    weak.upgrade().map(|inner| MatchOrchestrator { inner })
}
