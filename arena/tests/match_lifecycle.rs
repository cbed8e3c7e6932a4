//! End-to-end match lifecycle scenarios on a paused Tokio clock.
//!
//! Each test drives a `MatchOrchestrator` against the scripted tick engine
//! (and optionally the recording wagering backend) and lets virtual time run
//! with `tokio::time::sleep`, so every armed timer fires at its exact offset.

use std::sync::Arc;
use std::time::Duration;

use arena::ArenaError;
use arena::core::types::{Direction, FinishReason, MatchDescriptor, MatchStatus, Side};
use arena::io::config::OrchestratorConfig;
use arena::io::lobby::LobbyEvent;
use arena::io::tick_engine::{GameOver, TickEngine};
use arena::io::wagering::Wagering;
use arena::orchestrator::MatchOrchestrator;
use arena::test_support::{RecordingWagering, ScriptedTickEngine, WagerCall};
use tokio::sync::broadcast;
use tokio::time::sleep;

struct Harness {
    orchestrator: MatchOrchestrator,
    engine: Arc<ScriptedTickEngine>,
    wagering: Arc<RecordingWagering>,
}

impl Harness {
    fn new(config: OrchestratorConfig, with_wagering: bool) -> Self {
        let engine = Arc::new(ScriptedTickEngine::new());
        let wagering = Arc::new(RecordingWagering::new());
        let collaborator: Option<Arc<dyn Wagering>> = if with_wagering {
            Some(wagering.clone() as Arc<dyn Wagering>)
        } else {
            None
        };
        let orchestrator = MatchOrchestrator::new(
            config,
            engine.clone() as Arc<dyn TickEngine>,
            collaborator,
        );
        Self {
            orchestrator,
            engine,
            wagering,
        }
    }

    fn plain() -> Self {
        Self::new(OrchestratorConfig::default(), false)
    }

    fn with_wagering() -> Self {
        Self::new(OrchestratorConfig::default(), true)
    }

    fn status(&self, match_id: &str) -> MatchStatus {
        self.orchestrator
            .get_match(match_id)
            .expect("match is registered")
            .status
    }

    /// Create, connect, and run through the countdown.
    async fn active_match(&self, agent: &str) -> MatchDescriptor {
        let created = self
            .orchestrator
            .create_challenge(agent, 3, "secret")
            .expect("admitted");
        let transport = format!("ws-{agent}");
        assert!(
            self.orchestrator
                .agent_connected(&created.id, &transport)
                .await
        );
        let betting = self.orchestrator.get_match(&created.id).expect("match");
        if betting.status == MatchStatus::Betting {
            sleep(Duration::from_secs(30)).await;
        }
        sleep(Duration::from_millis(3_100)).await;
        let active = self.orchestrator.get_match(&created.id).expect("match");
        assert_eq!(active.status, MatchStatus::Active);
        active
    }
}

fn drain(rx: &mut broadcast::Receiver<LobbyEvent>) -> Vec<LobbyEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Let spawned watcher and settlement tasks run without moving past any timer.
async fn settle_tasks() {
    sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn connected_match_is_active_after_countdown() {
    let h = Harness::plain();
    let mut lobby = h.orchestrator.subscribe();

    let created = h
        .orchestrator
        .create_challenge("maze-runner", 3, "secret")
        .expect("admitted");
    assert_eq!(created.status, MatchStatus::WaitingAgent);
    assert_eq!(created.difficulty, 3);

    assert!(h.orchestrator.agent_connected(&created.id, "ws-1").await);
    assert_eq!(h.status(&created.id), MatchStatus::Countdown);

    sleep(Duration::from_millis(2_500)).await;
    assert_eq!(h.status(&created.id), MatchStatus::Countdown);

    sleep(Duration::from_millis(1_500)).await;
    let active = h.orchestrator.get_match(&created.id).expect("match");
    assert_eq!(active.status, MatchStatus::Active);
    assert_eq!(active.transport_id.as_deref(), Some("ws-1"));

    let session = h.engine.session(&active.session_id).expect("session");
    assert!(session.started);
    assert_eq!(session.participant_id, "maze-runner");
    assert_eq!(session.difficulty, 3);

    let events = drain(&mut lobby);
    let ticks: Vec<u32> = events
        .iter()
        .filter_map(|event| match event {
            LobbyEvent::CountdownTick { remaining, .. } => Some(*remaining),
            _ => None,
        })
        .collect();
    assert_eq!(ticks, vec![3, 2, 1]);
    assert!(matches!(events.first(), Some(LobbyEvent::ChallengeCreated { .. })));
    assert!(matches!(
        events.last(),
        Some(LobbyEvent::MatchStart { session_id, .. }) if *session_id == active.session_id
    ));
}

#[tokio::test(start_paused = true)]
async fn unconnected_match_expires_after_connect_timeout() {
    let h = Harness::with_wagering();
    let created = h
        .orchestrator
        .create_challenge("ghost", 1, "secret")
        .expect("admitted");

    sleep(Duration::from_secs(59)).await;
    assert_eq!(h.status(&created.id), MatchStatus::WaitingAgent);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(h.status(&created.id), MatchStatus::Expired);
    assert_eq!(h.orchestrator.live_count(), 0);
    assert!(h.orchestrator.get_active_matches().is_empty());
    assert_eq!(h.orchestrator.get_all_matches().len(), 1);

    assert!(!h.orchestrator.agent_connected(&created.id, "ws-late").await);
    assert_eq!(h.status(&created.id), MatchStatus::Expired);
    assert!(h.engine.sessions().is_empty());
    assert!(h.wagering.calls().is_empty());
    assert!(h.wagering.settlement_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn connect_before_timeout_disarms_expiry() {
    let h = Harness::plain();
    let created = h
        .orchestrator
        .create_challenge("late-but-fine", 2, "secret")
        .expect("admitted");

    sleep(Duration::from_secs(30)).await;
    assert!(h.orchestrator.agent_connected(&created.id, "ws-1").await);
    assert!(!h.orchestrator.agent_connected(&created.id, "ws-2").await);

    sleep(Duration::from_secs(40)).await;
    assert_eq!(h.status(&created.id), MatchStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn disconnect_without_reconnect_forfeits() {
    let h = Harness::plain();
    let active = h.active_match("flaky").await;
    h.engine.set_progress(&active.session_id, 250, 2);

    assert!(h.orchestrator.agent_disconnected("ws-flaky"));
    sleep(Duration::from_secs(9)).await;
    assert_eq!(h.status(&active.id), MatchStatus::Active);

    sleep(Duration::from_secs(2)).await;
    let done = h.orchestrator.get_match(&active.id).expect("match");
    assert_eq!(done.status, MatchStatus::Completed);
    assert_eq!(done.winner, Some(Side::Opponent));
    assert_eq!(done.finish_reason, Some(FinishReason::Forfeit));
    assert_eq!(done.score, 250);

    let session = h.engine.session(&active.session_id).expect("session");
    assert!(session.stopped && session.removed);
}

#[tokio::test(start_paused = true)]
async fn reconnect_within_grace_keeps_match_alive() {
    let h = Harness::plain();
    let active = h.active_match("resilient").await;

    assert!(h.orchestrator.agent_disconnected("ws-resilient"));
    sleep(Duration::from_secs(5)).await;
    assert!(h.orchestrator.agent_reconnected(&active.id, "ws-resilient-2"));

    sleep(Duration::from_secs(20)).await;
    let still = h.orchestrator.get_match(&active.id).expect("match");
    assert_eq!(still.status, MatchStatus::Active);
    assert_eq!(still.transport_id.as_deref(), Some("ws-resilient-2"));

    // The new binding is the one a later disconnect resolves.
    assert!(!h.orchestrator.agent_disconnected("ws-unknown"));
    assert!(h.orchestrator.agent_disconnected("ws-resilient-2"));
}

#[tokio::test(start_paused = true)]
async fn disconnect_outside_active_play_is_ignored() {
    let h = Harness::plain();
    let created = h
        .orchestrator
        .create_challenge("early", 1, "secret")
        .expect("admitted");
    assert!(h.orchestrator.agent_connected(&created.id, "ws-early").await);
    assert!(!h.orchestrator.agent_disconnected("ws-early"));

    sleep(Duration::from_secs(30)).await;
    assert_eq!(h.status(&created.id), MatchStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn game_over_without_lives_goes_to_opponent() {
    let h = Harness::plain();
    let active = h.active_match("unlucky").await;

    assert_eq!(h.engine.finish(&active.session_id, 1_200, 0), 1);
    settle_tasks().await;

    let done = h.orchestrator.get_match(&active.id).expect("match");
    assert_eq!(done.status, MatchStatus::Completed);
    assert_eq!(done.winner, Some(Side::Opponent));
    assert_eq!(done.score, 1_200);
    assert_eq!(done.finish_reason, Some(FinishReason::GameOver));
}

#[tokio::test(start_paused = true)]
async fn game_over_without_lives_settles_for_opponent() {
    let h = Harness::with_wagering();
    let active = h.active_match("unlucky").await;

    assert_eq!(h.engine.finish(&active.session_id, 1_200, 0), 1);
    settle_tasks().await;

    let done = h.orchestrator.get_match(&active.id).expect("match");
    assert_eq!(done.status, MatchStatus::Settled);
    assert_eq!(done.winner, Some(Side::Opponent));
    assert_eq!(
        h.wagering.settlement_calls(),
        vec![WagerCall::Settle {
            correlation_id: active.correlation_id.clone(),
            winner: Side::Opponent,
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn game_over_racing_the_duration_cap_settles_once() {
    let h = Harness::with_wagering();
    let mut lobby = h.orchestrator.subscribe();
    // Active at 33.0s after betting and countdown; returns at 33.1s.
    let active = h.active_match("photo-finish").await;
    h.engine.set_progress(&active.session_id, 120, 2);

    // Land on the instant the 300s duration timer fires.
    sleep(Duration::from_millis(299_900)).await;
    h.engine.finish(&active.session_id, 500, 0);
    settle_tasks().await;

    let done = h.orchestrator.get_match(&active.id).expect("match");
    assert_eq!(done.status, MatchStatus::Settled);
    match done.finish_reason {
        Some(FinishReason::GameOver) => {
            assert_eq!((done.winner, done.score), (Some(Side::Opponent), 500));
        }
        // The cap reads whichever snapshot was current when it fired.
        Some(FinishReason::DurationExpired) => assert!(matches!(
            (done.winner, done.score),
            (Some(Side::Player), 120) | (Some(Side::Opponent), 500)
        )),
        other => panic!("unexpected finish reason {other:?}"),
    }
    let winner = done.winner.expect("winner recorded");
    assert_eq!(
        h.wagering.settlement_calls(),
        vec![WagerCall::Settle {
            correlation_id: active.correlation_id.clone(),
            winner,
        }]
    );
    let results = drain(&mut lobby)
        .into_iter()
        .filter(|event| matches!(event, LobbyEvent::MatchResult { .. }))
        .count();
    assert_eq!(results, 1);
}

#[tokio::test(start_paused = true)]
async fn game_over_with_lives_left_goes_to_player() {
    let h = Harness::plain();
    let mut lobby = h.orchestrator.subscribe();
    let active = h.active_match("survivor").await;

    h.engine.finish(&active.session_id, 3_400, 2);
    settle_tasks().await;

    let done = h.orchestrator.get_match(&active.id).expect("match");
    assert_eq!(done.winner, Some(Side::Player));
    assert!(drain(&mut lobby).iter().any(|event| matches!(
        event,
        LobbyEvent::MatchResult { winner: Side::Player, score: 3_400, reason: FinishReason::GameOver, .. }
    )));
}

#[tokio::test(start_paused = true)]
async fn duration_cap_decides_from_engine_snapshot() {
    let h = Harness::plain();
    let active = h.active_match("marathon").await;
    h.engine.set_progress(&active.session_id, 700, 1);

    sleep(Duration::from_secs(299)).await;
    assert_eq!(h.status(&active.id), MatchStatus::Active);

    sleep(Duration::from_secs(2)).await;
    let done = h.orchestrator.get_match(&active.id).expect("match");
    assert_eq!(done.status, MatchStatus::Completed);
    assert_eq!(done.finish_reason, Some(FinishReason::DurationExpired));
    assert_eq!(done.winner, Some(Side::Player));
    assert_eq!(done.score, 700);
}

#[tokio::test(start_paused = true)]
async fn capacity_cap_rejects_extra_challenges() {
    let config = OrchestratorConfig {
        max_live_matches: 2,
        ..OrchestratorConfig::default()
    };
    let h = Harness::new(config, false);

    h.orchestrator
        .create_challenge("a", 1, "t")
        .expect("first");
    h.orchestrator
        .create_challenge("b", 1, "t")
        .expect("second");
    assert_eq!(
        h.orchestrator.create_challenge("c", 1, "t"),
        Err(ArenaError::CapacityExceeded { live: 2, cap: 2 })
    );

    // Expired matches free their slot.
    sleep(Duration::from_secs(61)).await;
    assert_eq!(h.orchestrator.live_count(), 0);
    h.orchestrator
        .create_challenge("c", 1, "t")
        .expect("slot freed");
}

#[tokio::test(start_paused = true)]
async fn out_of_range_difficulty_is_rejected() {
    let h = Harness::plain();
    assert_eq!(
        h.orchestrator.create_challenge("a", 0, "t"),
        Err(ArenaError::InvalidDifficulty(0))
    );
    assert_eq!(
        h.orchestrator.create_challenge("a", 6, "t"),
        Err(ArenaError::InvalidDifficulty(6))
    );
    assert!(h.orchestrator.get_all_matches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn racing_terminal_triggers_settle_exactly_once() {
    let h = Harness::with_wagering();
    let active = h.active_match("contested").await;

    let event = GameOver {
        session_id: active.session_id.clone(),
        score: 900,
        lives: 1,
    };
    let (first, second) = tokio::join!(
        h.orchestrator.handle_game_over(event.clone()),
        h.orchestrator.handle_game_over(event)
    );
    assert!(first ^ second);

    // The duration cap passing later must not finalize again.
    sleep(Duration::from_secs(400)).await;

    let done = h.orchestrator.get_match(&active.id).expect("match");
    assert_eq!(done.status, MatchStatus::Settled);
    assert_eq!(
        h.wagering.settlement_calls(),
        vec![WagerCall::Settle {
            correlation_id: active.correlation_id.clone(),
            winner: Side::Player,
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn betting_window_precedes_countdown() {
    let h = Harness::with_wagering();
    let created = h
        .orchestrator
        .create_challenge("bettable", 4, "secret")
        .expect("admitted");
    assert!(h.orchestrator.agent_connected(&created.id, "ws-1").await);
    assert_eq!(h.status(&created.id), MatchStatus::Betting);
    assert_eq!(
        h.wagering.calls(),
        vec![WagerCall::Open {
            correlation_id: created.correlation_id.clone(),
            side_a: "player".to_string(),
            side_b: "opponent".to_string(),
            window: Duration::from_secs(30),
        }]
    );

    sleep(Duration::from_secs(29)).await;
    assert_eq!(h.status(&created.id), MatchStatus::Betting);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(h.status(&created.id), MatchStatus::Countdown);
    assert!(h.wagering.calls().contains(&WagerCall::Lock {
        correlation_id: created.correlation_id.clone(),
    }));

    sleep(Duration::from_secs(3)).await;
    assert_eq!(h.status(&created.id), MatchStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn wagering_failures_never_block_play() {
    let h = Harness::with_wagering();
    h.wagering.fail_open(true);
    h.wagering.fail_lock(true);
    h.wagering.fail_settle(true);

    let active = h.active_match("unbacked").await;
    h.engine.finish(&active.session_id, 10, 0);
    settle_tasks().await;

    let done = h.orchestrator.get_match(&active.id).expect("match");
    assert_eq!(done.status, MatchStatus::Completed);
    assert_eq!(h.wagering.settlement_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_session_start_expires_the_match() {
    let h = Harness::plain();
    let mut lobby = h.orchestrator.subscribe();
    h.engine.fail_next_create();
    let created = h
        .orchestrator
        .create_challenge("unlucky", 2, "secret")
        .expect("admitted");
    assert!(h.orchestrator.agent_connected(&created.id, "ws-1").await);

    sleep(Duration::from_secs(4)).await;
    assert_eq!(h.status(&created.id), MatchStatus::Expired);
    assert_eq!(h.orchestrator.live_count(), 0);
    assert!(
        !drain(&mut lobby)
            .iter()
            .any(|event| matches!(event, LobbyEvent::MatchStart { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn actions_reach_the_engine_only_while_active() {
    let h = Harness::plain();
    let created = h
        .orchestrator
        .create_challenge("pilot", 1, "secret")
        .expect("admitted");
    assert!(!h.orchestrator.agent_action(&created.id, Direction::Up));
    assert!(!h.orchestrator.agent_action("match-missing", Direction::Up));

    assert!(h.orchestrator.agent_connected(&created.id, "ws-pilot").await);
    sleep(Duration::from_secs(4)).await;
    assert!(h.orchestrator.agent_action(&created.id, Direction::Up));
    assert!(h.orchestrator.agent_action(&created.id, Direction::Left));

    let session_id = h
        .orchestrator
        .get_match(&created.id)
        .expect("match")
        .session_id;
    assert_eq!(
        h.engine.session(&session_id).expect("session").inputs,
        vec![Direction::Up, Direction::Left]
    );
}

#[tokio::test(start_paused = true)]
async fn capability_token_is_checked_but_never_exposed() {
    let h = Harness::plain();
    let created = h
        .orchestrator
        .create_challenge("holder", 1, "s3cr3t-token")
        .expect("admitted");
    assert!(h.orchestrator.authorize(&created.id, "s3cr3t-token"));
    assert!(!h.orchestrator.authorize(&created.id, "guess"));
    assert!(!h.orchestrator.authorize("match-missing", "s3cr3t-token"));

    let json = serde_json::to_string(&created).expect("serialize");
    assert!(!json.contains("s3cr3t-token"));
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_sessions_and_silences_timers() {
    let h = Harness::with_wagering();
    let active = h.active_match("running").await;
    h.orchestrator
        .create_challenge("waiting", 1, "t")
        .expect("admitted");
    assert_eq!(h.engine.running_count(), 1);

    h.orchestrator.shutdown();
    assert!(h.orchestrator.get_all_matches().is_empty());
    assert_eq!(h.orchestrator.live_count(), 0);
    assert_eq!(h.engine.running_count(), 0);
    assert!(h.engine.session(&active.session_id).expect("session").removed);

    sleep(Duration::from_secs(600)).await;
    assert!(h.orchestrator.get_all_matches().is_empty());
    assert!(h.wagering.settlement_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn history_lists_matches_in_creation_order() {
    let h = Harness::plain();
    let first = h
        .orchestrator
        .create_challenge("first", 1, "t")
        .expect("first");
    sleep(Duration::from_secs(61)).await;
    let second = h
        .orchestrator
        .create_challenge("second", 2, "t")
        .expect("second");

    let all: Vec<String> = h
        .orchestrator
        .get_all_matches()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(all, vec![first.id, second.id.clone()]);

    let live: Vec<String> = h
        .orchestrator
        .get_active_matches()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(live, vec![second.id]);
}
