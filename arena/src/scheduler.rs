//! Bounded-concurrency FIFO runner for two-sided pairings.
//!
//! Used for tournament rounds: no connect, betting, or countdown phases. Each
//! side of a pairing runs as its own tick session on the shared engine with
//! the same seed and maze variant, and the higher cumulative score wins.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::core::outcome::{PairingWinner, compare_scores};
use crate::io::config::SchedulerConfig;
use crate::io::tick_engine::{
    Decide, GameOver, SessionConfig, TickEngine, launch_session, teardown_session,
};

/// One side of a pairing.
#[derive(Clone)]
pub struct Contender {
    pub agent_id: String,
    /// In-process decision source; `None` for remote agents.
    pub decider: Option<Arc<dyn Decide>>,
}

impl Contender {
    pub fn remote(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            decider: None,
        }
    }

    pub fn in_process(agent_id: impl Into<String>, decider: Arc<dyn Decide>) -> Self {
        Self {
            agent_id: agent_id.into(),
            decider: Some(decider),
        }
    }
}

#[derive(Clone)]
pub struct ScheduledJob {
    pub match_id: String,
    /// Round or tournament correlation id.
    pub round_id: Option<String>,
    pub maze_variant: Option<String>,
    /// Shared by both sides.
    pub seed: u64,
    pub difficulty: u8,
    pub side_a: Contender,
    pub side_b: Contender,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideResult {
    pub agent_id: String,
    pub session_id: String,
    pub score: i64,
    pub lives: i32,
    pub replay: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingOutcome {
    pub winner: PairingWinner,
    pub side_a: SideResult,
    pub side_b: SideResult,
}

/// Delivered to the completion callback once per processed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub match_id: String,
    pub round_id: Option<String>,
    /// Failure message when a side failed to start, timed out, or panicked.
    pub outcome: Result<PairingOutcome, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Started,
    /// 1-based position in the pending queue.
    Queued { position: usize },
}

pub type CompletionCallback = Arc<dyn Fn(JobResult) + Send + Sync>;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<ScheduledJob>,
    active: usize,
    /// Bumped by `shutdown`; jobs started under an older epoch release nothing.
    epoch: u64,
}

struct Inner {
    config: SchedulerConfig,
    engine: Arc<dyn TickEngine>,
    on_complete: CompletionCallback,
    state: Mutex<QueueState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// FIFO job runner. Cheap to clone; must be used inside a Tokio runtime.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        engine: Arc<dyn TickEngine>,
        on_complete: CompletionCallback,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                engine,
                on_complete,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Start `job` now if a slot is free, otherwise queue it.
    #[instrument(skip_all, fields(match_id = %job.match_id))]
    pub fn schedule_match(&self, job: ScheduledJob) -> ScheduleOutcome {
        let mut state = self.inner.state();
        if state.active < self.inner.config.max_concurrent {
            state.active += 1;
            let epoch = state.epoch;
            drop(state);
            spawn_job(&self.inner, job, epoch);
            ScheduleOutcome::Started
        } else {
            state.pending.push_back(job);
            let position = state.pending.len();
            debug!(position, "pairing queued");
            ScheduleOutcome::Queued { position }
        }
    }

    /// Schedule a batch in order under the same cap.
    pub fn schedule_round_matches(
        &self,
        jobs: impl IntoIterator<Item = ScheduledJob>,
    ) -> Vec<ScheduleOutcome> {
        jobs.into_iter().map(|job| self.schedule_match(job)).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state().pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.state().active
    }

    /// Drop the pending queue and active bookkeeping.
    ///
    /// Jobs already running complete and report, but no longer hold slots.
    pub fn shutdown(&self) {
        let mut state = self.inner.state();
        let dropped = state.pending.len();
        state.pending.clear();
        state.active = 0;
        state.epoch += 1;
        info!(dropped, "scheduler shut down");
    }
}

/// Releases a concurrency slot and pulls the next job when dropped, so a
/// panicking callback cannot leak the slot.
struct ActiveSlot {
    inner: Arc<Inner>,
    epoch: u64,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        let next = {
            let mut state = self.inner.state();
            if state.epoch != self.epoch {
                return;
            }
            state.active = state.active.saturating_sub(1);
            let next = state.pending.pop_front();
            if next.is_some() {
                state.active += 1;
            }
            next
        };
        if let Some(job) = next {
            spawn_job(&self.inner, job, self.epoch);
        }
    }
}

fn spawn_job(inner: &Arc<Inner>, job: ScheduledJob, epoch: u64) {
    let Ok(handle) = Handle::try_current() else {
        warn!(match_id = %job.match_id, "no runtime to run pairing, job dropped");
        let mut state = inner.state();
        if state.epoch == epoch {
            state.active = state.active.saturating_sub(1);
        }
        return;
    };
    let slot = ActiveSlot {
        inner: Arc::clone(inner),
        epoch,
    };
    handle.spawn(process(slot, job));
}

async fn process(slot: ActiveSlot, job: ScheduledJob) {
    let match_id = job.match_id.clone();
    let round_id = job.round_id.clone();
    let engine = Arc::clone(&slot.inner.engine);
    let side_timeout = slot.inner.config.side_timeout();

    // A nested task turns a panicking pairing into a JoinError.
    let worker = tokio::spawn(async move { run_pairing(engine.as_ref(), &job, side_timeout).await });
    let outcome = match worker.await {
        Ok(Ok(outcome)) => {
            info!(%match_id, winner = ?outcome.winner, "pairing finished");
            Ok(outcome)
        }
        Ok(Err(err)) => {
            warn!(%match_id, err = %format!("{err:#}"), "pairing failed");
            Err(format!("{err:#}"))
        }
        Err(err) => {
            warn!(%match_id, %err, "pairing task aborted");
            Err(format!("pairing task aborted: {err}"))
        }
    };

    (slot.inner.on_complete)(JobResult {
        match_id,
        round_id,
        outcome,
    });
    drop(slot);
}

/// Stops and removes every held session when dropped, unwinding included.
struct SessionTeardown<'a> {
    engine: &'a dyn TickEngine,
    session_ids: Vec<String>,
}

impl<'a> SessionTeardown<'a> {
    fn new(engine: &'a dyn TickEngine) -> Self {
        Self {
            engine,
            session_ids: Vec::new(),
        }
    }

    fn hold(&mut self, session_id: &str) {
        self.session_ids.push(session_id.to_string());
    }
}

impl Drop for SessionTeardown<'_> {
    fn drop(&mut self) {
        for session_id in &self.session_ids {
            teardown_session(self.engine, session_id);
        }
    }
}

async fn run_pairing(
    engine: &dyn TickEngine,
    job: &ScheduledJob,
    side_timeout: Duration,
) -> Result<PairingOutcome> {
    let config_a = side_config(job, &job.side_a, "a");
    let config_b = side_config(job, &job.side_b, "b");
    let mut live = SessionTeardown::new(engine);

    let game_over_a = launch_session(engine, &config_a).context("side a")?;
    live.hold(&config_a.session_id);
    let game_over_b = launch_session(engine, &config_b).context("side b")?;
    live.hold(&config_b.session_id);

    let (result_a, result_b) = tokio::join!(
        wait_side(game_over_a, side_timeout),
        wait_side(game_over_b, side_timeout)
    );

    let replay_a = engine.replay_data(&config_a.session_id);
    let replay_b = engine.replay_data(&config_b.session_id);
    drop(live);

    let a = result_a.with_context(|| format!("side a ({})", job.side_a.agent_id))?;
    let b = result_b.with_context(|| format!("side b ({})", job.side_b.agent_id))?;
    Ok(PairingOutcome {
        winner: compare_scores(a.score, b.score),
        side_a: side_result(&job.side_a, a, replay_a),
        side_b: side_result(&job.side_b, b, replay_b),
    })
}

fn side_config(job: &ScheduledJob, contender: &Contender, side: &str) -> SessionConfig {
    SessionConfig {
        session_id: format!("{}-{side}-{}", job.match_id, Uuid::new_v4().simple()),
        participant_id: contender.agent_id.clone(),
        difficulty: job.difficulty,
        seed: job.seed,
        maze_variant: job.maze_variant.clone(),
        decider: contender.decider.clone(),
    }
}

fn side_result(contender: &Contender, event: GameOver, replay: Option<Vec<u8>>) -> SideResult {
    SideResult {
        agent_id: contender.agent_id.clone(),
        session_id: event.session_id,
        score: event.score,
        lives: event.lives,
        replay,
    }
}

async fn wait_side(game_over: oneshot::Receiver<GameOver>, limit: Duration) -> Result<GameOver> {
    match tokio::time::timeout(limit, game_over).await {
        Ok(Ok(event)) => Ok(event),
        Ok(Err(_)) => bail!("session closed without a result"),
        Err(_) => bail!("timed out after {}s", limit.as_secs()),
    }
}
