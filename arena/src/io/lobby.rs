//! Lobby broadcast of match lifecycle events.
//!
//! Fire-and-forget: publishing with no subscribers is not an error, and slow
//! subscribers lag rather than block the orchestrator.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::core::types::{FinishReason, Side};

const LOBBY_CAPACITY: usize = 256;

/// Events pushed to lobby/transport subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LobbyEvent {
    ChallengeCreated {
        match_id: String,
        agent_id: String,
        difficulty: u8,
    },
    CountdownTick {
        match_id: String,
        remaining: u32,
    },
    MatchStart {
        match_id: String,
        session_id: String,
    },
    MatchResult {
        match_id: String,
        winner: Side,
        score: i64,
        reason: FinishReason,
    },
    FeedItem {
        match_id: String,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct Lobby {
    tx: Arc<broadcast::Sender<LobbyEvent>>,
}

impl Default for Lobby {
    fn default() -> Self {
        Self::new()
    }
}

impl Lobby {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LOBBY_CAPACITY);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LobbyEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: LobbyEvent) {
        if self.tx.send(event).is_err() {
            trace!("lobby event dropped, no subscribers");
        }
    }

    pub fn feed(&self, match_id: &str, message: impl Into<String>) {
        self.publish(LobbyEvent::FeedItem {
            match_id: match_id.to_string(),
            message: message.into(),
        });
    }
}
