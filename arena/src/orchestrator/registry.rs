//! In-memory match registry.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::lifecycle;
use crate::core::timers::TimerSlots;
use crate::core::types::{FinishReason, MatchDescriptor, MatchStatus, Side};

/// Mutable per-match state, owned by the registry.
#[derive(Debug)]
pub(crate) struct MatchRecord {
    pub id: String,
    pub agent_id: String,
    pub token: String,
    pub difficulty: u8,
    pub status: MatchStatus,
    pub session_id: String,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub transport_id: Option<String>,
    pub score: i64,
    pub winner: Option<Side>,
    pub finish_reason: Option<FinishReason>,
    pub countdown_remaining: u32,
    pub settlement_requested: bool,
    pub timers: TimerSlots<AbortHandle>,
}

impl MatchRecord {
    pub fn new(agent_id: &str, token: &str, difficulty: u8) -> Self {
        Self {
            id: format!("match-{}", Uuid::new_v4().simple()),
            agent_id: agent_id.to_string(),
            token: token.to_string(),
            difficulty,
            status: MatchStatus::Created,
            session_id: format!("session-{}", Uuid::new_v4().simple()),
            correlation_id: format!("wager-{}", Uuid::new_v4().simple()),
            created_at: Utc::now(),
            transport_id: None,
            score: 0,
            winner: None,
            finish_reason: None,
            countdown_remaining: 0,
            settlement_requested: false,
            timers: TimerSlots::new(),
        }
    }

    /// Move to `to` along the lifecycle graph; illegal edges are logged and refused.
    pub fn transition(&mut self, to: MatchStatus) -> bool {
        let from = self.status;
        match lifecycle::advance(&mut self.status, to) {
            Ok(()) => {
                debug!(match_id = %self.id, ?from, ?to, "match transition");
                true
            }
            Err(err) => {
                warn!(match_id = %self.id, %err, "rejected match transition");
                false
            }
        }
    }

    pub fn cancel_timers(&mut self) {
        for handle in self.timers.drain() {
            handle.abort();
        }
    }

    pub fn descriptor(&self) -> MatchDescriptor {
        MatchDescriptor {
            id: self.id.clone(),
            agent_id: self.agent_id.clone(),
            difficulty: self.difficulty,
            status: self.status,
            session_id: self.session_id.clone(),
            correlation_id: self.correlation_id.clone(),
            created_at: self.created_at,
            transport_id: self.transport_id.clone(),
            score: self.score,
            winner: self.winner,
            finish_reason: self.finish_reason,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    matches: HashMap<String, MatchRecord>,
    /// Match ids in creation order.
    order: Vec<String>,
}

impl Registry {
    pub fn live_count(&self) -> usize {
        self.matches
            .values()
            .filter(|record| record.status.is_live())
            .count()
    }

    pub fn insert(&mut self, record: MatchRecord) {
        self.order.push(record.id.clone());
        self.matches.insert(record.id.clone(), record);
    }

    pub fn get(&self, match_id: &str) -> Option<&MatchRecord> {
        self.matches.get(match_id)
    }

    pub fn get_mut(&mut self, match_id: &str) -> Option<&mut MatchRecord> {
        self.matches.get_mut(match_id)
    }

    /// Latest match bound to `transport_id`.
    pub fn find_by_transport(&mut self, transport_id: &str) -> Option<&mut MatchRecord> {
        let id = self
            .order
            .iter()
            .rev()
            .find(|id| {
                self.matches
                    .get(*id)
                    .is_some_and(|r| r.transport_id.as_deref() == Some(transport_id))
            })?
            .clone();
        self.matches.get_mut(&id)
    }

    pub fn id_for_session(&self, session_id: &str) -> Option<String> {
        self.matches
            .values()
            .find(|record| record.session_id == session_id)
            .map(|record| record.id.clone())
    }

    /// Descriptors in creation order, filtered by status.
    pub fn descriptors(&self, include: impl Fn(MatchStatus) -> bool) -> Vec<MatchDescriptor> {
        self.order
            .iter()
            .filter_map(|id| self.matches.get(id))
            .filter(|record| include(record.status))
            .map(MatchRecord::descriptor)
            .collect()
    }

    /// Remove every record.
    pub fn drain(&mut self) -> Vec<MatchRecord> {
        self.order.clear();
        self.matches.drain().map(|(_, record)| record).collect()
    }
}
