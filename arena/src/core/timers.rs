//! Generation-fenced timer slots.
//!
//! Each match owns one [`TimerSlots`] table with at most one armed entry per
//! [`TimerKind`]. Arming a kind hands out a fresh [`TimerToken`]; a timer
//! callback may only act if its token is still the current one for its kind.
//! The handle type is generic so this module stays free of runtime types.

use std::collections::HashMap;

/// Reason a timer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Connect,
    BettingWindow,
    Countdown,
    Duration,
    ReconnectGrace,
    /// Not a delay: the task waiting on the tick engine's game-over event.
    GameOverWatch,
}

/// Identity of one arming of a timer kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken {
    pub kind: TimerKind,
    pub generation: u64,
}

#[derive(Debug)]
pub struct TimerSlots<H> {
    next_generation: u64,
    armed: HashMap<TimerKind, (u64, H)>,
}

impl<H> Default for TimerSlots<H> {
    fn default() -> Self {
        Self {
            next_generation: 1,
            armed: HashMap::new(),
        }
    }
}

impl<H> TimerSlots<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a token for `kind`. The token is not current until [`Self::arm`].
    pub fn next_token(&mut self, kind: TimerKind) -> TimerToken {
        let generation = self.next_generation;
        self.next_generation += 1;
        TimerToken { kind, generation }
    }

    /// Make `token` the current entry for its kind.
    ///
    /// Returns the superseded handle, which the caller must cancel.
    pub fn arm(&mut self, token: TimerToken, handle: H) -> Option<H> {
        self.armed
            .insert(token.kind, (token.generation, handle))
            .map(|(_, prev)| prev)
    }

    /// Remove the entry for `kind`, returning its handle for cancellation.
    pub fn disarm(&mut self, kind: TimerKind) -> Option<H> {
        self.armed.remove(&kind).map(|(_, handle)| handle)
    }

    pub fn is_current(&self, token: TimerToken) -> bool {
        self.armed
            .get(&token.kind)
            .is_some_and(|(generation, _)| *generation == token.generation)
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Consume `token` when its timer fires.
    ///
    /// Returns false for a stale token (superseded or disarmed), in which case
    /// the table is unchanged and the callback must not act.
    pub fn fire(&mut self, token: TimerToken) -> bool {
        if !self.is_current(token) {
            return false;
        }
        self.armed.remove(&token.kind);
        true
    }

    /// Remove every armed entry, returning the handles for cancellation.
    pub fn drain(&mut self) -> Vec<H> {
        self.armed.drain().map(|(_, (_, handle))| handle).collect()
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }
}
