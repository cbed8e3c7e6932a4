//! Shared deterministic types for the arena core.
//!
//! These types define stable contracts between the orchestrator, the
//! scheduler, the sandbox, and external collaborators. They carry no I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Movement input for the controlled player on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    /// Parse the lowercase wire name (`"up"`, `"down"`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "up" => Some(Direction::Up),
            "down" => Some(Direction::Down),
            "left" => Some(Direction::Left),
            "right" => Some(Direction::Right),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }
}

/// Lifecycle status of a match.
///
/// Variants are declared in lifecycle order; see [`crate::core::lifecycle`]
/// for the allowed edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Created,
    WaitingAgent,
    Betting,
    Countdown,
    Active,
    Completed,
    Expired,
    Settled,
}

impl MatchStatus {
    /// Live matches count against the concurrency cap.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            MatchStatus::WaitingAgent
                | MatchStatus::Betting
                | MatchStatus::Countdown
                | MatchStatus::Active
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MatchStatus::Completed | MatchStatus::Expired | MatchStatus::Settled
        )
    }
}

/// One side of a match outcome.
///
/// `Player` is the agent-controlled player; `Opponent` is the house side
/// (the maze's ghosts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Player,
    Opponent,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Player => "player",
            Side::Opponent => "opponent",
        }
    }
}

/// Why an active match stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    GameOver,
    DurationExpired,
    Forfeit,
}

/// Read-only view of a match, safe to hand to transport and lobby layers.
///
/// The capability token is deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchDescriptor {
    pub id: String,
    pub agent_id: String,
    pub difficulty: u8,
    pub status: MatchStatus,
    pub session_id: String,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
    pub transport_id: Option<String>,
    pub score: i64,
    pub winner: Option<Side>,
    pub finish_reason: Option<FinishReason>,
}

/// Lowest accepted difficulty tier.
pub const MIN_DIFFICULTY: u8 = 1;
/// Highest accepted difficulty tier.
pub const MAX_DIFFICULTY: u8 = 5;
