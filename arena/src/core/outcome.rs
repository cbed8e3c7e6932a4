//! Outcome rules for single matches and scheduled pairings.

use serde::{Deserialize, Serialize};

use crate::core::types::Side;

/// Decide the winner of a finished match from the controlled player's lives.
///
/// A player that ran out of lives loses to the opponent; any player still
/// alive when the game ends (including by duration cap) wins.
pub fn decide_winner(lives: i32) -> Side {
    if lives <= 0 {
        Side::Opponent
    } else {
        Side::Player
    }
}

/// Winner of a two-sided scheduled pairing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PairingWinner {
    SideA,
    SideB,
    Draw,
}

/// Compare cumulative scores of both sides of a pairing.
pub fn compare_scores(score_a: i64, score_b: i64) -> PairingWinner {
    match score_a.cmp(&score_b) {
        std::cmp::Ordering::Greater => PairingWinner::SideA,
        std::cmp::Ordering::Less => PairingWinner::SideB,
        std::cmp::Ordering::Equal => PairingWinner::Draw,
    }
}
