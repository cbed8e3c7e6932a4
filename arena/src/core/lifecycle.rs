//! Allowed match status transitions.
//!
//! The graph is a partial order: every edge moves strictly forward, so no
//! path can re-enter an earlier status.

use crate::core::types::MatchStatus;

/// Return true when `from -> to` is an edge of the match lifecycle.
pub fn can_transition(from: MatchStatus, to: MatchStatus) -> bool {
    use MatchStatus::{Active, Betting, Completed, Countdown, Created, Expired, Settled, WaitingAgent};

    matches!(
        (from, to),
        (Created, WaitingAgent)
            | (WaitingAgent, Betting)
            | (WaitingAgent, Countdown)
            | (WaitingAgent, Expired)
            | (Betting, Countdown)
            | (Countdown, Active)
            | (Countdown, Expired)
            | (Active, Completed)
            | (Completed, Settled)
    )
}

/// Apply `to` onto `status` if the edge exists.
///
/// Returns an error describing the rejected edge otherwise; the status is
/// left untouched.
pub fn advance(status: &mut MatchStatus, to: MatchStatus) -> Result<(), String> {
    if !can_transition(*status, to) {
        return Err(format!("illegal transition {:?} -> {:?}", status, to));
    }
    *status = to;
    Ok(())
}
