//! Optional wagering collaborator seam.
//!
//! Settlement happens off-process (on-chain or in a ledger service). Every
//! call is awaited by the orchestrator but none of them gate match progress.

use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;

use crate::core::types::Side;

pub trait Wagering: Send + Sync {
    /// Open the betting pool for `correlation_id` for `window`.
    fn open_betting_window(
        &self,
        correlation_id: String,
        side_a: String,
        side_b: String,
        window: Duration,
    ) -> BoxFuture<'_, Result<()>>;

    /// Stop accepting wagers.
    fn lock_bets(&self, correlation_id: String) -> BoxFuture<'_, Result<()>>;

    /// Resolve the pool in favour of `winner`.
    fn settle_bets(&self, correlation_id: String, winner: Side) -> BoxFuture<'_, Result<()>>;
}
