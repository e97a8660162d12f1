//! Seams between the engine, the strategy and the broker adapter.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::action::{
    Action, ChangeConditionalOrderAction, ClosePositionAction, OpenPositionAction,
};
use crate::domain::position::{Position, PositionClosed};
use crate::shutdown::Shutdown;

/// Decision logic driving the engine.
#[async_trait]
pub trait Strategy: Send {
    /// Runs the strategy until `shutdown` fires or it has nothing left to
    /// do.
    ///
    /// Trading actions go out on `actions`; the per-action handle returned
    /// by each action constructor delivers the outcome. Returning winds the
    /// whole engine down: cleanly on `Ok`, fatally on `Err`. Await every
    /// result before returning, or the outcome is discarded.
    async fn run(&mut self, shutdown: Shutdown, actions: mpsc::Sender<Action>)
        -> anyhow::Result<()>;
}

/// Order execution and fill tracking for a trading venue.
///
/// Methods borrow the action so the private result channel stays with the
/// engine; adapters read the public request fields only. Failures are
/// delivered to the strategy inside the action result and never stop the
/// engine.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens a position and starts tracking its conditional orders.
    ///
    /// On success the returned stream emits the closed position exactly
    /// once, whichever path closes it, and then ends.
    async fn open_position(
        &self,
        shutdown: &Shutdown,
        action: &OpenPositionAction,
    ) -> anyhow::Result<(Position, PositionClosed)>;

    /// Closes the position named by the action; returns the closed position.
    ///
    /// Adapters should rely on the close-once guard of [`Position::close`]
    /// so a racing asynchronous fill cannot duplicate the emission on the
    /// open action's stream.
    async fn close_position(
        &self,
        shutdown: &Shutdown,
        action: &ClosePositionAction,
    ) -> anyhow::Result<Position>;

    /// Replaces the position's conditional-order levels; a `ZERO` level is
    /// left unchanged. Returns the updated position snapshot.
    async fn change_conditional_order(
        &self,
        shutdown: &Shutdown,
        action: &ChangeConditionalOrderAction,
    ) -> anyhow::Result<Position>;

    /// Background work for the adapter, e.g. consuming a server-side fill
    /// stream. The engine runs it alongside the strategy unless configured
    /// otherwise, and winds the whole group down when it returns. The
    /// default parks until shutdown for adapters with nothing to run.
    async fn run(&self, shutdown: Shutdown) -> anyhow::Result<()> {
        shutdown.cancelled().await;
        Ok(())
    }
}
