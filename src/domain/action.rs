//! Trading actions and their result-delivery protocol.
//!
//! A strategy builds an action with one of the `new` constructors, sends it
//! down the engine's actions channel and keeps the paired [`ActionResult`]
//! handle. The engine executes the matching broker call and delivers the
//! outcome through the handle; delivery is acknowledged, and a strategy that
//! stops taking results trips the engine's delivery window.

use rust_decimal::Decimal;
use tokio::sync::oneshot;

use crate::domain::position::{Instrument, Position, PositionClosed, PositionId, PositionType};
use crate::error::{EngineError, Result};
use crate::shutdown::Shutdown;

/// A request produced by the strategy for execution by the broker.
#[derive(Debug)]
pub enum Action {
    OpenPosition(OpenPositionAction),
    ClosePosition(ClosePositionAction),
    ChangeConditionalOrder(ChangeConditionalOrderAction),
}

/// Request to open a position.
#[derive(Debug)]
pub struct OpenPositionAction {
    pub position_type: PositionType,
    /// Number of lots to trade. Must be positive.
    pub quantity: i64,
    /// Stop-loss offset from the open price; `ZERO` disables the stop-loss.
    pub stop_loss_offset: Decimal,
    /// Take-profit offset from the open price; `ZERO` disables the
    /// take-profit.
    pub take_profit_offset: Decimal,
    pub instrument: Instrument,
    pub(crate) result: ResultSlot<OpenPositionResult>,
}

/// Successful outcome of an open action.
#[derive(Debug)]
pub struct OpenPositionResult {
    pub position: Position,
    /// Emits the closed position exactly once, whichever path closes it.
    pub closed: PositionClosed,
}

impl OpenPositionAction {
    pub fn new(
        position_type: PositionType,
        quantity: i64,
        stop_loss_offset: Decimal,
        take_profit_offset: Decimal,
        instrument: Instrument,
    ) -> (Self, ActionResult<OpenPositionResult>) {
        let (slot, result) = ResultSlot::new();
        (
            Self {
                position_type,
                quantity,
                stop_loss_offset,
                take_profit_offset,
                instrument,
                result: slot,
            },
            result,
        )
    }

    /// An action is executable iff it trades a positive quantity.
    pub fn is_valid(&self) -> bool {
        self.quantity > 0
    }
}

impl From<OpenPositionAction> for Action {
    fn from(action: OpenPositionAction) -> Self {
        Action::OpenPosition(action)
    }
}

/// Request to close a position.
#[derive(Debug)]
pub struct ClosePositionAction {
    pub position_id: PositionId,
    pub(crate) result: ResultSlot<Position>,
}

impl ClosePositionAction {
    pub fn new(position_id: PositionId) -> (Self, ActionResult<Position>) {
        let (slot, result) = ResultSlot::new();
        (
            Self {
                position_id,
                result: slot,
            },
            result,
        )
    }
}

impl From<ClosePositionAction> for Action {
    fn from(action: ClosePositionAction) -> Self {
        Action::ClosePosition(action)
    }
}

/// Request to replace a position's conditional-order levels. A `ZERO` level
/// leaves the corresponding order unchanged.
#[derive(Debug)]
pub struct ChangeConditionalOrderAction {
    pub position_id: PositionId,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub(crate) result: ResultSlot<Position>,
}

impl ChangeConditionalOrderAction {
    pub fn new(
        position_id: PositionId,
        stop_loss: Decimal,
        take_profit: Decimal,
    ) -> (Self, ActionResult<Position>) {
        let (slot, result) = ResultSlot::new();
        (
            Self {
                position_id,
                stop_loss,
                take_profit,
                result: slot,
            },
            result,
        )
    }
}

impl From<ChangeConditionalOrderAction> for Action {
    fn from(action: ChangeConditionalOrderAction) -> Self {
        Action::ChangeConditionalOrder(action)
    }
}

/// Engine half of an action's private result channel: a single-use value
/// slot plus the strategy's acknowledgment leg.
#[derive(Debug)]
pub(crate) struct ResultSlot<T> {
    value: oneshot::Sender<anyhow::Result<T>>,
    ack: oneshot::Receiver<()>,
}

impl<T> ResultSlot<T> {
    fn new() -> (Self, ActionResult<T>) {
        let (value_tx, value_rx) = oneshot::channel();
        let (ack_tx, ack_rx) = oneshot::channel();
        (
            Self {
                value: value_tx,
                ack: ack_rx,
            },
            ActionResult {
                value: value_rx,
                ack: ack_tx,
            },
        )
    }

    /// Pushes the outcome to the strategy. Returns the acknowledgment leg,
    /// or `Err` when the strategy already dropped its handle.
    pub(crate) fn send(
        self,
        outcome: anyhow::Result<T>,
    ) -> std::result::Result<oneshot::Receiver<()>, ()> {
        match self.value.send(outcome) {
            Ok(()) => Ok(self.ack),
            Err(_) => Err(()),
        }
    }
}

/// Strategy half of an action's private result channel.
#[derive(Debug)]
pub struct ActionResult<T> {
    value: oneshot::Receiver<anyhow::Result<T>>,
    ack: oneshot::Sender<()>,
}

impl<T> ActionResult<T> {
    /// Waits for the engine to deliver the action outcome and acknowledges
    /// receipt.
    ///
    /// Returns [`EngineError::Cancelled`] when `shutdown` fires first or the
    /// engine went away without delivering, and surfaces a broker failure as
    /// [`EngineError::Broker`].
    pub async fn recv(self, shutdown: &Shutdown) -> Result<T> {
        let ActionResult { value, ack } = self;
        tokio::select! {
            biased;
            outcome = value => {
                let outcome = outcome.map_err(|_| EngineError::Cancelled)?;
                let _ = ack.send(());
                outcome.map_err(EngineError::Broker)
            }
            _ = shutdown.cancelled() => Err(EngineError::Cancelled),
        }
    }
}
