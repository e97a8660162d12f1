//! Paper-trading broker adapter.
//!
//! Executes the engine's actions against a caller-fed stream of market
//! trade prints instead of a venue: opens and explicit closes fill at the
//! latest print, while the background task watches each print against the
//! held position's conditional-order levels and liquidates server-side when
//! one is touched. At most one position is open at a time.

use std::sync::{Mutex as StdMutex, RwLock, RwLockWriteGuard};

use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::action::{
    ChangeConditionalOrderAction, ClosePositionAction, OpenPositionAction,
};
use crate::domain::position::{Position, PositionClosed, PositionType};
use crate::shutdown::Shutdown;
use crate::traits::Broker;

/// A market trade print.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub time: DateTime<Utc>,
    pub price: Decimal,
    /// Lots traded at `price`; bounds how much of a liquidation one print
    /// can fill.
    pub quantity: i64,
}

/// Tuning for the paper adapter.
#[derive(Debug, Clone)]
pub struct PaperConfig {
    /// Flat fee charged per lot on each fill side.
    pub commission_per_lot: Decimal,
    /// Capacity of the trade-print channel.
    pub trade_buffer: usize,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            commission_per_lot: Decimal::ZERO,
            trade_buffer: 64,
        }
    }
}

/// A liquidation fill taken out of one trade print.
#[derive(Debug, Clone, Copy)]
struct Fill {
    price: Decimal,
    quantity: i64,
}

/// The single open position and its server-side tracking state.
struct Held {
    position: Position,
    closed_tx: mpsc::Sender<Position>,
    liquidating: bool,
    fills: Vec<Fill>,
}

/// Broker adapter that simulates execution against a trade-print feed.
///
/// Feed prints through the sender returned by [`trades`](Self::trades) and
/// let the engine drive [`Broker::run`]; when the feed closes, the
/// background task returns and the engine winds down.
pub struct PaperBroker {
    config: PaperConfig,
    last_trade: RwLock<Option<Trade>>,
    current: RwLock<Option<Held>>,
    trades_tx: mpsc::Sender<Trade>,
    trades_rx: StdMutex<Option<mpsc::Receiver<Trade>>>,
}

impl PaperBroker {
    pub fn new(config: PaperConfig) -> Self {
        let (trades_tx, trades_rx) = mpsc::channel(config.trade_buffer);
        Self {
            config,
            last_trade: RwLock::new(None),
            current: RwLock::new(None),
            trades_tx,
            trades_rx: StdMutex::new(Some(trades_rx)),
        }
    }

    /// Feed of market trade prints driving fills and conditional orders.
    pub fn trades(&self) -> mpsc::Sender<Trade> {
        self.trades_tx.clone()
    }

    fn last_trade(&self) -> Option<Trade> {
        *self
            .last_trade
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_write(&self) -> RwLockWriteGuard<'_, Option<Held>> {
        self.current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fee_for(&self, quantity: i64) -> Decimal {
        self.config.commission_per_lot * Decimal::from(quantity)
    }

    async fn on_trade(&self, trade: Trade) {
        *self
            .last_trade
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(trade);

        let finished = {
            let mut current = self.current_write();
            let Some(held) = current.as_mut() else {
                return;
            };
            if !held.liquidating {
                if !conditional_order_touched(&held.position, trade.price) {
                    return;
                }
                held.liquidating = true;
                info!(
                    id = %held.position.id(),
                    price = %trade.price,
                    "conditional order touched, liquidating"
                );
            }

            let executed: i64 = held.fills.iter().map(|fill| fill.quantity).sum();
            let fill_quantity = trade.quantity.min(held.position.quantity() - executed);
            if fill_quantity > 0 {
                held.fills.push(Fill {
                    price: trade.price,
                    quantity: fill_quantity,
                });
            }
            if executed + fill_quantity < held.position.quantity() {
                warn!(
                    id = %held.position.id(),
                    executed = executed + fill_quantity,
                    quantity = held.position.quantity(),
                    "position closed partially"
                );
                return;
            }

            let close_price = vwap(&held.fills);
            let Some(mut held) = current.take() else {
                return;
            };
            match held.position.close(trade.time, close_price) {
                Ok(()) => {
                    held.position.add_commission(self.fee_for(held.position.quantity()));
                    Some((held.position.clone(), held.closed_tx))
                }
                Err(_) => {
                    // an explicit close won the race; nothing left to publish
                    debug!(id = %held.position.id(), "liquidation lost the close race");
                    None
                }
            }
        };

        if let Some((position, closed_tx)) = finished {
            info!(
                id = %position.id(),
                close_price = %position.close_price().unwrap_or_default(),
                "position liquidated"
            );
            let _ = closed_tx.send(position).await;
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn open_position(
        &self,
        _shutdown: &Shutdown,
        action: &OpenPositionAction,
    ) -> anyhow::Result<(Position, PositionClosed)> {
        let Some(trade) = self.last_trade() else {
            bail!("no market data yet");
        };
        let mut current = self.current_write();
        if current.is_some() {
            bail!("multiple open positions are not supported");
        }
        let mut position = Position::new(action, trade.time, trade.price)?;
        position.add_commission(self.fee_for(position.quantity()));
        let (closed_tx, closed_rx) = mpsc::channel(1);
        *current = Some(Held {
            position: position.clone(),
            closed_tx,
            liquidating: false,
            fills: Vec::new(),
        });
        info!(id = %position.id(), price = %trade.price, "paper position opened");
        Ok((position, closed_rx))
    }

    async fn close_position(
        &self,
        _shutdown: &Shutdown,
        action: &ClosePositionAction,
    ) -> anyhow::Result<Position> {
        let Some(trade) = self.last_trade() else {
            bail!("no market data yet");
        };
        let (position, closed_tx) = {
            let mut current = self.current_write();
            let Some(mut held) = current.take() else {
                bail!("no open position");
            };
            if held.position.id() != action.position_id {
                let id = held.position.id();
                *current = Some(held);
                bail!("unknown position: {} (open is {})", action.position_id, id);
            }
            if let Err(error) = held.position.close(trade.time, trade.price) {
                *current = Some(held);
                return Err(error.into());
            }
            held.position.add_commission(self.fee_for(held.position.quantity()));
            (held.position.clone(), held.closed_tx)
        };

        info!(id = %position.id(), price = %trade.price, "paper position closed");
        let _ = closed_tx.send(position.clone()).await;
        Ok(position)
    }

    async fn change_conditional_order(
        &self,
        _shutdown: &Shutdown,
        action: &ChangeConditionalOrderAction,
    ) -> anyhow::Result<Position> {
        let mut current = self.current_write();
        let Some(held) = current.as_mut() else {
            bail!("no open position");
        };
        if held.position.id() != action.position_id {
            bail!(
                "unknown position: {} (open is {})",
                action.position_id,
                held.position.id()
            );
        }
        if !action.stop_loss.is_zero() {
            held.position.set_stop_loss(action.stop_loss);
        }
        if !action.take_profit.is_zero() {
            held.position.set_take_profit(action.take_profit);
        }
        debug!(
            id = %held.position.id(),
            stop_loss = %held.position.stop_loss(),
            take_profit = %held.position.take_profit(),
            "conditional orders updated"
        );
        Ok(held.position.clone())
    }

    async fn run(&self, shutdown: Shutdown) -> anyhow::Result<()> {
        let receiver = self
            .trades_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut trades) = receiver else {
            bail!("paper broker is already running");
        };
        info!("paper broker running");
        loop {
            let trade = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                trade = trades.recv() => match trade {
                    Some(trade) => trade,
                    None => {
                        info!("trade feed closed");
                        return Ok(());
                    }
                },
            };
            self.on_trade(trade).await;
        }
    }
}

fn conditional_order_touched(position: &Position, price: Decimal) -> bool {
    let stop_loss = position.stop_loss();
    let take_profit = position.take_profit();
    match position.position_type() {
        PositionType::Long => {
            (!stop_loss.is_zero() && price <= stop_loss)
                || (!take_profit.is_zero() && price >= take_profit)
        }
        PositionType::Short => {
            (!stop_loss.is_zero() && price >= stop_loss)
                || (!take_profit.is_zero() && price <= take_profit)
        }
    }
}

/// Volume-weighted average price of the accumulated fills.
fn vwap(fills: &[Fill]) -> Decimal {
    let mut notional = Decimal::ZERO;
    let mut quantity = 0_i64;
    for fill in fills {
        notional += fill.price * Decimal::from(fill.quantity);
        quantity += fill.quantity;
    }
    if quantity == 0 {
        return Decimal::ZERO;
    }
    notional / Decimal::from(quantity)
}
