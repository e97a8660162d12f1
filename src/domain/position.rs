//! Trading positions and their lifecycle state.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::domain::action::OpenPositionAction;
use crate::error::{EngineError, Result};

/// Stream on which a broker publishes the closed position.
///
/// The broker sends exactly one value, the closed position, whichever path
/// closed it, then drops its sender. A closed, empty stream means no further
/// close events.
pub type PositionClosed = mpsc::Receiver<Position>;

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionType {
    Long,
    Short,
}

impl PositionType {
    /// Sign of the position for price arithmetic: `+1` for long, `-1` for
    /// short.
    pub fn multiplier(&self) -> Decimal {
        match self {
            PositionType::Long => Decimal::ONE,
            PositionType::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// The opposing direction, used by adapters to close a position with a
    /// counter-order.
    pub fn inverse(&self) -> PositionType {
        match self {
            PositionType::Long => PositionType::Short,
            PositionType::Short => PositionType::Long,
        }
    }

    pub fn is_long(&self) -> bool {
        matches!(self, PositionType::Long)
    }

    pub fn is_short(&self) -> bool {
        matches!(self, PositionType::Short)
    }
}

impl fmt::Display for PositionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionType::Long => write!(f, "long"),
            PositionType::Short => write!(f, "short"),
        }
    }
}

/// Identifier of a position. Random 128-bit value, unique per run and
/// collision-free should it ever be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionId(Uuid);

impl PositionId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Instrument descriptor. Opaque to the engine; broker adapters interpret
/// it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    /// Trading-venue identifier (exchange or board code).
    pub venue: String,
    /// Venue-local security code.
    pub code: String,
    /// Global instrument identifier, e.g. a FIGI.
    pub global_id: String,
}

impl Instrument {
    pub fn new(
        venue: impl Into<String>,
        code: impl Into<String>,
        global_id: impl Into<String>,
    ) -> Self {
        Self {
            venue: venue.into(),
            code: code.into(),
            global_id: global_id.into(),
        }
    }
}

/// Opaque annotations attached to a position, shared across clones.
#[derive(Clone, Default)]
struct Extras(Arc<RwLock<HashMap<String, Box<dyn Any + Send + Sync>>>>);

impl Extras {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Box<dyn Any + Send + Sync>>> {
        self.0.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Box<dyn Any + Send + Sync>>> {
        self.0.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Extras {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.read().keys()).finish()
    }
}

/// Close-once signal shared across clones of a position.
#[derive(Debug, Clone)]
struct CloseSignal {
    claimed: Arc<AtomicBool>,
    closed: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            claimed: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(tx),
        }
    }

    /// True for exactly one caller across all clones.
    fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn fire(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn wait(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// A tracked trading exposure in a single instrument.
///
/// Clones share the extras map and the close-once signal; the plain fields
/// are copied. The broker adapter owns the authoritative instance and hands
/// copies to the engine and the strategy, so close-time fields are only
/// meaningful on the instance `close` was called on and on snapshots taken
/// from it afterwards.
#[derive(Debug, Clone)]
pub struct Position {
    id: PositionId,
    position_type: PositionType,
    instrument: Instrument,
    quantity: i64,
    open_time: DateTime<Utc>,
    open_price: Decimal,
    close_time: Option<DateTime<Utc>>,
    close_price: Option<Decimal>,
    stop_loss: Decimal,
    take_profit: Decimal,
    commission: Decimal,
    extras: Extras,
    close_signal: CloseSignal,
}

impl Position {
    /// Builds a position from an open action at the given fill time and
    /// price.
    ///
    /// Initial stop-loss and take-profit levels are derived from the action
    /// offsets when those are nonzero. Returns
    /// [`EngineError::ActionNotValid`] for a non-positive quantity.
    pub fn new(
        action: &OpenPositionAction,
        open_time: DateTime<Utc>,
        open_price: Decimal,
    ) -> Result<Self> {
        if !action.is_valid() {
            return Err(EngineError::ActionNotValid);
        }
        let multiplier = action.position_type.multiplier();
        let mut stop_loss = Decimal::ZERO;
        if !action.stop_loss_offset.is_zero() {
            stop_loss = open_price - action.stop_loss_offset * multiplier;
        }
        let mut take_profit = Decimal::ZERO;
        if !action.take_profit_offset.is_zero() {
            take_profit = open_price + action.take_profit_offset * multiplier;
        }
        Ok(Self {
            id: PositionId::new(),
            position_type: action.position_type,
            instrument: action.instrument.clone(),
            quantity: action.quantity,
            open_time,
            open_price,
            close_time: None,
            close_price: None,
            stop_loss,
            take_profit,
            commission: Decimal::ZERO,
            extras: Extras::default(),
            close_signal: CloseSignal::new(),
        })
    }

    pub fn id(&self) -> PositionId {
        self.id
    }

    pub fn position_type(&self) -> PositionType {
        self.position_type
    }

    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    /// Number of lots.
    pub fn quantity(&self) -> i64 {
        self.quantity
    }

    pub fn open_time(&self) -> DateTime<Utc> {
        self.open_time
    }

    pub fn open_price(&self) -> Decimal {
        self.open_price
    }

    /// `None` while the position is open.
    pub fn close_time(&self) -> Option<DateTime<Utc>> {
        self.close_time
    }

    /// `None` while the position is open.
    pub fn close_price(&self) -> Option<Decimal> {
        self.close_price
    }

    /// Current stop-loss level; `ZERO` means no stop-loss is set.
    pub fn stop_loss(&self) -> Decimal {
        self.stop_loss
    }

    /// Current take-profit level; `ZERO` means no take-profit is set.
    pub fn take_profit(&self) -> Decimal {
        self.take_profit
    }

    /// Accumulated fees.
    pub fn commission(&self) -> Decimal {
        self.commission
    }

    pub fn is_long(&self) -> bool {
        self.position_type.is_long()
    }

    pub fn is_short(&self) -> bool {
        self.position_type.is_short()
    }

    /// Closes the position at the given time and price.
    ///
    /// Exactly one close succeeds across all clones of the position; later
    /// attempts return [`EngineError::AlreadyClosed`] and leave the close
    /// fields untouched. The close fields are assigned before the signal
    /// behind [`closed`](Self::closed) fires.
    pub fn close(&mut self, close_time: DateTime<Utc>, close_price: Decimal) -> Result<()> {
        if !self.close_signal.claim() {
            return Err(EngineError::AlreadyClosed);
        }
        self.close_time = Some(close_time);
        self.close_price = Some(close_price);
        self.close_signal.fire();
        Ok(())
    }

    /// Resolves once the position is closed, immediately if it already is.
    pub async fn closed(&self) {
        self.close_signal.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.close_signal.is_closed()
    }

    /// Replaces the stop-loss level after the broker acknowledged a change.
    pub fn set_stop_loss(&mut self, price: Decimal) {
        self.stop_loss = price;
    }

    /// Replaces the take-profit level after the broker acknowledged a
    /// change.
    pub fn set_take_profit(&mut self, price: Decimal) {
        self.take_profit = price;
    }

    /// Adds a fee to the accumulated commission.
    pub fn add_commission(&mut self, fee: Decimal) {
        self.commission += fee;
    }

    /// Profit of the position if it were closed at `price`, commission
    /// aside.
    pub fn profit_by_price(&self, price: Decimal) -> Decimal {
        (price - self.open_price) * self.position_type.multiplier() * Decimal::from(self.quantity)
    }

    /// Realized profit of the closed position, net of commission. Use
    /// [`profit_by_price`](Self::profit_by_price) for the floating profit of
    /// an open position.
    pub fn profit(&self) -> Decimal {
        self.unit_profit() * Decimal::from(self.quantity)
    }

    /// Per-lot profit, net of the per-lot commission share.
    pub fn unit_profit(&self) -> Decimal {
        let close_price = self.close_price.unwrap_or_default();
        (close_price - self.open_price) * self.position_type.multiplier() - self.unit_commission()
    }

    /// Per-lot share of the accumulated commission.
    pub fn unit_commission(&self) -> Decimal {
        self.commission / Decimal::from(self.quantity)
    }

    /// How long the position was held; `None` while it is open.
    pub fn duration(&self) -> Option<Duration> {
        self.close_time.map(|closed| closed - self.open_time)
    }

    /// Typed read of an annotation stored with [`set_extra`](Self::set_extra).
    ///
    /// Returns `None` when the key is absent or holds a value of a different
    /// type.
    pub fn extra<T: Any + Clone + Send + Sync>(&self, key: &str) -> Option<T> {
        self.extras
            .read()
            .get(key)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// Stores an opaque annotation under `key`, visible through every clone
    /// of the position. Intended for broker- or strategy-local bookkeeping;
    /// the engine never reads it.
    pub fn set_extra(&self, key: impl Into<String>, value: impl Any + Send + Sync) -> &Self {
        self.extras.write().insert(key.into(), Box::new(value));
        self
    }

    /// Visits every annotation while holding the read lock. The callback
    /// must not call [`set_extra`](Self::set_extra) on the same position.
    pub fn range_extra(&self, mut f: impl FnMut(&str, &(dyn Any + Send + Sync))) {
        for (key, value) in self.extras.read().iter() {
            f(key, value.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::action::OpenPositionAction;

    fn open_action(position_type: PositionType, quantity: i64) -> OpenPositionAction {
        let (action, _result) = OpenPositionAction::new(
            position_type,
            quantity,
            dec!(1),
            dec!(2),
            Instrument::default(),
        );
        action
    }

    fn open_at(position_type: PositionType, price: Decimal) -> Position {
        Position::new(&open_action(position_type, 1), Utc::now(), price).unwrap()
    }

    #[test]
    fn multiplier_by_type() {
        assert_eq!(PositionType::Long.multiplier(), dec!(1));
        assert_eq!(PositionType::Short.multiplier(), dec!(-1));
    }

    #[test]
    fn inverse_swaps_sides() {
        assert_eq!(PositionType::Long.inverse(), PositionType::Short);
        assert_eq!(PositionType::Short.inverse(), PositionType::Long);
        assert!(PositionType::Long.is_long());
        assert!(PositionType::Short.is_short());
    }

    #[test]
    fn new_rejects_non_positive_quantity() {
        let action = open_action(PositionType::Long, 0);
        assert!(!action.is_valid());
        let err = Position::new(&action, Utc::now(), dec!(10)).unwrap_err();
        assert!(matches!(err, EngineError::ActionNotValid));
    }

    #[test]
    fn new_long_derives_conditional_order_levels() {
        let position = open_at(PositionType::Long, dec!(10));
        assert_eq!(position.stop_loss(), dec!(9));
        assert_eq!(position.take_profit(), dec!(12));
        assert_eq!(position.close_time(), None);
        assert_eq!(position.close_price(), None);
    }

    #[test]
    fn new_short_derives_conditional_order_levels() {
        let position = open_at(PositionType::Short, dec!(10));
        assert_eq!(position.stop_loss(), dec!(11));
        assert_eq!(position.take_profit(), dec!(8));
    }

    #[test]
    fn zero_offsets_leave_levels_unset() {
        let (action, _result) = OpenPositionAction::new(
            PositionType::Long,
            1,
            Decimal::ZERO,
            Decimal::ZERO,
            Instrument::default(),
        );
        let position = Position::new(&action, Utc::now(), dec!(10)).unwrap();
        assert_eq!(position.stop_loss(), Decimal::ZERO);
        assert_eq!(position.take_profit(), Decimal::ZERO);
    }

    #[test]
    fn close_assigns_fields_once() {
        let mut position = open_at(PositionType::Long, dec!(10));
        let close_time = Utc::now();

        position.close(close_time, dec!(12)).unwrap();
        assert!(position.is_closed());
        assert_eq!(position.close_time(), Some(close_time));
        assert_eq!(position.close_price(), Some(dec!(12)));

        let err = position.close(Utc::now(), dec!(14)).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyClosed));
        assert_eq!(position.close_time(), Some(close_time));
        assert_eq!(position.close_price(), Some(dec!(12)));
    }

    #[test]
    fn close_guard_is_shared_across_clones() {
        let mut position = open_at(PositionType::Long, dec!(10));
        let mut clone = position.clone();

        position.close(Utc::now(), dec!(12)).unwrap();
        let err = clone.close(Utc::now(), dec!(14)).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyClosed));
        assert!(clone.is_closed());
    }

    #[tokio::test]
    async fn closed_resolves_after_close() {
        let mut position = open_at(PositionType::Long, dec!(10));
        assert!(!position.is_closed());

        let waiter = {
            let position = position.clone();
            tokio::spawn(async move { position.closed().await })
        };
        position.close(Utc::now(), dec!(12)).unwrap();
        waiter.await.unwrap();

        // and immediately once already closed
        position.closed().await;
    }

    #[test]
    fn profit_follows_side_and_quantity() {
        let cases = [
            (PositionType::Long, 1, dec!(10), dec!(15), dec!(5)),
            (PositionType::Short, 1, dec!(10), dec!(15), dec!(-5)),
            (PositionType::Short, 5, dec!(10), dec!(15), dec!(-25)),
            (PositionType::Short, 2, dec!(10), dec!(7), dec!(6)),
        ];
        for (position_type, quantity, open, close, want) in cases {
            let mut position =
                Position::new(&open_action(position_type, quantity), Utc::now(), open).unwrap();
            position.close(Utc::now(), close).unwrap();
            assert_eq!(position.profit(), want, "{position_type} x{quantity}");
        }
    }

    #[test]
    fn profit_nets_out_commission() {
        let mut position =
            Position::new(&open_action(PositionType::Long, 4), Utc::now(), dec!(10)).unwrap();
        position.add_commission(dec!(1));
        position.add_commission(dec!(1));
        position.close(Utc::now(), dec!(15)).unwrap();

        assert_eq!(position.commission(), dec!(2));
        assert_eq!(position.unit_commission(), dec!(0.5));
        assert_eq!(position.unit_profit(), dec!(4.5));
        assert_eq!(position.profit(), dec!(18));
        // profit() == profit_by_price(close) - commission
        assert_eq!(
            position.profit(),
            position.profit_by_price(dec!(15)) - position.commission()
        );
    }

    #[test]
    fn profit_by_price_is_zero_at_open_price() {
        let position = open_at(PositionType::Long, dec!(10));
        assert_eq!(position.profit_by_price(dec!(10)), Decimal::ZERO);
        assert_eq!(position.profit_by_price(dec!(25)), dec!(15));

        let short = open_at(PositionType::Short, dec!(10));
        assert_eq!(short.profit_by_price(dec!(5)), dec!(5));
    }

    #[test]
    fn duration_spans_open_to_close() {
        let mut position = open_at(PositionType::Long, dec!(10));
        assert_eq!(position.duration(), None);

        let close_time = position.open_time() + Duration::seconds(9);
        position.close(close_time, dec!(12)).unwrap();
        assert_eq!(position.duration(), Some(Duration::seconds(9)));
    }

    #[test]
    fn extras_round_trip_through_clones() {
        let position = open_at(PositionType::Long, dec!(10));
        assert_eq!(position.extra::<i32>("order_id"), None);

        let clone = position.clone();
        position.set_extra("order_id", 123_i32);
        position.set_extra("tag", "scalp".to_string());

        assert_eq!(clone.extra::<i32>("order_id"), Some(123));
        assert_eq!(clone.extra::<String>("tag"), Some("scalp".to_string()));
        // wrong type reads as absent
        assert_eq!(clone.extra::<String>("order_id"), None);
    }

    #[test]
    fn range_extra_visits_every_key_once() {
        let position = open_at(PositionType::Long, dec!(10));
        position.set_extra("a", 1_i32);
        position.set_extra("b", 2_i32);
        position.set_extra("c", 3_i32);

        let mut seen = Vec::new();
        position.range_extra(|key, _| seen.push(key.to_string()));
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);
    }
}
