//! Embeddable trading-engine runtime.
//!
//! `gambit` wires a user-supplied [`Strategy`] to a user-supplied [`Broker`]
//! adapter and supervises the full lifecycle of trading positions (opening,
//! changing protective conditional orders, closing) with group-scoped
//! cancellation, bounded result delivery and observer callbacks. The
//! strategy talks to the engine through typed [`Action`] values; the broker
//! executes them and reports asynchronous closes on a per-position stream.

pub mod broker;
pub mod domain;
pub mod engine;
pub mod error;
pub mod shutdown;
pub mod traits;

pub use domain::action::{
    Action, ActionResult, ChangeConditionalOrderAction, ClosePositionAction, OpenPositionAction,
    OpenPositionResult,
};
pub use domain::position::{Instrument, Position, PositionClosed, PositionId, PositionType};
pub use engine::{Engine, EngineConfig};
pub use error::{EngineError, Result};
pub use shutdown::Shutdown;
pub use traits::{Broker, Strategy};
