//! Reference broker adapters.

pub mod paper;

pub use paper::{PaperBroker, PaperConfig, Trade};
