use thiserror::Error;

/// Errors surfaced by the engine and the position/action protocol.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An open action failed validation (non-positive quantity).
    #[error("action not valid")]
    ActionNotValid,

    /// A second close attempt on an already closed position.
    #[error("position already closed")]
    AlreadyClosed,

    /// The strategy did not take a dispatched result within the delivery
    /// window; the engine treats such a strategy as broken and stops.
    #[error("send result timeout")]
    SendResultTimeout,

    /// The shutdown signal was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The strategy task failed.
    #[error("strategy: {0}")]
    Strategy(anyhow::Error),

    /// The broker background task failed. Failures of individual broker
    /// calls are delivered inside the action result instead.
    #[error("broker: {0}")]
    Broker(anyhow::Error),

    /// A supervised task panicked or was aborted.
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type alias for [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;
