//! The supervised runtime connecting a strategy to a broker adapter.
//!
//! [`Engine::run`] supervises a group of tasks: the strategy, the broker's
//! optional background task, a per-open fan-out of the broker's close
//! stream with its closure watcher, and the dispatcher that executes
//! strategy actions against the broker. The first fatal error cancels the
//! group and is returned once every task has wound down.

mod fanout;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::domain::action::{
    Action, ChangeConditionalOrderAction, ClosePositionAction, OpenPositionAction,
    OpenPositionResult, ResultSlot,
};
use crate::domain::position::Position;
use crate::error::{EngineError, Result};
use crate::shutdown::Shutdown;
use crate::traits::{Broker, Strategy};

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long the dispatcher waits for the strategy to take an action
    /// result before treating the strategy as broken. Breaching the window
    /// is fatal.
    pub send_result_timeout: Duration,
    /// Whether to run the broker's background task alongside the strategy.
    pub run_broker: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            send_result_timeout: Duration::from_secs(1),
            run_broker: true,
        }
    }
}

type PositionCallback = Box<dyn Fn(&Position) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    position_opened: Option<PositionCallback>,
    conditional_order_changed: Option<PositionCallback>,
    position_closed: Option<PositionCallback>,
}

impl Callbacks {
    fn fire_opened(&self, position: &Position) {
        if let Some(callback) = &self.position_opened {
            callback(position);
        }
    }

    fn fire_changed(&self, position: &Position) {
        if let Some(callback) = &self.conditional_order_changed {
            callback(position);
        }
    }

    fn fire_closed(&self, position: &Position) {
        if let Some(callback) = &self.position_closed {
            callback(position);
        }
    }
}

/// Connects a [`Strategy`] to a [`Broker`] and supervises the lifecycle of
/// the positions they trade.
pub struct Engine {
    strategy: Box<dyn Strategy>,
    broker: Arc<dyn Broker>,
    config: EngineConfig,
    callbacks: Callbacks,
}

impl Engine {
    pub fn new(strategy: impl Strategy + 'static, broker: impl Broker + 'static) -> Self {
        Self::with_config(strategy, broker, EngineConfig::default())
    }

    pub fn with_config(
        strategy: impl Strategy + 'static,
        broker: impl Broker + 'static,
        config: EngineConfig,
    ) -> Self {
        Self {
            strategy: Box::new(strategy),
            broker: Arc::new(broker),
            config,
            callbacks: Callbacks::default(),
        }
    }

    /// Installs a callback fired after a position was opened and the open
    /// result was handed to the strategy. Install before [`run`](Self::run).
    pub fn on_position_opened(
        mut self,
        callback: impl Fn(&Position) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.position_opened = Some(Box::new(callback));
        self
    }

    /// Installs a callback fired after a conditional-order change was
    /// acknowledged by the broker. Install before [`run`](Self::run).
    pub fn on_conditional_order_changed(
        mut self,
        callback: impl Fn(&Position) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.conditional_order_changed = Some(Box::new(callback));
        self
    }

    /// Installs a callback fired exactly once per position, with the closed
    /// position as published by the broker, whichever path closed it.
    /// Install before [`run`](Self::run).
    pub fn on_position_closed(
        mut self,
        callback: impl Fn(&Position) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.position_closed = Some(Box::new(callback));
        self
    }

    /// Runs the task group until the strategy finishes, a fatal error
    /// occurs or `shutdown` is cancelled.
    ///
    /// Broker failures of individual calls are delivered to the strategy
    /// inside the action result and are not fatal. External cancellation
    /// surfaces as [`EngineError::Cancelled`].
    pub async fn run(self, shutdown: Shutdown) -> Result<()> {
        let Engine {
            mut strategy,
            broker,
            config,
            callbacks,
        } = self;
        let callbacks = Arc::new(callbacks);
        let group = Shutdown::new();
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        // caller cancellation propagates into the group, never the reverse
        {
            let external = shutdown.clone();
            let group = group.clone();
            tasks.spawn(async move {
                tokio::select! {
                    _ = external.cancelled() => group.cancel(),
                    _ = group.cancelled() => {}
                }
                Ok(())
            });
        }

        let (actions_tx, mut actions_rx) = mpsc::channel::<Action>(1);
        {
            let group = group.clone();
            tasks.spawn(async move {
                let result = strategy.run(group.clone(), actions_tx).await;
                if let Err(error) = &result {
                    warn!(error = %error, "strategy failed");
                }
                // the strategy going away ends the whole group
                group.cancel();
                result.map_err(EngineError::Strategy)
            });
        }

        if config.run_broker {
            let broker = broker.clone();
            let group = group.clone();
            tasks.spawn(async move {
                let result = broker.run(group.clone()).await;
                if let Err(error) = &result {
                    warn!(error = %error, "broker background task failed");
                }
                // the background task going away ends the whole group
                group.cancel();
                result.map_err(EngineError::Broker)
            });
        }

        info!("engine running");
        let dispatcher = Dispatcher {
            broker,
            config,
            callbacks,
            group: group.clone(),
        };
        let outcome = dispatcher.dispatch(&mut actions_rx, &mut tasks).await;
        group.cancel();

        let mut first_error = outcome.err();
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|join_error| Err(EngineError::Task(join_error)));
            if let Err(error) = result {
                // a real failure beats the cancellation it caused
                let replace = match &first_error {
                    None => true,
                    Some(EngineError::Cancelled) => !matches!(error, EngineError::Cancelled),
                    Some(_) => false,
                };
                if replace {
                    first_error = Some(error);
                }
            }
        }

        match first_error {
            // a group cancel that no caller requested is a clean wind-down,
            // e.g. the strategy or the broker background task returning
            Some(EngineError::Cancelled) if !shutdown.is_cancelled() => {
                info!("engine stopped");
                Ok(())
            }
            Some(error) => {
                info!(error = %error, "engine stopped");
                Err(error)
            }
            None => {
                info!("engine stopped");
                Ok(())
            }
        }
    }
}

/// Executes actions against the broker and routes results and callbacks.
struct Dispatcher {
    broker: Arc<dyn Broker>,
    config: EngineConfig,
    callbacks: Arc<Callbacks>,
    group: Shutdown,
}

impl Dispatcher {
    async fn dispatch(
        &self,
        actions: &mut mpsc::Receiver<Action>,
        tasks: &mut JoinSet<Result<()>>,
    ) -> Result<()> {
        loop {
            let action = tokio::select! {
                biased;
                _ = self.group.cancelled() => return Err(EngineError::Cancelled),
                action = actions.recv() => match action {
                    Some(action) => action,
                    None => {
                        debug!("actions channel closed");
                        return Ok(());
                    }
                },
            };
            match action {
                Action::OpenPosition(action) => self.open_position(action, tasks).await?,
                Action::ClosePosition(action) => self.close_position(action).await?,
                Action::ChangeConditionalOrder(action) => {
                    self.change_conditional_order(action).await?
                }
            }
        }
    }

    async fn open_position(
        &self,
        action: OpenPositionAction,
        tasks: &mut JoinSet<Result<()>>,
    ) -> Result<()> {
        debug!(
            position_type = %action.position_type,
            quantity = action.quantity,
            "dispatching open position"
        );
        match self.broker.open_position(&self.group, &action).await {
            Ok((position, position_closed)) => {
                let (to_strategy, mut to_watcher) =
                    fanout::tee(self.group.clone(), position_closed, tasks);
                let OpenPositionAction { result, .. } = action;
                self.deliver(
                    result,
                    Ok(OpenPositionResult {
                        position: position.clone(),
                        closed: to_strategy,
                    }),
                )
                .await?;

                info!(id = %position.id(), price = %position.open_price(), "position opened");
                self.callbacks.fire_opened(&position);

                let callbacks = self.callbacks.clone();
                let group = self.group.clone();
                tasks.spawn(async move {
                    tokio::select! {
                        biased;
                        closed = to_watcher.recv() => {
                            if let Some(position) = closed {
                                info!(id = %position.id(), "position closed");
                                callbacks.fire_closed(&position);
                            }
                        }
                        _ = group.cancelled() => {}
                    }
                    Ok(())
                });
                Ok(())
            }
            Err(error) => {
                warn!(error = %error, "open position failed");
                let OpenPositionAction { result, .. } = action;
                self.deliver(result, Err(error)).await
            }
        }
    }

    async fn close_position(&self, action: ClosePositionAction) -> Result<()> {
        debug!(id = %action.position_id, "dispatching close position");
        let outcome = self.broker.close_position(&self.group, &action).await;
        if let Err(error) = &outcome {
            warn!(error = %error, "close position failed");
        }
        let ClosePositionAction { result, .. } = action;
        // the closed callback fires from the per-open watcher, not here
        self.deliver(result, outcome).await
    }

    async fn change_conditional_order(&self, action: ChangeConditionalOrderAction) -> Result<()> {
        debug!(id = %action.position_id, "dispatching conditional-order change");
        let outcome = self.broker.change_conditional_order(&self.group, &action).await;
        if let Err(error) = &outcome {
            warn!(error = %error, "conditional-order change failed");
        }
        let changed = outcome.as_ref().ok().cloned();
        let ChangeConditionalOrderAction { result, .. } = action;
        self.deliver(result, outcome).await?;
        if let Some(position) = changed {
            self.callbacks.fire_changed(&position);
        }
        Ok(())
    }

    /// Hands an outcome to the strategy and waits for its acknowledgment
    /// within the configured window. An unacknowledged result means the
    /// strategy stopped reading, which is fatal; cancellation during
    /// delivery is a deliberate shutdown, not an error.
    async fn deliver<T>(&self, slot: ResultSlot<T>, outcome: anyhow::Result<T>) -> Result<()> {
        let ack = match slot.send(outcome) {
            Ok(ack) => ack,
            Err(()) => return self.abandoned().await,
        };
        tokio::select! {
            biased;
            acked = ack => match acked {
                Ok(()) => Ok(()),
                Err(_) => self.abandoned().await,
            },
            _ = self.group.cancelled() => Ok(()),
            _ = tokio::time::sleep(self.config.send_result_timeout) => {
                warn!(
                    timeout = ?self.config.send_result_timeout,
                    "strategy did not take an action result in time"
                );
                Err(EngineError::SendResultTimeout)
            }
        }
    }

    /// The strategy dropped its result handle without reading it. A strategy
    /// that is on its way out cancels the group right after, so wait for
    /// that before declaring the strategy broken.
    async fn abandoned(&self) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.group.cancelled() => Ok(()),
            _ = tokio::time::sleep(self.config.send_result_timeout) => {
                warn!("strategy dropped its result handle");
                Err(EngineError::SendResultTimeout)
            }
        }
    }
}
