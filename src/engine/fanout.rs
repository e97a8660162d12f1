//! Fan-out of a broker's close stream to independent consumers.

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::domain::position::{Position, PositionClosed};
use crate::error::Result;
use crate::shutdown::Shutdown;

/// Splits `upstream` into two receivers that each observe every value.
///
/// Delivery goes to whichever consumer is ready; a slow or vanished consumer
/// never blocks the other side indefinitely. Both outputs end when the
/// upstream ends or `shutdown` fires; a value already pulled off the
/// upstream is still forwarded during shutdown so the emission is not lost.
pub(crate) fn tee(
    shutdown: Shutdown,
    mut upstream: PositionClosed,
    tasks: &mut JoinSet<Result<()>>,
) -> (PositionClosed, PositionClosed) {
    let (tx1, rx1) = mpsc::channel(1);
    let (tx2, rx2) = mpsc::channel(1);
    tasks.spawn(async move {
        loop {
            let value = tokio::select! {
                biased;
                value = upstream.recv() => match value {
                    Some(value) => value,
                    None => return Ok(()),
                },
                _ = shutdown.cancelled() => return Ok(()),
            };
            let mut first = Some(&tx1);
            let mut second = Some(&tx2);
            for _ in 0..2 {
                tokio::select! {
                    biased;
                    _ = forward(first, &value), if first.is_some() => first = None,
                    _ = forward(second, &value), if second.is_some() => second = None,
                    _ = shutdown.cancelled() => return Ok(()),
                }
            }
        }
    });
    (rx1, rx2)
}

/// Sends a copy of `value` to `side`; a vanished consumer counts as
/// delivered.
async fn forward(side: Option<&mpsc::Sender<Position>>, value: &Position) {
    if let Some(tx) = side {
        let _ = tx.send(value.clone()).await;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::action::OpenPositionAction;
    use crate::domain::position::{Instrument, PositionType};

    fn position() -> Position {
        let (action, _result) = OpenPositionAction::new(
            PositionType::Long,
            1,
            Decimal::ZERO,
            Decimal::ZERO,
            Instrument::default(),
        );
        Position::new(&action, Utc::now(), dec!(10)).unwrap()
    }

    #[tokio::test]
    async fn every_value_reaches_both_consumers() {
        let shutdown = Shutdown::new();
        let mut tasks = JoinSet::new();
        let (tx, upstream) = mpsc::channel(1);
        let (mut rx1, mut rx2) = tee(shutdown, upstream, &mut tasks);

        let sent: Vec<Position> = (0..3).map(|_| position()).collect();
        for value in &sent {
            tx.send(value.clone()).await.unwrap();
            assert_eq!(rx1.recv().await.unwrap().id(), value.id());
            assert_eq!(rx2.recv().await.unwrap().id(), value.id());
        }

        // upstream close ends both outputs
        drop(tx);
        assert!(rx1.recv().await.is_none());
        assert!(rx2.recv().await.is_none());
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn slow_consumer_does_not_block_the_other() {
        let shutdown = Shutdown::new();
        let mut tasks = JoinSet::new();
        let (tx, upstream) = mpsc::channel(1);
        let (mut rx1, mut rx2) = tee(shutdown, upstream, &mut tasks);

        tx.send(position()).await.unwrap();
        // rx2 is never polled until after rx1 got its copy
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn vanished_consumer_counts_as_delivered() {
        let shutdown = Shutdown::new();
        let mut tasks = JoinSet::new();
        let (tx, upstream) = mpsc::channel(1);
        let (rx1, mut rx2) = tee(shutdown, upstream, &mut tasks);
        drop(rx1);

        tx.send(position()).await.unwrap();
        tx.send(position()).await.unwrap();
        assert!(rx2.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn cancellation_closes_both_outputs() {
        let shutdown = Shutdown::new();
        let mut tasks = JoinSet::new();
        let (_tx, upstream) = mpsc::channel::<Position>(1);
        let (mut rx1, mut rx2) = tee(shutdown.clone(), upstream, &mut tasks);

        shutdown.cancel();
        assert!(rx1.recv().await.is_none());
        assert!(rx2.recv().await.is_none());
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }
    }
}
