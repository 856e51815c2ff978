//! Background ticker plumbing.
//!
//! Every service runs one or two reaper tasks: a periodic tick delivered
//! into the engine mailbox, where the engine itself does the sweeping. The
//! ticker holds no state and supports graceful shutdown via a cancellation
//! token: on cancellation it completes the current iteration and exits.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Deliver `make_tick()` into `events` every `period` until cancelled.
///
/// The first tick fires immediately (an empty sweep is harmless), the rest
/// at `period` intervals. Missed ticks are skipped, not bursted.
pub async fn run_ticker<E, F>(
    events: mpsc::Sender<E>,
    make_tick: F,
    period: Duration,
    cancel: CancellationToken,
    task: &'static str,
) where
    E: Send + 'static,
    F: Fn() -> E + Send + 'static,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if events.send(make_tick()).await.is_err() {
                    // Engine is gone; nothing left to tick.
                    break;
                }
            }
        }
    }

    debug!(target: "tasks.ticker", task, "Ticker stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_at_interval() {
        let (tx, mut rx) = mpsc::channel::<u32>(16);
        let cancel = CancellationToken::new();

        tokio::spawn(run_ticker(
            tx,
            || 1,
            Duration::from_secs(60),
            cancel.clone(),
            "test",
        ));

        // First tick fires immediately.
        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(rx.try_recv().ok(), Some(1));

        // Nothing again until a full period elapses.
        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert_eq!(rx.try_recv().ok(), Some(1));

        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_the_ticker() {
        let (tx, mut rx) = mpsc::channel::<u32>(16);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_ticker(
            tx,
            || 1,
            Duration::from_secs(60),
            cancel.clone(),
            "test",
        ));

        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        let _ = rx.try_recv();

        cancel.cancel();
        task.await.unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_mailbox_stops_the_ticker() {
        let (tx, rx) = mpsc::channel::<u32>(16);
        drop(rx);

        let cancel = CancellationToken::new();
        // Exits on the first failed send rather than spinning forever.
        run_ticker(tx, || 1, Duration::from_millis(1), cancel, "test").await;
    }
}
