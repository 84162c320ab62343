// tunnelkeep - Event Debouncer
// Coalesces bursts of trigger events into one decision per quiet window

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use tunnelkeep_common::TriggerReason;

/// Producer handle into the debouncer. Cheap to clone; `post` may be called
/// concurrently from any number of producer tasks.
#[derive(Clone)]
pub struct EventDebouncer {
    tx: mpsc::UnboundedSender<TriggerReason>,
}

impl EventDebouncer {
    /// Spawn the coalescing task. Returns the producer handle and the
    /// single-consumer stream of decided triggers.
    ///
    /// Each post (re)starts a quiet-window timer; only the most recently
    /// posted trigger survives the window. `ManualStop` bypasses the window
    /// entirely and discards whatever was pending.
    pub fn spawn(window: Duration) -> (Self, mpsc::UnboundedReceiver<TriggerReason>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<TriggerReason>();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<TriggerReason>();

        tokio::spawn(async move {
            let mut pending: Option<TriggerReason> = None;
            let mut deadline = Instant::now();

            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        None => break,
                        Some(TriggerReason::ManualStop) => {
                            if let Some(dropped) = pending.take() {
                                debug!("debounce: {dropped} pre-empted by manual stop");
                            }
                            if out_tx.send(TriggerReason::ManualStop).is_err() {
                                break;
                            }
                        }
                        Some(trigger) => {
                            if let Some(replaced) = pending.replace(trigger) {
                                debug!("debounce: {replaced} superseded by {trigger}");
                            }
                            deadline = Instant::now() + window;
                        }
                    },
                    _ = tokio::time::sleep_until(deadline), if pending.is_some() => {
                        let trigger = pending.take().unwrap();
                        if out_tx.send(trigger).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        (Self { tx }, out_rx)
    }

    pub fn post(&self, trigger: TriggerReason) {
        // receiver gone means the supervisor is shutting down
        let _ = self.tx.send(trigger);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::yield_now;

    const WINDOW: Duration = Duration::from_millis(2000);

    /// Let the debouncer task absorb posted messages without moving the
    /// paused clock.
    async fn settle() {
        for _ in 0..10 {
            yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesces_to_latest() {
        let (debouncer, mut rx) = EventDebouncer::spawn(WINDOW);
        let posted_at = Instant::now();

        debouncer.post(TriggerReason::NetworkAvailable);
        settle().await;
        debouncer.post(TriggerReason::NetworkChanged);

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered, TriggerReason::NetworkChanged);
        assert!(Instant::now() - posted_at >= WINDOW);

        settle().await;
        assert!(rx.try_recv().is_err(), "exactly one trigger per window");
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_post_extends_quiet_window() {
        let (debouncer, mut rx) = EventDebouncer::spawn(WINDOW);

        debouncer.post(TriggerReason::SleepWake);
        settle().await;
        tokio::time::advance(WINDOW / 2).await;

        // burst continues: window restarts from here
        debouncer.post(TriggerReason::NetworkChanged);
        let restarted_at = Instant::now();

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered, TriggerReason::NetworkChanged);
        assert!(Instant::now() - restarted_at >= WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_stop_bypasses_and_cancels_pending() {
        let (debouncer, mut rx) = EventDebouncer::spawn(WINDOW);

        debouncer.post(TriggerReason::NetworkChanged);
        settle().await;
        debouncer.post(TriggerReason::ManualStop);
        settle().await;

        // delivered without any clock movement past the window
        assert_eq!(rx.try_recv().unwrap(), TriggerReason::ManualStop);

        // the pending NetworkChanged never surfaces
        tokio::time::advance(WINDOW * 2).await;
        settle().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_windows_deliver_separately() {
        let (debouncer, mut rx) = EventDebouncer::spawn(WINDOW);

        debouncer.post(TriggerReason::ManualStart);
        assert_eq!(rx.recv().await.unwrap(), TriggerReason::ManualStart);

        debouncer.post(TriggerReason::PeriodicRefresh);
        assert_eq!(rx.recv().await.unwrap(), TriggerReason::PeriodicRefresh);
    }
}
