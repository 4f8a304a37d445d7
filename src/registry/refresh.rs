//! Periodic refresh worker
//!
//! Owns the background task that re-fetches a remote policy on a fixed
//! interval. The worker is an owned resource: stopping (or dropping) it
//! cancels the inter-tick sleep and any in-flight tick.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Error starting a refresh worker
#[derive(Debug, Error)]
pub enum StartError {
    /// The configured interval cannot schedule a tick
    #[error("refresh interval must be positive, got {0}")]
    NonPositiveInterval(i64),
}

/// Handle to a running refresh task
///
/// `stop` is idempotent; the worker is also cancelled when the handle is
/// dropped, so the scheduling loop can never outlive its owner.
pub struct RefreshWorker {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl RefreshWorker {
    /// Spawn a worker invoking `tick` every `interval_secs` seconds.
    ///
    /// A zero or negative interval is a [`StartError`]; nothing is spawned.
    /// The first invocation happens one full interval after start; the
    /// caller has already installed a fresh body by the time a worker is
    /// armed.
    pub fn start<F, Fut>(interval_secs: i64, mut tick: F) -> Result<Self, StartError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        if interval_secs <= 0 {
            return Err(StartError::NonPositiveInterval(interval_secs));
        }

        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let period = Duration::from_secs(interval_secs as u64);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // the first tick completes immediately
            loop {
                tokio::select! {
                    _ = worker_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = worker_cancel.cancelled() => break,
                    _ = tick() => {}
                }
            }
        });

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    /// Stop the worker and wait for the scheduling loop to exit.
    ///
    /// Cancels any in-flight tick. Stopping an already-stopped worker is a
    /// no-op.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for RefreshWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_start_rejects_non_positive_interval() {
        for interval in [0, -1, -3600] {
            let result = RefreshWorker::start(interval, || async {});
            assert!(matches!(
                result,
                Err(StartError::NonPositiveInterval(i)) if i == interval
            ));
        }
    }

    #[tokio::test]
    async fn test_worker_ticks_periodically() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let seen = ticks.clone();
        let mut worker = RefreshWorker::start(1, move || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(2500)).await;
        worker.stop().await;

        let count = ticks.load(Ordering::SeqCst);
        assert!(count >= 2, "expected at least 2 ticks, saw {count}");
    }

    #[tokio::test]
    async fn test_stop_halts_ticking_and_is_idempotent() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let seen = ticks.clone();
        let mut worker = RefreshWorker::start(1, move || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        worker.stop().await;
        let at_stop = ticks.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), at_stop);

        // Second stop is a no-op.
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_tick() {
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let mut started_tx = Some(started_tx);
        let mut worker = RefreshWorker::start(1, move || {
            let started = started_tx.take();
            async move {
                if let Some(tx) = started {
                    let _ = tx.send(());
                }
                // A tick that would outlive any reasonable test: stop() must
                // cut it short rather than wait it out.
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        })
        .unwrap();

        started_rx.await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), worker.stop())
            .await
            .expect("stop() returned promptly despite a hung tick");
    }
}
