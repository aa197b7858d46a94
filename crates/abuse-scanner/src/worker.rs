//! Worker scheduling.
//!
//! Every pipeline component runs as one scheduling unit: an immediate first
//! tick followed by a fixed interval, sequential within the unit. A shared
//! watch channel signals shutdown; a ticking unit finishes its current
//! record, never starts a new one, and is joined under a bounded deadline.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How long [`WorkerHandle::stop`] waits for a unit to finish its current
/// record before reporting an unclean shutdown.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum ShutdownError {
    #[error("unclean {0} shutdown")]
    Unclean(&'static str),
}

/// Handle on a running scheduling unit.
pub struct WorkerHandle {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    /// Waits for the unit to observe the shutdown signal and return, up to
    /// [`STOP_TIMEOUT`]. A timeout is reported but must not block process
    /// exit.
    pub async fn stop(self) -> Result<(), ShutdownError> {
        match tokio::time::timeout(STOP_TIMEOUT, self.handle).await {
            Ok(_) => Ok(()),
            Err(_) => Err(ShutdownError::Unclean(self.name)),
        }
    }
}

/// Spawns a ticker unit: runs `tick` immediately, then once per `interval`,
/// until the shutdown signal fires.
pub fn spawn_ticker<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> WorkerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let handle = tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.tick().await; // the first tick completes immediately

        loop {
            debug!(worker = name, "tick");
            tick().await;

            tokio::select! {
                _ = timer.tick() => {},
                _ = shutdown.changed() => {
                    info!(worker = name, "shutdown signal received");
                    break;
                }
            }
        }
    });

    WorkerHandle { name, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ticker_runs_and_stops() {
        let (tx, rx) = watch::channel(false);
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let handle = spawn_ticker("test", Duration::from_millis(10), rx, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        // the first tick runs immediately, more follow on the interval
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);

        tx.send(true).unwrap();
        handle.stop().await.unwrap();

        let after_stop = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_ticker_stops_when_sender_drops() {
        let (tx, rx) = watch::channel(false);
        let handle = spawn_ticker("test", Duration::from_millis(10), rx, || async {});
        drop(tx);
        handle.stop().await.unwrap();
    }
}
