//! Trailing-edge debounce, independent of where the triggers come from.

use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle};

/// Coalesces bursts of [`trigger`](Debouncer::trigger) calls into a single
/// callback invocation once `window` has passed without a new trigger.
///
/// Dropping the debouncer aborts its worker, so a pending (not yet fired)
/// callback is discarded.
pub struct Debouncer {
    tx:   mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl Debouncer {
    pub fn new<F>(window: Duration, mut callback: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                loop {
                    match tokio::time::timeout(window, rx.recv()).await {
                        // Another trigger inside the window: restart it.
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_elapsed) => break,
                    }
                }
                callback();
            }
        });

        Self { tx, task }
    }

    pub fn trigger(&self) {
        // Fails only once the worker is gone, at which point nobody is listening.
        let _ = self.tx.send(());
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn counting(window_ms: u64) -> (Debouncer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let debouncer = Debouncer::new(Duration::from_millis(window_ms), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (debouncer, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_fires_once() {
        let (debouncer, fired) = counting(150);

        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(50)).await;
        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(50)).await;
        debouncer.trigger();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "window restarts on every trigger");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn separate_bursts_fire_separately() {
        let (debouncer, fired) = counting(100);

        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(250)).await;
        debouncer.trigger();
        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_discards_pending_callback() {
        let (debouncer, fired) = counting(100);

        debouncer.trigger();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(debouncer);
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
