//! Timer driver for periodic refreshes.
//!
//! [`Poller`] issues one fetch as soon as it starts and then one per
//! interval, awaiting each fetch before waiting for the next tick so a
//! single poller never overlaps itself. Cancelling (explicitly or by
//! dropping) stops further ticks and runs the cleanup exactly once; a
//! fetch already in flight is left to finish and callers discard its
//! result by generation (see
//! [`RefreshCoordinator`](pipegraph_core::RefreshCoordinator)).

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

type Cleanup = Box<dyn FnOnce() + Send>;

/// Shortest accepted period. `tokio::time::interval` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// A running periodic fetch. See the module docs.
pub struct Poller {
    ticker: Option<JoinHandle<()>>,
    cleanup: Option<Cleanup>,
}

impl Poller {
    /// Start polling: call `fetch` now and then every `interval`.
    ///
    /// Fetch errors are logged at `warn` and polling continues; whatever
    /// the last successful fetch stored stays in place.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start<F, Fut, E, C>(interval: Duration, mut fetch: F, cleanup: C) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let interval = interval.max(MIN_INTERVAL);
        // The first fetch runs on its own task so cancelling right after
        // start still lets it complete.
        let first = tokio::spawn(log_failure(fetch()));
        let ticker = tokio::spawn(async move {
            if first.await.is_err() {
                return;
            }
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; that slot was the
            // initial fetch.
            ticks.tick().await;
            loop {
                ticks.tick().await;
                log_failure(fetch()).await;
            }
        });
        debug!(interval_ms = interval.as_millis(), "poller started");
        Self {
            ticker: Some(ticker),
            cleanup: Some(Box::new(cleanup)),
        }
    }

    /// Returns `true` until [`cancel`](Self::cancel) is called.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.ticker.is_some()
    }

    /// Stop polling and run the cleanup. Later calls do nothing.
    pub fn cancel(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
            debug!("poller cancelled");
        }
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

async fn log_failure<E: Display>(fetch: impl Future<Output = Result<(), E>>) {
    if let Err(err) = fetch.await {
        warn!(error = %err, "poll fetch failed; keeping previous data");
    }
}

/// A [`Poller`] bound to a key, restarted when the key changes.
#[derive(Debug)]
pub struct KeyedPoller<K> {
    current: Option<(K, Poller)>,
}

impl<K> Default for KeyedPoller<K> {
    fn default() -> Self {
        Self { current: None }
    }
}

impl<K: PartialEq> KeyedPoller<K> {
    /// Create an idle keyed poller.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Key currently polled.
    #[must_use]
    pub fn key(&self) -> Option<&K> {
        self.current.as_ref().map(|(key, _)| key)
    }

    /// Poll for `key`. The previous poller, if any, is cancelled (and its
    /// cleanup run) before the new one starts.
    ///
    /// Returns `false` without restarting if `key` is already polled.
    pub fn start<F, Fut, E, C>(&mut self, key: K, interval: Duration, fetch: F, cleanup: C) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        if self.key() == Some(&key) {
            return false;
        }
        self.cancel();
        self.current = Some((key, Poller::start(interval, fetch, cleanup)));
        true
    }

    /// Stop polling the current key, if any.
    pub fn cancel(&mut self) {
        if let Some((_, mut poller)) = self.current.take() {
            poller.cancel();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting_fetch(
        counter: &Arc<AtomicUsize>,
    ) -> impl FnMut() -> std::future::Ready<Result<(), Infallible>> + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(()))
        }
    }

    fn counting_cleanup(counter: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_then_cancel_fetches_once_and_cleans_once() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut poller = Poller::start(
            Duration::from_secs(60),
            counting_fetch(&fetches),
            counting_cleanup(&cleanups),
        );
        poller.cancel();
        assert!(!poller.is_active());

        tokio::time::sleep(Duration::from_secs(600)).await;
        drop(poller);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fetches_immediately_then_every_interval() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let cleanups = Arc::new(AtomicUsize::new(0));
        let poller = Poller::start(
            Duration::from_secs(1),
            counting_fetch(&fetches),
            counting_cleanup(&cleanups),
        );
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(fetches.load(Ordering::SeqCst), 4);

        drop(poller);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fetches.load(Ordering::SeqCst), 4);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_polling() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let _poller = Poller::start(
            Duration::from_secs(1),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err::<(), _>("backend down"))
            },
            || {},
        );
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn keyed_poller_tears_down_before_switching() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut keyed = KeyedPoller::new();

        for key in ["p1", "p1", "p2"] {
            let fetch_log = Arc::clone(&log);
            let cleanup_log = Arc::clone(&log);
            keyed.start(
                key,
                Duration::from_secs(60),
                move || {
                    fetch_log.lock().unwrap().push(format!("fetch {key}"));
                    std::future::ready(Ok::<(), Infallible>(()))
                },
                move || cleanup_log.lock().unwrap().push(format!("clear {key}")),
            );
            tokio::task::yield_now().await;
        }
        assert_eq!(keyed.key(), Some(&"p2"));
        keyed.cancel();
        assert_eq!(keyed.key(), None);

        assert_eq!(
            *log.lock().unwrap(),
            ["fetch p1", "clear p1", "fetch p2", "clear p2"]
        );
    }
}
