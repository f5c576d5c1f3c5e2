//! Rate-limited, deduplicating work queue
//!
//! A key that is added while pending coalesces with the pending entry. A key
//! that is added while a worker is processing it is parked and handed out
//! again only after [`WorkQueue::done`], so at most one worker ever holds a
//! given key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

/// Delay before the first retry of a failing key
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Upper bound on the retry delay of a failing key
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            shutting_down: false,
        }
    }
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

/// Work queue shared between event handlers (producers) and controller
/// workers (consumers)
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_backoff(name, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    pub fn with_backoff(name: impl Into<String>, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                base_delay,
                max_delay,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `item` as needing processing
    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            trace!(queue = %self.inner.name, ?item, "Parked key that is being processed");
            return;
        }
        state.queue.push_back(item);
        self.record_depth(&state);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Wait for the next item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    self.record_depth(&state);
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release `item` after processing; re-queues it if it was added meanwhile
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            self.record_depth(&state);
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Reset the failure counter of `item`
    pub fn forget(&self, item: &T) {
        self.lock().failures.remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock().failures.get(item).copied().unwrap_or(0)
    }

    /// Add `item` after its exponential backoff delay
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(item.clone()).or_insert(0);
            *failures += 1;
            backoff_delay(self.inner.base_delay, self.inner.max_delay, *failures)
        };
        self.add_after(item, delay);
    }

    /// Add `item` once `delay` has elapsed
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Wake every waiting consumer; queued and future items are dropped
    pub fn shut_down(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        state.queue.clear();
        state.dirty.clear();
        self.record_depth(&state);
        drop(state);
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Items waiting to be handed out
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items currently held by a consumer
    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }

    #[cfg(feature = "metrics")]
    fn record_depth(&self, state: &State<T>) {
        crate::controller::metrics::set_queue_depth(&self.inner.name, state.queue.len());
    }

    #[cfg(not(feature = "metrics"))]
    fn record_depth(&self, _state: &State<T>) {}
}

/// `base * 2^(failures - 1)`, capped at `max`
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use tokio_test::task;
    use tokio_test::{assert_pending, assert_ready_eq};

    use super::*;

    #[test]
    fn test_duplicate_adds_coalesce() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_key_in_flight_is_not_handed_out_twice() {
        let queue = WorkQueue::new("test");
        queue.add("a");

        let mut first = task::spawn(queue.get());
        assert_ready_eq!(first.poll(), Some("a"));
        drop(first);

        // Re-added while processing: parked, not queued
        queue.add("a");
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.in_flight(), 1);

        let mut second = task::spawn(queue.get());
        assert_pending!(second.poll());

        queue.done(&"a");
        assert!(second.is_woken());
        assert_ready_eq!(second.poll(), Some("a"));
    }

    #[test]
    fn test_done_without_readd_drops_key() {
        let queue = WorkQueue::new("test");
        queue.add("a");
        let mut get = task::spawn(queue.get());
        assert_ready_eq!(get.poll(), Some("a"));
        drop(get);
        queue.done(&"a");
        assert!(queue.is_empty());
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn test_shutdown_wakes_waiters() {
        let queue: WorkQueue<&str> = WorkQueue::new("test");
        let mut get = task::spawn(queue.get());
        assert_pending!(get.poll());
        queue.shut_down();
        assert!(get.is_woken());
        assert_ready_eq!(get.poll(), None);

        queue.add("a");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let base = Duration::from_millis(5);
        let max = Duration::from_secs(1000);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(5));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_millis(10));
        assert_eq!(backoff_delay(base, max, 4), Duration::from_millis(40));
        assert_eq!(backoff_delay(base, max, 40), max);
    }

    #[tokio::test]
    async fn test_rate_limited_requeue_and_forget() {
        let queue = WorkQueue::with_backoff("test", Duration::from_millis(1), Duration::from_millis(4));
        queue.add_rate_limited("a");
        queue.add_rate_limited("a");
        assert_eq!(queue.num_requeues(&"a"), 2);

        let item = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .unwrap();
        assert_eq!(item, Some("a"));
        queue.forget(&"a");
        queue.done(&"a");
        assert_eq!(queue.num_requeues(&"a"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_workers_never_share_a_key() {
        let queue: WorkQueue<u8> = WorkQueue::new("test");
        let busy: Arc<Vec<AtomicBool>> = Arc::new((0..4).map(|_| AtomicBool::new(false)).collect());
        let processed = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            let busy = busy.clone();
            let processed = processed.clone();
            workers.push(tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    let slot = &busy[key as usize];
                    assert!(
                        !slot.swap(true, Ordering::SeqCst),
                        "key {key} handed to two workers"
                    );
                    tokio::task::yield_now().await;
                    slot.store(false, Ordering::SeqCst);
                    processed.fetch_add(1, Ordering::SeqCst);
                    queue.done(&key);
                }
            }));
        }

        for round in 0..200u32 {
            queue.add((round % 4) as u8);
            if round % 10 == 0 {
                tokio::task::yield_now().await;
            }
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while !(queue.is_empty() && queue.in_flight() == 0) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        queue.shut_down();
        for worker in workers {
            worker.await.unwrap();
        }
        assert!(processed.load(Ordering::SeqCst) >= 4);
    }
}
