use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

struct Entry {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Per-key retry timers. Scheduling a key that already has a timer replaces
/// it (the old timer is aborted), so repeated publish failures for the same
/// message never stack timers. Generations guard the self-cleanup against
/// the replace race.
pub struct RetryScheduler {
    delay: Duration,
    next_generation: AtomicU64,
    timers: Arc<Mutex<HashMap<String, Entry>>>,
}

impl RetryScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_generation: AtomicU64::new(0),
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `task` after the configured delay, keyed by `key`.
    pub fn schedule<F, Fut>(&self, key: &str, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let delay = self.delay;
        let timers = Arc::clone(&self.timers);
        let owned_key = key.to_string();

        let handle = tokio::spawn({
            let key = owned_key.clone();
            async move {
                tokio::time::sleep(delay).await;
                {
                    let mut timers = timers.lock().unwrap();
                    match timers.get(&key) {
                        Some(entry) if entry.generation == generation => {
                            timers.remove(&key);
                        }
                        // A replacement raced in; it owns the slot now.
                        _ => {}
                    }
                }
                task().await;
            }
        });

        let mut timers = self.timers.lock().unwrap();
        if let Some(old) = timers.insert(owned_key, Entry { generation, handle }) {
            debug!("replaced pending retry timer");
            old.handle.abort();
        }
    }

    pub fn cancel(&self, key: &str) {
        if let Some(entry) = self.timers.lock().unwrap().remove(key) {
            entry.handle.abort();
        }
    }

    /// Abort everything still pending; shutdown path.
    pub fn flush(&self) {
        let mut timers = self.timers.lock().unwrap();
        for (_, entry) in timers.drain() {
            entry.handle.abort();
        }
    }

    pub fn pending(&self) -> usize {
        self.timers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn fires_after_delay_and_cleans_up() {
        let scheduler = RetryScheduler::new(Duration::from_millis(10));
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        scheduler.schedule("k1", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn rescheduling_same_key_replaces_the_timer() {
        let scheduler = RetryScheduler::new(Duration::from_millis(20));
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&first);
        scheduler.schedule("k1", move || async move {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&second);
        scheduler.schedule("k1", move || async move {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0, "replaced timer must not fire");
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_prevents_firing() {
        let scheduler = RetryScheduler::new(Duration::from_millis(20));
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        scheduler.schedule("k1", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.cancel("k1");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_interfere() {
        let scheduler = RetryScheduler::new(Duration::from_millis(10));
        let fired = Arc::new(AtomicUsize::new(0));

        for key in ["a", "b", "c"] {
            let counter = Arc::clone(&fired);
            scheduler.schedule(key, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }
}
