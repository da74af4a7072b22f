//! Keyed trailing debouncer with an explicit max-wait deadline.
//!
//! Each key accumulates values until `delay` passes without a new one, or
//! until `max_wait` has passed since the first value, whichever is first.
//! The max-wait deadline is fixed by the first event of a burst and is not
//! pushed back by later events.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;

pub type FlushFn<K, V> = Arc<dyn Fn(K, V) -> BoxFuture<'static, ()> + Send + Sync>;

struct Slot<V> {
    value: V,
    first_at: Instant,
    generation: u64,
}

pub struct Debouncer<K, V> {
    slots: Arc<Mutex<HashMap<K, Slot<V>>>>,
    delay: Duration,
    max_wait: Duration,
    merge: fn(&mut V, V),
    on_flush: FlushFn<K, V>,
    tasks: TaskTracker,
}

impl<K, V> Debouncer<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Send + 'static,
{
    pub fn new(delay: Duration, max_wait: Duration, merge: fn(&mut V, V), on_flush: FlushFn<K, V>) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            delay,
            max_wait: max_wait.max(delay),
            merge,
            on_flush,
            tasks: TaskTracker::new(),
        }
    }

    /// Record a value for `key` and (re)arm its timer.
    pub fn push(&self, key: K, value: V) {
        let now = Instant::now();
        let (generation, deadline) = {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(&key) {
                (self.merge)(&mut slot.value, value);
                slot.generation += 1;
            } else {
                slots.insert(
                    key.clone(),
                    Slot {
                        value,
                        first_at: now,
                        generation: 0,
                    },
                );
            }
            let slot = &slots[&key];
            let deadline = (now + self.delay).min(slot.first_at + self.max_wait);
            (slot.generation, deadline)
        };

        let slots = Arc::clone(&self.slots);
        let on_flush = Arc::clone(&self.on_flush);
        self.tasks.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let ready = {
                let mut slots = slots.lock();
                match slots.get(&key) {
                    Some(slot) if slot.generation == generation => slots.remove(&key),
                    _ => None,
                }
            };
            if let Some(slot) = ready {
                on_flush(key, slot.value).await;
            }
        });
    }

    /// Deliver every pending value now, then wait for in-flight callbacks.
    pub async fn flush_all(&self) {
        let drained: Vec<(K, V)> = self.slots.lock().drain().map(|(k, s)| (k, s.value)).collect();
        for (key, value) in drained {
            (self.on_flush)(key, value).await;
        }
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    pub fn pending(&self) -> usize {
        self.slots.lock().len()
    }
}
