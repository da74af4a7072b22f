//! Coalescing write-behind queue for volatile object fields.
//!
//! Writes are keyed by object; a later write to the same key replaces the
//! earlier one. Three triggers flush: a timer armed when the queue goes from
//! empty to non-empty, the size ceiling (flushed inline before `enqueue`
//! returns), and the scheduler's fallback tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, warn};

use trail_core::ids::{ObjectRef, TabId, WindowId};
use trail_core::model::{TabRecord, TrackedObject, Tracking, WindowRecord};
use trail_store::{tabs, windows, Database, StoreError};

#[derive(Clone, Debug, PartialEq)]
pub enum PendingOp {
    Put(TrackedObject),
    Delete,
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub flush_delay: Duration,
    pub max_pending: usize,
}

#[derive(Default)]
struct QueueState {
    pending: HashMap<ObjectRef, PendingOp>,
    /// Entries drained by a flush that has not committed yet. Reads consult
    /// them so a concurrent `modify` never starts from a stale store row.
    in_flight: HashMap<ObjectRef, PendingOp>,
    timer_armed: bool,
}

pub struct WriteQueue {
    db: Database,
    config: QueueConfig,
    state: Mutex<QueueState>,
    flush_lock: Mutex<()>,
    tasks: TaskTracker,
    flushes: AtomicU64,
}

impl WriteQueue {
    pub fn new(db: Database, config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            db,
            config,
            state: Mutex::new(QueueState::default()),
            flush_lock: Mutex::new(()),
            tasks: TaskTracker::new(),
            flushes: AtomicU64::new(0),
        })
    }

    /// Queue a write. Never waits on I/O unless the ceiling forces a flush.
    pub fn enqueue(self: &Arc<Self>, key: ObjectRef, op: PendingOp) {
        let (arm, full) = {
            let mut state = self.state.lock();
            let was_empty = state.pending.is_empty();
            state.pending.insert(key, op);
            let arm = was_empty && !state.timer_armed;
            if arm {
                state.timer_armed = true;
            }
            (arm, state.pending.len() >= self.config.max_pending)
        };
        self.after_insert(arm, full);
    }

    pub fn put_tab(self: &Arc<Self>, tab: TabRecord) {
        self.enqueue(ObjectRef::Tab(tab.id.clone()), PendingOp::Put(TrackedObject::Tab(tab)));
    }

    pub fn put_window(self: &Arc<Self>, window: WindowRecord) {
        self.enqueue(
            ObjectRef::Window(window.id.clone()),
            PendingOp::Put(TrackedObject::Window(window)),
        );
    }

    /// Read-modify-write under the queue lock. Starts from the queued payload
    /// when one exists, otherwise from `load`. Returns the updated object, or
    /// `None` when nothing exists to modify.
    pub fn modify<L, F>(
        self: &Arc<Self>,
        key: ObjectRef,
        load: L,
        f: F,
    ) -> Result<Option<TrackedObject>, StoreError>
    where
        L: FnOnce() -> Result<Option<TrackedObject>, StoreError>,
        F: FnOnce(&mut TrackedObject),
    {
        let (updated, arm, full) = {
            let mut state = self.state.lock();
            let current = match state.pending.get(&key).or_else(|| state.in_flight.get(&key)) {
                Some(PendingOp::Put(obj)) => Some(obj.clone()),
                Some(PendingOp::Delete) => None,
                None => load()?,
            };
            let Some(mut obj) = current else {
                return Ok(None);
            };
            f(&mut obj);
            let was_empty = state.pending.is_empty();
            state.pending.insert(key, PendingOp::Put(obj.clone()));
            let arm = was_empty && !state.timer_armed;
            if arm {
                state.timer_armed = true;
            }
            (obj, arm, state.pending.len() >= self.config.max_pending)
        };
        self.after_insert(arm, full);
        Ok(Some(updated))
    }

    /// [`modify`](Self::modify) for a tab, loading from the store on a queue miss.
    pub fn modify_tab<F>(self: &Arc<Self>, id: &TabId, f: F) -> Result<Option<TabRecord>, StoreError>
    where
        F: FnOnce(&mut TabRecord),
    {
        let db = self.db.clone();
        let updated = self.modify(
            ObjectRef::Tab(id.clone()),
            || Ok(tabs::TabRepo::new(db).find(id)?.map(TrackedObject::Tab)),
            |obj| {
                if let TrackedObject::Tab(tab) = obj {
                    f(tab);
                }
            },
        )?;
        Ok(match updated {
            Some(TrackedObject::Tab(tab)) => Some(tab),
            _ => None,
        })
    }

    pub fn modify_window<F>(self: &Arc<Self>, id: &WindowId, f: F) -> Result<Option<WindowRecord>, StoreError>
    where
        F: FnOnce(&mut WindowRecord),
    {
        let db = self.db.clone();
        let updated = self.modify(
            ObjectRef::Window(id.clone()),
            || Ok(windows::WindowRepo::new(db).find(id)?.map(TrackedObject::Window)),
            |obj| {
                if let TrackedObject::Window(window) = obj {
                    f(window);
                }
            },
        )?;
        Ok(match updated {
            Some(TrackedObject::Window(window)) => Some(window),
            _ => None,
        })
    }

    /// The queued payload for `key`, if any.
    pub fn peek(&self, key: &ObjectRef) -> Option<PendingOp> {
        let state = self.state.lock();
        state.pending.get(key).or_else(|| state.in_flight.get(key)).cloned()
    }

    /// Store row with any queued volatile fields laid over it, the same way
    /// the next flush will write them.
    pub fn overlay_tab(&self, mut tab: TabRecord) -> TabRecord {
        if let Some(PendingOp::Put(TrackedObject::Tab(queued))) = self.peek(&ObjectRef::Tab(tab.id.clone())) {
            overlay_tracking(&mut tab.tracking, &queued.tracking);
            tab.window_id = queued.window_id;
            tab.url = queued.url;
            tab.title = queued.title;
            tab.index = queued.index;
            tab.pinned = queued.pinned;
        }
        tab
    }

    pub fn overlay_window(&self, mut window: WindowRecord) -> WindowRecord {
        if let Some(PendingOp::Put(TrackedObject::Window(queued))) =
            self.peek(&ObjectRef::Window(window.id.clone()))
        {
            overlay_tracking(&mut window.tracking, &queued.tracking);
            window.kind = queued.kind;
            window.focused = queued.focused;
        }
        window
    }

    /// Drop queued writes for objects that were hard deleted.
    pub fn discard(&self, keys: &[ObjectRef]) {
        let mut state = self.state.lock();
        for key in keys {
            state.pending.remove(key);
        }
    }

    fn after_insert(self: &Arc<Self>, arm: bool, full: bool) {
        if full {
            debug!(ceiling = self.config.max_pending, "write queue full, flushing inline");
            if let Err(e) = self.flush() {
                warn!(error = %e, "inline flush failed, writes kept for retry");
            }
        } else if arm {
            self.arm_timer();
        }
    }

    fn arm_timer(self: &Arc<Self>) {
        if tokio::runtime::Handle::try_current().is_err() {
            // No runtime: the fallback tick will pick the writes up.
            self.state.lock().timer_armed = false;
            return;
        }
        let queue = Arc::clone(self);
        let delay = self.config.flush_delay;
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            queue.state.lock().timer_armed = false;
            if let Err(e) = queue.flush() {
                warn!(error = %e, "timed flush failed, writes kept for retry");
            }
        });
    }

    /// Commit everything pending in one transaction. Returns how many entries
    /// were written. On failure the drained entries go back into the queue
    /// underneath anything enqueued since.
    #[instrument(skip(self))]
    pub fn flush(&self) -> Result<usize, StoreError> {
        let _serial = self.flush_lock.lock();

        let drained = {
            let mut state = self.state.lock();
            if state.pending.is_empty() {
                return Ok(0);
            }
            let drained = std::mem::take(&mut state.pending);
            state.in_flight = drained.clone();
            drained
        };

        let mut tab_puts = Vec::new();
        let mut window_puts = Vec::new();
        let mut tab_deletes = Vec::new();
        let mut window_deletes = Vec::new();
        for (key, op) in &drained {
            match (key, op) {
                (_, PendingOp::Put(TrackedObject::Tab(tab))) => tab_puts.push(tab.clone()),
                (_, PendingOp::Put(TrackedObject::Window(window))) => window_puts.push(window.clone()),
                (ObjectRef::Tab(id), PendingOp::Delete) => tab_deletes.push(id.clone()),
                (ObjectRef::Window(id), PendingOp::Delete) => window_deletes.push(id.clone()),
            }
        }

        let result = self.db.with_tx(|conn| {
            let mut n = tabs::upsert_volatile_many(conn, &tab_puts)?;
            n += windows::upsert_volatile_many(conn, &window_puts)?;
            n += tabs::delete_ids(conn, &tab_deletes)?;
            n += windows::delete_ids(conn, &window_deletes)?;
            Ok(n)
        });

        let mut state = self.state.lock();
        state.in_flight.clear();
        match result {
            Ok(_) => {
                self.flushes.fetch_add(1, Ordering::Relaxed);
                debug!(
                    tabs = tab_puts.len(),
                    windows = window_puts.len(),
                    deletes = tab_deletes.len() + window_deletes.len(),
                    "write queue flushed"
                );
                Ok(drained.len())
            }
            Err(e) => {
                for (key, op) in drained {
                    state.pending.entry(key).or_insert(op);
                }
                Err(e)
            }
        }
    }

    /// Wait for in-flight timed flushes, then flush whatever is left.
    pub async fn settle(&self) -> Result<usize, StoreError> {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
        self.flush()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Successful non-empty flushes so far.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

/// Mirrors the upsert: runtime-owned columns only, activity never goes backwards.
fn overlay_tracking(base: &mut Tracking, queued: &Tracking) {
    base.volatile_id = queued.volatile_id;
    base.fingerprint = queued.fingerprint.clone();
    base.last_active_at = base.last_active_at.max(queued.last_active_at);
    base.active_duration_ms = base.active_duration_ms.max(queued.active_duration_ms);
}
