//! Shared engine state, built once and handed to every handler as an `Arc`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use trail_core::clock::Clock;
use trail_core::ids::{TabId, VolatileId, WindowId};
use trail_core::model::{TabRecord, WindowRecord};
use trail_store::tabs::TabRepo;
use trail_store::windows::WindowRepo;
use trail_store::Database;

use crate::error::Result;
use crate::graph::{GraphBuilder, GraphConfig};
use crate::identity::IdentityCache;
use crate::session::{SessionConfig, SessionManager};
use crate::settings::{chrono_ms, ms, TrailSettings};
use crate::working_state::{WorkingState, WorkingStateStore};
use crate::write_queue::{QueueConfig, WriteQueue};

/// What currently holds focus. `by_window` remembers each window's active
/// tab so focus can move back to it when the window regains focus.
#[derive(Clone, Debug, Default)]
pub struct ActivePointers {
    pub tab: Option<TabId>,
    pub window: Option<WindowId>,
    pub by_window: HashMap<WindowId, TabId>,
}

pub struct TrailContext {
    pub settings: TrailSettings,
    pub db: Database,
    pub clock: Arc<dyn Clock>,
    pub cache: Mutex<IdentityCache>,
    pub queue: Arc<WriteQueue>,
    pub sessions: SessionManager,
    pub active: Mutex<ActivePointers>,
    working_state: Option<WorkingStateStore>,
    compacted: AtomicBool,
}

impl TrailContext {
    /// Build the context, warming the cache and active pointers from the
    /// working-state file when one is available.
    pub fn new(
        settings: TrailSettings,
        db: Database,
        clock: Arc<dyn Clock>,
        working_state: Option<WorkingStateStore>,
    ) -> Arc<Self> {
        let identity = &settings.identity;
        let mut cache = IdentityCache::new(identity.tab_capacity, identity.window_capacity);
        let mut active = ActivePointers::default();

        if let Some(state) = working_state.as_ref().and_then(WorkingStateStore::load) {
            info!(
                tabs = state.identity.tabs.len(),
                windows = state.identity.windows.len(),
                saved_at = %state.saved_at,
                "restoring working state"
            );
            cache = IdentityCache::from_snapshot(state.identity, identity.tab_capacity, identity.window_capacity);
            active.tab = state.active_tab;
            active.window = state.active_window;
        }

        let queue = WriteQueue::new(
            db.clone(),
            QueueConfig {
                flush_delay: ms(settings.queue.flush_delay_ms),
                max_pending: settings.queue.max_pending,
            },
        );
        let sessions = SessionManager::new(
            db.clone(),
            Arc::clone(&clock),
            SessionConfig {
                continuation_window: chrono_ms(settings.session.continuation_window_ms),
                retention: chrono_ms(settings.session.retention_ms),
            },
        );

        Arc::new(Self {
            settings,
            db,
            clock,
            cache: Mutex::new(cache),
            queue,
            sessions,
            active: Mutex::new(active),
            working_state,
            compacted: AtomicBool::new(false),
        })
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn graph(&self) -> GraphBuilder {
        let g = &self.settings.graph;
        GraphBuilder::new(
            self.db.clone(),
            Arc::clone(&self.clock),
            GraphConfig {
                sibling_strength: g.sibling_strength,
                temporal_window: chrono_ms(g.temporal_window_ms),
                temporal_horizon: chrono_ms(g.temporal_horizon_ms),
                prune_threshold: g.prune_threshold,
            },
        )
        .with_queue(Arc::clone(&self.queue))
    }

    /// A tab as the next flush will leave it.
    pub fn load_tab(&self, id: &TabId) -> Result<Option<TabRecord>> {
        let stored = TabRepo::new(self.db.clone()).find(id)?;
        Ok(stored.map(|tab| self.queue.overlay_tab(tab)))
    }

    pub fn load_window(&self, id: &WindowId) -> Result<Option<WindowRecord>> {
        let stored = WindowRepo::new(self.db.clone()).find(id)?;
        Ok(stored.map(|window| self.queue.overlay_window(window)))
    }

    /// Stable id of the live tab holding `volatile_id`. A cache hit is only
    /// trusted if the store agrees; otherwise the store is asked directly and
    /// the answer re-registered.
    pub fn resolve_tab(&self, volatile_id: VolatileId) -> Result<Option<TabId>> {
        let cached = self.cache.lock().tab(volatile_id);
        if let Some(id) = cached {
            match self.load_tab(&id)? {
                Some(tab) if tab.tracking.is_live() && tab.tracking.volatile_id == volatile_id => {
                    return Ok(Some(id));
                }
                _ => {
                    debug!(volatile_id, stable_id = %id, "stale tab cache entry");
                    self.cache.lock().remove_tab(volatile_id);
                }
            }
        }
        let found = TabRepo::new(self.db.clone()).find_live_by_volatile(volatile_id)?;
        Ok(found.map(|tab| {
            self.cache.lock().put_tab(volatile_id, tab.id.clone());
            tab.id
        }))
    }

    pub fn resolve_window(&self, volatile_id: VolatileId) -> Result<Option<WindowId>> {
        let cached = self.cache.lock().window(volatile_id);
        if let Some(id) = cached {
            match self.load_window(&id)? {
                Some(window) if window.tracking.is_live() && window.tracking.volatile_id == volatile_id => {
                    return Ok(Some(id));
                }
                _ => {
                    debug!(volatile_id, stable_id = %id, "stale window cache entry");
                    self.cache.lock().remove_window(volatile_id);
                }
            }
        }
        let found = WindowRepo::new(self.db.clone()).find_live_by_volatile(volatile_id)?;
        Ok(found.map(|window| {
            self.cache.lock().put_window(volatile_id, window.id.clone());
            window.id
        }))
    }

    /// True the first time it is called in this process.
    pub(crate) fn take_compaction_turn(&self) -> bool {
        !self.compacted.swap(true, Ordering::SeqCst)
    }

    pub fn working_state(&self) -> WorkingState {
        let mut state = WorkingState::new(self.now());
        state.session_id = self.sessions.current();
        {
            let active = self.active.lock();
            state.active_tab = active.tab.clone();
            state.active_window = active.window.clone();
        }
        state.identity = self.cache.lock().snapshot();
        state
    }

    /// Persist the working state if a location is configured. Failures are
    /// logged; the file is only an accelerator.
    pub fn save_working_state(&self) {
        let Some(store) = &self.working_state else {
            return;
        };
        if let Err(e) = store.save(&self.working_state()) {
            warn!(error = %e, "failed to save working state");
        }
    }
}
