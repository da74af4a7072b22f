//! Session election and lifecycle.
//!
//! `ensure_session` runs the election at most once per process: concurrent
//! callers await the same initialization, and a failed election is retried
//! by the next caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

use trail_core::clock::Clock;
use trail_core::ids::SessionId;
use trail_core::model::SessionRecord;
use trail_store::sessions::{SessionCounter, SessionRepo};
use trail_store::Database;

use crate::error::{EngineError, Result};

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub continuation_window: chrono::Duration,
    pub retention: chrono::Duration,
}

pub struct SessionManager {
    db: Database,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    current: OnceCell<SessionId>,
    elections: AtomicU64,
}

impl SessionManager {
    pub fn new(db: Database, clock: Arc<dyn Clock>, config: SessionConfig) -> Self {
        Self {
            db,
            clock,
            config,
            current: OnceCell::new(),
            elections: AtomicU64::new(0),
        }
    }

    /// The session new objects attach to.
    pub async fn ensure_session(&self) -> Result<SessionId> {
        self.current
            .get_or_try_init(|| async { self.elect() })
            .await
            .cloned()
    }

    /// The elected session, if the election has run.
    pub fn current(&self) -> Option<SessionId> {
        self.current.get().cloned()
    }

    /// How many times the election body has executed.
    pub fn elections(&self) -> u64 {
        self.elections.load(Ordering::SeqCst)
    }

    #[instrument(skip(self))]
    fn elect(&self) -> Result<SessionId> {
        self.elections.fetch_add(1, Ordering::SeqCst);
        let repo = SessionRepo::new(self.db.clone());
        let now = self.clock.now();

        let active = repo.list_active()?;
        if let Some(latest) = active.first() {
            if now - latest.started_at <= self.config.continuation_window {
                if active.len() > 1 {
                    let retired = repo.retire_active(now, Some(&latest.id))?;
                    warn!(
                        session_id = %latest.id,
                        retired,
                        "multiple active sessions found, retired all but the newest"
                    );
                }
                info!(session_id = %latest.id, "continuing session");
                return Ok(latest.id.clone());
            }
        }

        let retired = repo.retire_active(now, None)?;
        let session = repo.create(now, Some(now + self.config.retention))?;
        info!(session_id = %session.id, retired, "started new session");
        Ok(session.id)
    }

    pub fn get(&self, id: &SessionId) -> Result<SessionRecord> {
        Ok(SessionRepo::new(self.db.clone()).get(id)?)
    }

    pub fn list(&self, limit: u32, offset: u32) -> Result<Vec<SessionRecord>> {
        Ok(SessionRepo::new(self.db.clone()).list(limit, offset)?)
    }

    /// Counters are advisory, so a failed bump is logged, not propagated.
    pub fn increment(&self, id: &SessionId, counter: SessionCounter, by: i64) {
        if by == 0 {
            return;
        }
        if let Err(e) = SessionRepo::new(self.db.clone()).increment(id, counter, by) {
            warn!(session_id = %id, ?counter, error = %e, "failed to bump session counter");
        }
    }

    /// Exempt a session from expiry.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn mark_saved(&self, id: &SessionId) -> Result<()> {
        if !SessionRepo::new(self.db.clone()).mark_saved(id)? {
            return Err(EngineError::NotFound(format!("session {id}")));
        }
        info!(session_id = %id, "session saved");
        Ok(())
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn rename(&self, id: &SessionId, name: Option<&str>) -> Result<()> {
        let name = name.map(str::trim).filter(|n| !n.is_empty());
        if !SessionRepo::new(self.db.clone()).rename(id, name)? {
            return Err(EngineError::NotFound(format!("session {id}")));
        }
        Ok(())
    }

    /// Delete expired, unsaved, retired sessions together with everything
    /// recorded under them. Sessions that still own open objects are kept.
    #[instrument(skip(self))]
    pub fn sweep_expired(&self) -> Result<Vec<SessionId>> {
        let repo = SessionRepo::new(self.db.clone());
        let mut deleted = Vec::new();
        for id in repo.list_expired(self.clock.now())? {
            if Some(&id) == self.current.get() {
                continue;
            }
            let live = repo.count_live_objects(&id)?;
            if live > 0 {
                warn!(session_id = %id, live, "expired session still owns open objects, keeping");
                continue;
            }
            repo.delete_cascade(&id)?;
            deleted.push(id);
        }
        if !deleted.is_empty() {
            info!(count = deleted.len(), "expired sessions deleted");
        }
        Ok(deleted)
    }
}
