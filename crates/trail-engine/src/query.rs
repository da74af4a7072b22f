//! The `Trail` facade: startup, event intake and read access.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Deserializer};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use trail_core::clock::{Clock, SystemClock};
use trail_core::events::ObjectEvent;
use trail_core::ids::{ObjectRef, SessionId, TabId, WindowId};
use trail_core::model::{SessionRecord, TagRecord, TabRecord, TrackedObject, VisitRecord};
use trail_store::intervals::IntervalRepo;
use trail_store::tabs::TabRepo;
use trail_store::tags::TagRepo;
use trail_store::windows::WindowRepo;
use trail_store::{Database, StoreError};

use crate::context::TrailContext;
use crate::error::{EngineError, Result};
use crate::graph::Relationships;
use crate::reconcile::{reconcile, LiveObjectSource, ReconcileReport};
use crate::scheduler::{on_periodic_tick, Scheduler, Tick};
use crate::settings::{ms, TrailSettings};
use crate::tracker::Tracker;
use crate::working_state::WorkingStateStore;

/// User-authored changes. Absent fields are left alone; `notes: null`
/// clears the notes.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataUpdate {
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default, deserialize_with = "present")]
    pub notes: Option<Option<String>>,
}

fn present<'de, D, T>(de: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

/// Trim, drop blanks and duplicates, keep first-seen order.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty() && seen.insert(t.to_string()))
        .map(str::to_string)
        .collect()
}

pub struct Trail {
    ctx: Arc<TrailContext>,
    tracker: Tracker,
}

impl Trail {
    /// Open the store under `data_dir`, proving it answers within the probe
    /// deadline, and restore the working state next to it.
    pub async fn start(settings: TrailSettings, data_dir: &Path) -> Result<Self> {
        settings.validate()?;
        let path = settings.store.resolved_db_path(data_dir);
        let deadline = ms(settings.store.probe_timeout_ms);

        let open = tokio::task::spawn_blocking(move || -> std::result::Result<Database, StoreError> {
            let db = Database::open(&path)?;
            db.probe()?;
            Ok(db)
        });
        let db = match tokio::time::timeout(deadline, open).await {
            Err(_) => return Err(EngineError::ProbeTimeout(deadline)),
            Ok(Err(join)) => return Err(EngineError::StoreUnavailable(join.to_string())),
            Ok(Ok(Err(e))) => return Err(EngineError::StoreUnavailable(e.to_string())),
            Ok(Ok(Ok(db))) => db,
        };

        let state = WorkingStateStore::new(settings.store.resolved_state_path(data_dir));
        info!(db = %db.path().display(), state = %state.path().display(), "trail store ready");
        Ok(Self::with_database(settings, db, Arc::new(SystemClock), Some(state)))
    }

    /// Build around an already opened store.
    pub fn with_database(
        settings: TrailSettings,
        db: Database,
        clock: Arc<dyn Clock>,
        working_state: Option<WorkingStateStore>,
    ) -> Self {
        let ctx = TrailContext::new(settings, db, clock, working_state);
        let tracker = Tracker::new(Arc::clone(&ctx));
        Self { ctx, tracker }
    }

    pub fn context(&self) -> &Arc<TrailContext> {
        &self.ctx
    }

    /// Start the periodic maintenance loop.
    pub fn spawn_scheduler(&self, token: CancellationToken) -> Scheduler {
        Scheduler::spawn(Arc::clone(&self.ctx), token)
    }

    /// Cold-start pass over a full enumeration.
    pub async fn reconcile(&self, source: &dyn LiveObjectSource) -> Result<ReconcileReport> {
        self.tracker.settle().await?;
        reconcile(&self.ctx, source).await
    }

    pub async fn handle_event(&self, event: ObjectEvent) -> bool {
        self.tracker.handle_event(event).await
    }

    /// Tab updates still waiting out their debounce delay.
    pub fn pending_updates(&self) -> usize {
        self.tracker.pending_updates()
    }

    pub fn on_periodic_tick(&self, tick: Tick) -> Result<usize> {
        on_periodic_tick(&self.ctx, tick)
    }

    /// Land every deferred write and persist the working state.
    pub async fn settle(&self) -> Result<()> {
        self.tracker.settle().await?;
        self.ctx.save_working_state();
        Ok(())
    }

    pub fn get_object(&self, id: &str) -> Result<Option<TrackedObject>> {
        Ok(match parse_ref(id)? {
            ObjectRef::Tab(id) => self.ctx.load_tab(&id)?.map(TrackedObject::Tab),
            ObjectRef::Window(id) => self.ctx.load_window(&id)?.map(TrackedObject::Window),
        })
    }

    /// Windows first, then tabs, each oldest first.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn get_objects_in_session(&self, session_id: &SessionId) -> Result<Vec<TrackedObject>> {
        let windows = WindowRepo::new(self.ctx.db.clone()).list_by_session(session_id)?;
        let tabs = TabRepo::new(self.ctx.db.clone()).list_by_session(session_id)?;
        Ok(windows
            .into_iter()
            .map(|w| TrackedObject::Window(self.ctx.queue.overlay_window(w)))
            .chain(tabs.into_iter().map(|t| TrackedObject::Tab(self.ctx.queue.overlay_tab(t))))
            .collect())
    }

    pub fn get_all_relationships(&self, tab_id: &TabId) -> Result<Relationships> {
        if TabRepo::new(self.ctx.db.clone()).find(tab_id)?.is_none() {
            return Err(EngineError::NotFound(format!("tab {tab_id}")));
        }
        self.ctx.graph().relationships(tab_id)
    }

    /// Apply user-authored changes and return the updated object. Tags that
    /// were not on the object before count as a use in the tag catalog.
    #[instrument(skip(self, update), fields(stable_id = %id))]
    pub fn update_metadata(&self, id: &str, update: MetadataUpdate) -> Result<TrackedObject> {
        let object = parse_ref(id)?;
        let current = match &object {
            ObjectRef::Tab(id) => self.ctx.load_tab(id)?.map(TrackedObject::Tab),
            ObjectRef::Window(id) => self.ctx.load_window(id)?.map(TrackedObject::Window),
        }
        .ok_or_else(|| EngineError::NotFound(object.to_string()))?;

        let tags = update.tags.as_deref().map(normalize_tags);
        let notes = update
            .notes
            .as_ref()
            .map(|n| n.as_deref().map(str::trim).filter(|n| !n.is_empty()));

        let db = self.ctx.db.clone();
        match &object {
            ObjectRef::Tab(id) => TabRepo::new(db).update_user_fields(id, tags.as_deref(), notes)?,
            ObjectRef::Window(id) => WindowRepo::new(db).update_user_fields(id, tags.as_deref(), notes)?,
        };

        if let Some(tags) = &tags {
            let before: HashSet<&String> = current.tracking().tags.iter().collect();
            let added: Vec<String> = tags.iter().filter(|t| !before.contains(t)).cloned().collect();
            if !added.is_empty() {
                TagRepo::new(self.ctx.db.clone()).record_usage(&added, self.ctx.now())?;
            }
        }

        self.get_object(object.as_str())?
            .ok_or_else(|| EngineError::NotFound(object.to_string()))
    }

    pub fn mark_saved(&self, session_id: &SessionId) -> Result<()> {
        self.ctx.sessions.mark_saved(session_id)
    }

    pub fn rename_session(&self, session_id: &SessionId, name: Option<&str>) -> Result<()> {
        self.ctx.sessions.rename(session_id, name)
    }

    /// Newest first.
    pub fn get_visit_history(&self, tab_id: &TabId, limit: u32) -> Result<Vec<VisitRecord>> {
        Ok(IntervalRepo::new(self.ctx.db.clone()).visit_history(tab_id, limit)?)
    }

    pub fn current_session_id(&self) -> Option<SessionId> {
        self.ctx.sessions.current()
    }

    /// The tab that currently holds focus.
    pub fn active_object_id(&self) -> Option<TabId> {
        self.ctx.active.lock().tab.clone()
    }

    pub fn active_window_id(&self) -> Option<WindowId> {
        self.ctx.active.lock().window.clone()
    }

    pub fn get_session(&self, session_id: &SessionId) -> Result<SessionRecord> {
        self.ctx.sessions.get(session_id)
    }

    pub fn list_sessions(&self, limit: u32, offset: u32) -> Result<Vec<SessionRecord>> {
        self.ctx.sessions.list(limit, offset)
    }

    pub fn list_tags(&self, limit: u32) -> Result<Vec<TagRecord>> {
        Ok(TagRepo::new(self.ctx.db.clone()).list(limit)?)
    }

    /// Title/URL substring search. Pending writes are flushed first so the
    /// search sees current titles.
    pub fn search_tabs(&self, query: &str, limit: u32) -> Result<Vec<TabRecord>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(EngineError::InvalidInput("empty search query".into()));
        }
        self.ctx.queue.flush()?;
        Ok(TabRepo::new(self.ctx.db.clone()).search(query, limit)?)
    }
}

fn parse_ref(raw: &str) -> Result<ObjectRef> {
    ObjectRef::parse(raw).ok_or_else(|| EngineError::InvalidInput(format!("not a tab or window id: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trail_core::clock::ManualClock;
    use trail_core::events::{LiveSnapshot, TabSnapshot, WindowSnapshot};
    use trail_core::model::WindowKind;

    fn trail() -> Trail {
        Trail::with_database(
            TrailSettings::default(),
            Database::in_memory().unwrap(),
            Arc::new(ManualClock::at_epoch_millis(1_000_000)),
            None,
        )
    }

    fn one_tab() -> LiveSnapshot {
        LiveSnapshot {
            windows: vec![WindowSnapshot {
                volatile_id: 1,
                kind: WindowKind::Normal,
                focused: true,
                tabs: vec![TabSnapshot {
                    volatile_id: 10,
                    window_volatile_id: 1,
                    url: "https://docs.rs/tokio".into(),
                    title: "tokio - Rust".into(),
                    active: true,
                    ..Default::default()
                }],
            }],
        }
    }

    #[test]
    fn notes_distinguish_absent_from_null() {
        let absent: MetadataUpdate = serde_json::from_str(r#"{"tags": ["a"]}"#).unwrap();
        assert_eq!(absent.notes, None);
        let cleared: MetadataUpdate = serde_json::from_str(r#"{"notes": null}"#).unwrap();
        assert_eq!(cleared.notes, Some(None));
        let set: MetadataUpdate = serde_json::from_str(r#"{"notes": "hi"}"#).unwrap();
        assert_eq!(set.notes, Some(Some("hi".into())));
    }

    #[test]
    fn tags_are_normalized() {
        let tags = vec![" rust ".into(), "".into(), "rust".into(), "async".into()];
        assert_eq!(normalize_tags(&tags), vec!["rust".to_string(), "async".to_string()]);
    }

    #[tokio::test]
    async fn metadata_update_records_new_tags_once() {
        let trail = trail();
        trail.reconcile(&one_tab()).await.unwrap();
        let id = trail.active_object_id().unwrap();

        let update = MetadataUpdate {
            tags: Some(vec!["rust".into(), " docs".into()]),
            notes: Some(Some("read later".into())),
        };
        let updated = trail.update_metadata(id.as_str(), update.clone()).unwrap();
        assert_eq!(updated.tracking().tags, vec!["rust", "docs"]);
        assert_eq!(updated.tracking().notes.as_deref(), Some("read later"));

        // Same tags again: not new, so not counted again.
        trail.update_metadata(id.as_str(), update).unwrap();
        let tags = trail.list_tags(10).unwrap();
        assert!(tags.iter().all(|t| t.use_count == 1));

        let cleared = trail
            .update_metadata(
                id.as_str(),
                MetadataUpdate {
                    notes: Some(None),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(cleared.tracking().notes, None);
        assert_eq!(cleared.tracking().tags, vec!["rust", "docs"]);
    }

    #[tokio::test]
    async fn lookups_reject_foreign_ids() {
        let trail = trail();
        let err = trail.get_object("sess_123").unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert!(trail.get_object(TabId::new().as_str()).unwrap().is_none());
        assert!(trail.get_all_relationships(&TabId::new()).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn session_listing_and_search() {
        let trail = trail();
        let report = trail.reconcile(&one_tab()).await.unwrap();
        let session = report.session_id.unwrap();
        assert_eq!(trail.current_session_id(), Some(session.clone()));

        let objects = trail.get_objects_in_session(&session).unwrap();
        assert_eq!(objects.len(), 2);
        assert!(matches!(objects[0], TrackedObject::Window(_)));

        let hits = trail.search_tabs("TOKIO", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(trail.search_tabs("  ", 10).is_err());
    }

    #[tokio::test]
    async fn start_opens_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let trail = Trail::start(TrailSettings::default(), dir.path()).await.unwrap();
        trail.reconcile(&one_tab()).await.unwrap();
        trail.settle().await.unwrap();
        assert!(dir.path().join("trail.db").exists());
        assert!(dir.path().join("state.json").exists());
    }
}
