//! Steady-state event handling.
//!
//! Structural changes (create, close, reopen) are written to the store
//! directly. Volatile fields go through the write queue's `modify` so they
//! coalesce with whatever is already pending for the same object.

use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, info, instrument, warn};

use trail_core::events::{ObjectEvent, TabChange, TabSnapshot, WindowSnapshot};
use trail_core::fingerprint::{tab_fingerprint, window_fingerprint};
use trail_core::ids::{ObjectRef, SessionId, TabId, VolatileId, WindowId};
use trail_core::model::{TabRecord, Tracking, WindowRecord};
use trail_store::intervals::IntervalRepo;
use trail_store::sessions::SessionCounter;
use trail_store::tabs::TabRepo;
use trail_store::windows::WindowRepo;

use crate::context::TrailContext;
use crate::debounce::{Debouncer, FlushFn};
use crate::error::Result;
use crate::settings::{chrono_ms, ms};

pub struct Tracker {
    ctx: Arc<TrailContext>,
    updates: Debouncer<TabId, TabChange>,
}

impl Tracker {
    pub fn new(ctx: Arc<TrailContext>) -> Self {
        let flush_ctx = Arc::clone(&ctx);
        let on_flush: FlushFn<TabId, TabChange> = Arc::new(move |id: TabId, change: TabChange| {
            let ctx = Arc::clone(&flush_ctx);
            async move {
                if let Err(e) = apply_change(&ctx, &id, change) {
                    warn!(stable_id = %id, error = %e, "dropping tab update");
                }
            }
            .boxed()
        });
        let debounce = &ctx.settings.debounce;
        let updates = Debouncer::new(ms(debounce.delay_ms), ms(debounce.max_wait_ms), TabChange::merge, on_flush);
        Self { ctx, updates }
    }

    pub fn context(&self) -> &Arc<TrailContext> {
        &self.ctx
    }

    /// Apply one event. A failure is logged and the event dropped; returns
    /// whether it was applied.
    pub async fn handle_event(&self, event: ObjectEvent) -> bool {
        let name = event.name();
        match self.apply(event).await {
            Ok(()) => true,
            Err(e) => {
                warn!(event = name, error = %e, "dropping event");
                false
            }
        }
    }

    /// Apply one event, surfacing the failure.
    #[instrument(skip_all, fields(event = event.name()))]
    pub async fn apply(&self, event: ObjectEvent) -> Result<()> {
        match event {
            ObjectEvent::TabCreated { tab } => self.tab_created(tab).await,
            ObjectEvent::TabRemoved {
                volatile_id,
                is_window_closing,
                ..
            } => self.tab_removed(volatile_id, is_window_closing),
            ObjectEvent::TabActivated {
                volatile_id,
                window_volatile_id,
            } => self.tab_activated(volatile_id, window_volatile_id).await,
            ObjectEvent::TabUpdated { volatile_id, change } => self.tab_updated(volatile_id, change),
            ObjectEvent::TabMoved {
                volatile_id,
                window_volatile_id,
                to_index,
            } => self.tab_placed(volatile_id, Some(window_volatile_id), to_index),
            ObjectEvent::TabAttached {
                volatile_id,
                new_window_volatile_id,
                new_index,
            } => self.tab_placed(volatile_id, Some(new_window_volatile_id), new_index),
            ObjectEvent::TabDetached { volatile_id, .. } => self.tab_detached(volatile_id),
            ObjectEvent::WindowCreated { window } => self.window_created(window).await,
            ObjectEvent::WindowRemoved { volatile_id } => self.window_removed(volatile_id),
            ObjectEvent::WindowFocusChanged { volatile_id } => self.window_focus_changed(volatile_id).await,
        }
    }

    /// Deliver debounced updates and wait for queued writes to land.
    pub async fn settle(&self) -> Result<()> {
        self.updates.flush_all().await;
        self.ctx.queue.settle().await?;
        Ok(())
    }

    /// Updates still waiting out their debounce delay.
    pub fn pending_updates(&self) -> usize {
        self.updates.pending()
    }

    async fn tab_created(&self, snap: TabSnapshot) -> Result<()> {
        let ctx = &self.ctx;
        let session = ctx.sessions.ensure_session().await?;
        let now = ctx.now();
        let tabs = TabRepo::new(ctx.db.clone());

        // The host reused a number we still consider live: that tab is gone.
        if let Some(stale) = tabs.find_live_by_volatile(snap.volatile_id)? {
            warn!(volatile_id = snap.volatile_id, stable_id = %stale.id, "volatile id reused, closing stale tab");
            close_tab(ctx, &stale.id)?;
        }

        let window_id = ctx.resolve_window(snap.window_volatile_id)?;
        let opener_id = match snap.opener_volatile_id {
            Some(vid) => ctx.resolve_tab(vid)?,
            None => None,
        };
        let fingerprint = tab_fingerprint(&snap.url).ok();
        let reopen_since = now - chrono_ms(ctx.settings.resurrection.tab_reopen_window_ms);
        let candidate = match &fingerprint {
            Some(fp) => tabs.find_resurrection_candidate(fp, reopen_since)?,
            None => None,
        };

        let id = match candidate {
            Some(closed) => {
                let mut rec = ctx.queue.overlay_tab(closed);
                rec.tracking.volatile_id = snap.volatile_id;
                rec.tracking.closed_at = None;
                rec.tracking.session_id = session.clone();
                rec.tracking.last_active_at = now;
                rec.window_id = window_id.clone();
                rec.opener_id = opener_id.clone();
                rec.url = snap.url.clone();
                rec.title = snap.title.clone();
                rec.index = snap.index;
                rec.pinned = snap.pinned;
                tabs.replace(&rec)?;
                ctx.queue.discard(&[ObjectRef::Tab(rec.id.clone())]);
                info!(stable_id = %rec.id, volatile_id = snap.volatile_id, "tab reopened");
                rec.id
            }
            None => {
                let rec = TabRecord {
                    id: TabId::new(),
                    tracking: Tracking::new(snap.volatile_id, fingerprint, session.clone(), now),
                    window_id: window_id.clone(),
                    opener_id: opener_id.clone(),
                    url: snap.url.clone(),
                    title: snap.title.clone(),
                    index: snap.index,
                    pinned: snap.pinned,
                };
                tabs.insert(&rec)?;
                ctx.sessions.increment(&session, SessionCounter::Tabs, 1);
                debug!(stable_id = %rec.id, volatile_id = snap.volatile_id, "tab minted");
                rec.id
            }
        };
        ctx.cache.lock().put_tab(snap.volatile_id, id.clone());

        if !snap.url.is_empty() {
            IntervalRepo::new(ctx.db.clone()).open_visit(&id, &session, &snap.url, now)?;
            ctx.sessions.increment(&session, SessionCounter::Visits, 1);
        }

        let graph = ctx.graph();
        if let Some(opener) = &opener_id {
            graph.opener(&id, opener)?;
        }
        if let Some(window) = &window_id {
            graph.siblings(&id, &session, window)?;
        }

        if snap.active {
            if let Some(window) = &window_id {
                ctx.active.lock().by_window.insert(window.clone(), id.clone());
            }
            if focus_follows(ctx, window_id.as_ref()) {
                switch_tab_focus(ctx, Some(id), &session)?;
            }
        }
        if let Some(window) = &window_id {
            refresh_window_fingerprint(ctx, window)?;
        }
        Ok(())
    }

    fn tab_removed(&self, volatile_id: VolatileId, is_window_closing: bool) -> Result<()> {
        let ctx = &self.ctx;
        let Some(id) = ctx.resolve_tab(volatile_id)? else {
            debug!(volatile_id, "removed tab was never tracked");
            return Ok(());
        };
        let window_id = ctx.load_tab(&id)?.and_then(|t| t.window_id);
        close_tab(ctx, &id)?;
        ctx.cache.lock().remove_tab(volatile_id);

        if !is_window_closing {
            if let Some(window) = &window_id {
                refresh_window_fingerprint(ctx, window)?;
            }
        }
        Ok(())
    }

    async fn tab_activated(&self, volatile_id: VolatileId, window_volatile_id: VolatileId) -> Result<()> {
        let ctx = &self.ctx;
        let session = ctx.sessions.ensure_session().await?;
        let Some(id) = ctx.resolve_tab(volatile_id)? else {
            debug!(volatile_id, "activated tab is not tracked");
            return Ok(());
        };
        let window_id = ctx.resolve_window(window_volatile_id)?;
        if let Some(window) = &window_id {
            ctx.active.lock().by_window.insert(window.clone(), id.clone());
        }
        if focus_follows(ctx, window_id.as_ref()) {
            switch_tab_focus(ctx, Some(id), &session)?;
        }
        Ok(())
    }

    fn tab_updated(&self, volatile_id: VolatileId, change: TabChange) -> Result<()> {
        if change.is_empty() {
            return Ok(());
        }
        let Some(id) = self.ctx.resolve_tab(volatile_id)? else {
            debug!(volatile_id, "updated tab is not tracked");
            return Ok(());
        };
        self.updates.push(id, change);
        Ok(())
    }

    fn tab_placed(&self, volatile_id: VolatileId, window_volatile_id: Option<VolatileId>, index: i64) -> Result<()> {
        let ctx = &self.ctx;
        let Some(id) = ctx.resolve_tab(volatile_id)? else {
            return Ok(());
        };
        let window_id = match window_volatile_id {
            Some(vid) => ctx.resolve_window(vid)?,
            None => None,
        };
        let previous = ctx.load_tab(&id)?.and_then(|t| t.window_id);
        ctx.queue.modify_tab(&id, |tab| {
            if window_id.is_some() {
                tab.window_id = window_id.clone();
            }
            tab.index = index;
        })?;

        if previous != window_id {
            for window in previous.iter().chain(window_id.iter()) {
                refresh_window_fingerprint(ctx, window)?;
            }
            if let Some(window) = &previous {
                let mut active = ctx.active.lock();
                if active.by_window.get(window) == Some(&id) {
                    active.by_window.remove(window);
                }
            }
        }
        Ok(())
    }

    fn tab_detached(&self, volatile_id: VolatileId) -> Result<()> {
        let ctx = &self.ctx;
        let Some(id) = ctx.resolve_tab(volatile_id)? else {
            return Ok(());
        };
        let previous = ctx.load_tab(&id)?.and_then(|t| t.window_id);
        ctx.queue.modify_tab(&id, |tab| tab.window_id = None)?;
        if let Some(window) = &previous {
            ctx.active.lock().by_window.remove(window);
            refresh_window_fingerprint(ctx, window)?;
        }
        Ok(())
    }

    async fn window_created(&self, snap: WindowSnapshot) -> Result<()> {
        let ctx = &self.ctx;
        let session = ctx.sessions.ensure_session().await?;
        let now = ctx.now();
        let windows = WindowRepo::new(ctx.db.clone());

        if let Some(stale) = windows.find_live_by_volatile(snap.volatile_id)? {
            warn!(volatile_id = snap.volatile_id, stable_id = %stale.id, "volatile id reused, closing stale window");
            close_window(ctx, &stale.id)?;
        }

        let fingerprint = window_fingerprint(&snap.kind.to_string(), snap.tab_urls()).ok();
        let reopen_since = now - chrono_ms(ctx.settings.resurrection.tab_reopen_window_ms);
        let candidate = match &fingerprint {
            Some(fp) => windows.find_resurrection_candidate(fp, reopen_since)?,
            None => None,
        };

        let id = match candidate {
            Some(closed) => {
                let mut rec = ctx.queue.overlay_window(closed);
                rec.tracking.volatile_id = snap.volatile_id;
                rec.tracking.closed_at = None;
                rec.tracking.session_id = session.clone();
                rec.kind = snap.kind;
                rec.focused = false;
                windows.replace(&rec)?;
                ctx.queue.discard(&[ObjectRef::Window(rec.id.clone())]);
                info!(stable_id = %rec.id, volatile_id = snap.volatile_id, "window reopened");
                rec.id
            }
            None => {
                let rec = WindowRecord {
                    id: WindowId::new(),
                    tracking: Tracking::new(snap.volatile_id, fingerprint, session.clone(), now),
                    kind: snap.kind,
                    focused: false,
                };
                windows.insert(&rec)?;
                ctx.sessions.increment(&session, SessionCounter::Windows, 1);
                debug!(stable_id = %rec.id, volatile_id = snap.volatile_id, "window minted");
                rec.id
            }
        };
        ctx.cache.lock().put_window(snap.volatile_id, id.clone());

        if snap.focused {
            switch_window_focus(ctx, Some(id), &session)?;
        }
        Ok(())
    }

    fn window_removed(&self, volatile_id: VolatileId) -> Result<()> {
        let ctx = &self.ctx;
        let Some(id) = ctx.resolve_window(volatile_id)? else {
            debug!(volatile_id, "removed window was never tracked");
            return Ok(());
        };
        // Pending moves decide which tabs the window still holds.
        ctx.queue.flush()?;
        let now = ctx.now();
        let closed_tabs = TabRepo::new(ctx.db.clone()).close_in_window(&id, now)?;
        for tab in &closed_tabs {
            close_tab(ctx, tab)?;
        }
        close_window(ctx, &id)?;
        ctx.cache.lock().remove_window(volatile_id);
        debug!(stable_id = %id, tabs = closed_tabs.len(), "window closed");
        Ok(())
    }

    async fn window_focus_changed(&self, volatile_id: Option<VolatileId>) -> Result<()> {
        let ctx = &self.ctx;
        let session = ctx.sessions.ensure_session().await?;
        let next = match volatile_id {
            Some(vid) => ctx.resolve_window(vid)?,
            None => None,
        };
        switch_window_focus(ctx, next, &session)
    }
}

/// Tab focus follows activation only inside the focused window. With no
/// window known to hold focus, any activation counts.
fn focus_follows(ctx: &TrailContext, window: Option<&WindowId>) -> bool {
    let active = ctx.active.lock();
    match (&active.window, window) {
        (None, _) | (_, None) => true,
        (Some(focused), Some(w)) => focused == w,
    }
}

/// Close a tab with everything hanging off it. Idempotent.
fn close_tab(ctx: &TrailContext, id: &TabId) -> Result<()> {
    let now = ctx.now();
    TabRepo::new(ctx.db.clone()).close(id, now)?;
    let intervals = IntervalRepo::new(ctx.db.clone());
    intervals.close_open_visit(id, now)?;
    if let Some(d) = intervals.close_open_focus(&ObjectRef::Tab(id.clone()), now)? {
        ctx.queue.modify_tab(id, |tab| tab.tracking.active_duration_ms += d)?;
    }
    ctx.cache.lock().forget_tab(id);
    let mut active = ctx.active.lock();
    if active.tab.as_ref() == Some(id) {
        active.tab = None;
    }
    active.by_window.retain(|_, tab| tab != id);
    Ok(())
}

fn close_window(ctx: &TrailContext, id: &WindowId) -> Result<()> {
    let now = ctx.now();
    WindowRepo::new(ctx.db.clone()).close(id, now)?;
    let focus = IntervalRepo::new(ctx.db.clone()).close_open_focus(&ObjectRef::Window(id.clone()), now)?;
    ctx.queue.modify_window(id, |window| {
        window.focused = false;
        if let Some(d) = focus {
            window.tracking.active_duration_ms += d;
        }
    })?;
    ctx.cache.lock().forget_window(id);
    let mut active = ctx.active.lock();
    if active.window.as_ref() == Some(id) {
        active.window = None;
    }
    active.by_window.remove(id);
    Ok(())
}

/// Move tab focus to `next`, closing the previous interval and crediting
/// its duration.
fn switch_tab_focus(ctx: &TrailContext, next: Option<TabId>, session: &SessionId) -> Result<()> {
    let previous = std::mem::replace(&mut ctx.active.lock().tab, next.clone());
    if previous == next {
        return Ok(());
    }
    let now = ctx.now();
    let intervals = IntervalRepo::new(ctx.db.clone());
    if let Some(prev) = &previous {
        if let Some(d) = intervals.close_open_focus(&ObjectRef::Tab(prev.clone()), now)? {
            ctx.queue.modify_tab(prev, |tab| tab.tracking.active_duration_ms += d)?;
        }
    }
    if let Some(id) = &next {
        intervals.open_focus(&ObjectRef::Tab(id.clone()), session, now)?;
        ctx.queue.modify_tab(id, |tab| tab.tracking.last_active_at = now)?;
    }
    Ok(())
}

/// Move window focus to `next` (`None`: focus left the host), then hand tab
/// focus to that window's remembered active tab.
fn switch_window_focus(ctx: &TrailContext, next: Option<WindowId>, session: &SessionId) -> Result<()> {
    let (previous, next_tab) = {
        let mut active = ctx.active.lock();
        let previous = std::mem::replace(&mut active.window, next.clone());
        let next_tab = next.as_ref().and_then(|w| active.by_window.get(w).cloned());
        (previous, next_tab)
    };
    if previous != next {
        let now = ctx.now();
        let intervals = IntervalRepo::new(ctx.db.clone());
        if let Some(prev) = &previous {
            let d = intervals.close_open_focus(&ObjectRef::Window(prev.clone()), now)?;
            ctx.queue.modify_window(prev, |window| {
                window.focused = false;
                window.tracking.active_duration_ms += d.unwrap_or(0);
            })?;
        }
        if let Some(id) = &next {
            intervals.open_focus(&ObjectRef::Window(id.clone()), session, now)?;
            ctx.queue.modify_window(id, |window| {
                window.focused = true;
                window.tracking.last_active_at = now;
            })?;
        }
    }
    switch_tab_focus(ctx, next_tab, session)
}

/// Recompute a window's fingerprint from the tabs it holds. An emptied
/// window keeps its last fingerprint so it can still be recognized.
fn refresh_window_fingerprint(ctx: &TrailContext, id: &WindowId) -> Result<()> {
    let Some(window) = ctx.load_window(id)? else {
        return Ok(());
    };
    // Whole live set: a tab whose move here is still queued is stored elsewhere.
    let urls: Vec<String> = TabRepo::new(ctx.db.clone())
        .list_live()?
        .into_iter()
        .map(|tab| ctx.queue.overlay_tab(tab))
        .filter(|tab| tab.window_id.as_ref() == Some(id))
        .map(|tab| tab.url)
        .collect();
    let Ok(fingerprint) = window_fingerprint(&window.kind.to_string(), urls.iter().map(String::as_str)) else {
        return Ok(());
    };
    if window.tracking.fingerprint.as_ref() != Some(&fingerprint) {
        ctx.queue.modify_window(id, |w| w.tracking.fingerprint = Some(fingerprint))?;
    }
    Ok(())
}

/// Land a debounced batch of changes for one tab.
fn apply_change(ctx: &TrailContext, id: &TabId, change: TabChange) -> Result<()> {
    let Some(current) = ctx.load_tab(id)? else {
        return Ok(());
    };
    if !current.tracking.is_live() {
        debug!(stable_id = %id, "update for closed tab ignored");
        return Ok(());
    }
    let new_url = change.url.clone().filter(|url| *url != current.url);

    ctx.queue.modify_tab(id, |tab| {
        if let Some(url) = &new_url {
            tab.url = url.clone();
            tab.tracking.fingerprint = tab_fingerprint(url).ok();
        }
        if let Some(title) = change.title {
            tab.title = title;
        }
        if let Some(pinned) = change.pinned {
            tab.pinned = pinned;
        }
    })?;

    if let Some(url) = new_url {
        let now = ctx.now();
        let intervals = IntervalRepo::new(ctx.db.clone());
        intervals.close_open_visit(id, now)?;
        if !url.is_empty() {
            let session = ctx.sessions.current().unwrap_or_else(|| current.tracking.session_id.clone());
            intervals.open_visit(id, &session, &url, now)?;
            ctx.sessions.increment(&session, SessionCounter::Visits, 1);
        }
        if let Some(window) = &current.window_id {
            refresh_window_fingerprint(ctx, window)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::TrailSettings;
    use chrono::Duration;
    use trail_core::clock::ManualClock;
    use trail_core::model::WindowKind;
    use trail_store::Database;

    struct Harness {
        tracker: Tracker,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::at_epoch_millis(1_000_000));
            let ctx = TrailContext::new(TrailSettings::default(), Database::in_memory().unwrap(), clock.clone(), None);
            Self {
                tracker: Tracker::new(ctx),
                clock,
            }
        }

        fn ctx(&self) -> &Arc<TrailContext> {
            self.tracker.context()
        }

        async fn send(&self, event: ObjectEvent) {
            self.tracker.apply(event).await.unwrap();
        }

        async fn window(&self, volatile_id: i64, focused: bool) -> WindowId {
            self.send(ObjectEvent::WindowCreated {
                window: WindowSnapshot {
                    volatile_id,
                    kind: WindowKind::Normal,
                    focused,
                    tabs: vec![],
                },
            })
            .await;
            self.ctx().resolve_window(volatile_id).unwrap().unwrap()
        }

        async fn tab(&self, volatile_id: i64, window: i64, url: &str) -> TabId {
            self.send(ObjectEvent::TabCreated {
                tab: TabSnapshot {
                    volatile_id,
                    window_volatile_id: window,
                    url: url.into(),
                    ..Default::default()
                },
            })
            .await;
            self.ctx().resolve_tab(volatile_id).unwrap().unwrap()
        }

        async fn remove(&self, volatile_id: i64) {
            self.send(ObjectEvent::TabRemoved {
                volatile_id,
                window_volatile_id: None,
                is_window_closing: false,
            })
            .await;
        }

        fn tab_record(&self, id: &TabId) -> TabRecord {
            self.ctx().load_tab(id).unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn created_tab_gets_visit_and_counts() {
        let h = Harness::new();
        h.window(1, true).await;
        let id = h.tab(10, 1, "https://a.com/").await;

        let visit = IntervalRepo::new(h.ctx().db.clone()).open_visit_for(&id).unwrap().unwrap();
        assert_eq!(visit.url, "https://a.com/");
        let session = h.ctx().sessions.current().unwrap();
        let s = h.ctx().sessions.get(&session).unwrap();
        assert_eq!((s.tab_count, s.window_count, s.visit_count), (1, 1, 1));
    }

    #[tokio::test]
    async fn reopen_inside_window_keeps_identity() {
        let h = Harness::new();
        h.window(1, true).await;
        let id = h.tab(10, 1, "https://a.com/page").await;
        h.remove(10).await;

        h.clock.advance(Duration::minutes(4));
        let again = h.tab(11, 1, "https://a.com/page").await;
        assert_eq!(again, id);
        assert!(h.tab_record(&id).tracking.is_live());
    }

    #[tokio::test]
    async fn reopen_after_window_mints() {
        let h = Harness::new();
        h.window(1, true).await;
        let id = h.tab(10, 1, "https://a.com/page").await;
        h.remove(10).await;

        h.clock.advance(Duration::minutes(6));
        let again = h.tab(11, 1, "https://a.com/page").await;
        assert_ne!(again, id);
    }

    #[tokio::test]
    async fn opener_and_sibling_edges_recorded() {
        let h = Harness::new();
        h.window(1, true).await;
        let parent = h.tab(10, 1, "https://a.com/").await;
        h.send(ObjectEvent::TabCreated {
            tab: TabSnapshot {
                volatile_id: 11,
                window_volatile_id: 1,
                opener_volatile_id: Some(10),
                url: "https://b.com/".into(),
                ..Default::default()
            },
        })
        .await;
        let child = h.ctx().resolve_tab(11).unwrap().unwrap();

        let rel = h.ctx().graph().relationships(&child).unwrap();
        assert_eq!(rel.opener_chain, vec![parent.clone()]);
        assert_eq!(rel.siblings.len(), 1);
        assert_eq!(h.tab_record(&child).opener_id, Some(parent));
    }

    #[tokio::test]
    async fn siblings_see_tabs_attached_before_flush() {
        let h = Harness::new();
        h.window(1, true).await;
        h.window(2, false).await;
        let arriving = h.tab(10, 2, "https://a.com/").await;
        h.tab(12, 1, "https://c.com/").await;
        h.send(ObjectEvent::TabAttached {
            volatile_id: 10,
            new_window_volatile_id: 1,
            new_index: 0,
        })
        .await;
        h.send(ObjectEvent::TabAttached {
            volatile_id: 12,
            new_window_volatile_id: 2,
            new_index: 0,
        })
        .await;

        let fresh = h.tab(11, 1, "https://b.com/").await;
        let rel = h.ctx().graph().relationships(&fresh).unwrap();
        let linked: Vec<TabId> = rel.siblings.into_iter().map(|r| r.id).collect();
        assert_eq!(linked, vec![arriving]);
    }

    #[tokio::test]
    async fn activation_credits_focus_duration() {
        let h = Harness::new();
        h.window(1, true).await;
        let a = h.tab(10, 1, "https://a.com/").await;
        h.tab(11, 1, "https://b.com/").await;

        h.send(ObjectEvent::TabActivated {
            volatile_id: 10,
            window_volatile_id: 1,
        })
        .await;
        h.clock.advance(Duration::seconds(30));
        h.send(ObjectEvent::TabActivated {
            volatile_id: 11,
            window_volatile_id: 1,
        })
        .await;

        assert_eq!(h.tab_record(&a).tracking.active_duration_ms, 30_000);
        assert_eq!(h.ctx().active.lock().tab, h.ctx().resolve_tab(11).unwrap());
    }

    #[tokio::test]
    async fn url_change_opens_new_visit() {
        let h = Harness::new();
        h.window(1, true).await;
        let id = h.tab(10, 1, "https://a.com/").await;
        h.send(ObjectEvent::TabUpdated {
            volatile_id: 10,
            change: TabChange {
                url: Some("https://a.com/next".into()),
                ..Default::default()
            },
        })
        .await;
        h.tracker.settle().await.unwrap();

        let tab = h.tab_record(&id);
        assert_eq!(tab.url, "https://a.com/next");
        assert_eq!(tab.tracking.fingerprint, tab_fingerprint("https://a.com/next").ok());
        let history = IntervalRepo::new(h.ctx().db.clone()).visit_history(&id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|v| v.end.is_none()).count(), 1);
    }

    #[tokio::test]
    async fn window_removal_closes_its_tabs() {
        let h = Harness::new();
        let window = h.window(1, true).await;
        let a = h.tab(10, 1, "https://a.com/").await;
        let b = h.tab(11, 1, "https://b.com/").await;

        h.send(ObjectEvent::WindowRemoved { volatile_id: 1 }).await;
        assert!(!h.tab_record(&a).tracking.is_live());
        assert!(!h.tab_record(&b).tracking.is_live());
        assert!(!h.ctx().load_window(&window).unwrap().unwrap().tracking.is_live());
        assert_eq!(h.ctx().resolve_tab(10).unwrap(), None);
        assert_eq!(h.ctx().active.lock().window, None);
    }

    #[tokio::test]
    async fn focus_leaving_host_closes_intervals() {
        let h = Harness::new();
        let window = h.window(1, true).await;
        h.send(ObjectEvent::WindowFocusChanged { volatile_id: None }).await;

        let focus = IntervalRepo::new(h.ctx().db.clone())
            .focus_history(&ObjectRef::Window(window.clone()), 10)
            .unwrap();
        assert_eq!(focus.len(), 1);
        assert!(focus[0].end.is_some());
        assert!(!h.ctx().load_window(&window).unwrap().unwrap().focused);
    }

    #[tokio::test]
    async fn unknown_tab_events_are_ignored() {
        let h = Harness::new();
        assert!(
            h.tracker
                .handle_event(ObjectEvent::TabRemoved {
                    volatile_id: 404,
                    window_volatile_id: None,
                    is_window_closing: false,
                })
                .await
        );
    }
}
