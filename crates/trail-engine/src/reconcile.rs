//! Cold-start reconciliation of a full live enumeration against the store.
//!
//! Windows are resolved before their tabs so tab linkage goes through the
//! identity cache. Each live object is claimed through the cache,
//! resurrected from a recently closed record with the same fingerprint, or
//! minted. The enumeration is authoritative: anything the
//! store still had open but nobody claimed is closed first, which is what
//! makes it eligible for resurrection.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, instrument, warn};

use trail_core::events::{LiveSnapshot, TabSnapshot, WindowSnapshot};
use trail_core::fingerprint::{tab_fingerprint, window_fingerprint, Fingerprint};
use trail_core::ids::{ObjectRef, SessionId, TabId, VolatileId, WindowId};
use trail_core::model::{ObjectKind, TabRecord, Tracking, WindowRecord};
use trail_store::intervals::IntervalRepo;
use trail_store::sessions::SessionCounter;
use trail_store::tabs::TabRepo;
use trail_store::windows::WindowRepo;

use crate::context::TrailContext;
use crate::error::Result;
use crate::settings::chrono_ms;

/// Full enumeration of what the host has open. Only used at cold start.
#[async_trait]
pub trait LiveObjectSource: Send + Sync {
    async fn enumerate_live_objects(&self) -> Result<LiveSnapshot>;
}

/// A snapshot handed over by the caller, e.g. in a request body.
#[async_trait]
impl LiveObjectSource for LiveSnapshot {
    async fn enumerate_live_objects(&self) -> Result<LiveSnapshot> {
        Ok(self.clone())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcomes {
    pub claimed: usize,
    pub resurrected: usize,
    pub minted: usize,
}

impl Outcomes {
    pub fn total(&self) -> usize {
        self.claimed + self.resurrected + self.minted
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub session_id: Option<SessionId>,
    pub windows: Outcomes,
    pub tabs: Outcomes,
    /// Records the store still had open that the enumeration did not claim.
    pub leftovers_closed: usize,
    pub duplicates_removed: usize,
    /// Post-condition mismatches. Logged, never fatal.
    pub warnings: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Resolution {
    Claimed,
    Resurrected,
    Minted,
}

impl Outcomes {
    fn count(&mut self, r: Resolution) {
        match r {
            Resolution::Claimed => self.claimed += 1,
            Resolution::Resurrected => self.resurrected += 1,
            Resolution::Minted => self.minted += 1,
        }
    }
}

/// An unknown fingerprint on either side can not disprove a match.
fn fingerprint_agrees(stored: Option<&Fingerprint>, observed: Option<&Fingerprint>) -> bool {
    match (stored, observed) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

/// A cache hit on a live record is claimed outright. A record that was
/// already closed before this pass is only reclaimed if its content still
/// agrees, since the host may have handed its number to something new.
fn claimable(tracking: &Tracking, observed: Option<&Fingerprint>) -> bool {
    tracking.closed_at.is_none() || fingerprint_agrees(tracking.fingerprint.as_ref(), observed)
}

/// Run one reconciliation pass. A store failure aborts the pass; the caller retries.
#[instrument(skip(ctx, source))]
pub async fn reconcile(ctx: &TrailContext, source: &dyn LiveObjectSource) -> Result<ReconcileReport> {
    let snapshot = source.enumerate_live_objects().await?;
    let session = ctx.sessions.ensure_session().await?;
    // Queued volatile writes predate this enumeration; land them before
    // rewriting identities so they can not resurface afterwards.
    ctx.queue.flush()?;

    let mut pass = Pass::new(ctx, session.clone());
    pass.run(&snapshot)?;
    let mut report = pass.report;

    if ctx.take_compaction_turn() {
        report.duplicates_removed = compact_closed_duplicates(ctx)?;
    }
    check_postconditions(ctx, &snapshot, &mut report)?;
    ctx.save_working_state();

    info!(
        session_id = %session,
        windows = report.windows.total(),
        tabs = report.tabs.total(),
        tabs_minted = report.tabs.minted,
        tabs_resurrected = report.tabs.resurrected,
        leftovers = report.leftovers_closed,
        duplicates = report.duplicates_removed,
        "reconciliation complete"
    );
    Ok(report)
}

struct Pass<'a> {
    ctx: &'a TrailContext,
    session: SessionId,
    now: chrono::DateTime<chrono::Utc>,
    tabs: TabRepo,
    windows: WindowRepo,
    intervals: IntervalRepo,
    report: ReconcileReport,
}

impl<'a> Pass<'a> {
    fn new(ctx: &'a TrailContext, session: SessionId) -> Self {
        Self {
            ctx,
            now: ctx.now(),
            tabs: TabRepo::new(ctx.db.clone()),
            windows: WindowRepo::new(ctx.db.clone()),
            intervals: IntervalRepo::new(ctx.db.clone()),
            report: ReconcileReport {
                session_id: Some(session.clone()),
                ..Default::default()
            },
            session,
        }
    }

    fn run(&mut self, snapshot: &LiveSnapshot) -> Result<()> {
        let live_windows = dedupe_windows(snapshot);
        let live_tabs = dedupe_tabs(snapshot);

        // Focus is reassigned below; bank what the previous holders accrued
        // before any record is read back for rewriting.
        self.credit_open_focus()?;

        // Step 1: cache claims.
        let mut claimed_windows: HashMap<VolatileId, WindowRecord> = HashMap::new();
        let mut claimed_ids: HashSet<WindowId> = HashSet::new();
        for w in &live_windows {
            let cached = self.ctx.cache.lock().window(w.volatile_id);
            let Some(id) = cached else { continue };
            let observed = window_fingerprint(&w.kind.to_string(), w.tab_urls()).ok();
            match self.windows.find(&id)? {
                Some(rec) if !claimed_ids.contains(&rec.id) && claimable(&rec.tracking, observed.as_ref()) => {
                    claimed_ids.insert(rec.id.clone());
                    claimed_windows.insert(w.volatile_id, rec);
                }
                _ => {
                    self.ctx.cache.lock().remove_window(w.volatile_id);
                }
            }
        }

        let mut claimed_tabs: HashMap<VolatileId, TabRecord> = HashMap::new();
        let mut claimed_tab_ids: HashSet<TabId> = HashSet::new();
        for t in &live_tabs {
            let cached = self.ctx.cache.lock().tab(t.volatile_id);
            let Some(id) = cached else { continue };
            let observed = tab_fingerprint(&t.url).ok();
            match self.tabs.find(&id)? {
                Some(rec) if !claimed_tab_ids.contains(&rec.id) && claimable(&rec.tracking, observed.as_ref()) => {
                    claimed_tab_ids.insert(rec.id.clone());
                    claimed_tabs.insert(t.volatile_id, rec);
                }
                _ => {
                    self.ctx.cache.lock().remove_tab(t.volatile_id);
                }
            }
        }

        // Step 2: close every live leftover of the previous process.
        self.close_leftovers(&claimed_ids, &claimed_tab_ids)?;

        // Steps 3-5, windows first.
        let mut window_ids: HashMap<VolatileId, WindowId> = HashMap::new();
        for w in &live_windows {
            let (id, resolution) = self.resolve_window(w, claimed_windows.remove(&w.volatile_id))?;
            self.report.windows.count(resolution);
            self.ctx.cache.lock().put_window(w.volatile_id, id.clone());
            window_ids.insert(w.volatile_id, id);
        }

        let mut resolved: Vec<(&TabSnapshot, TabRecord, Resolution)> = Vec::with_capacity(live_tabs.len());
        for t in &live_tabs {
            let window_id = window_ids.get(&t.window_volatile_id).cloned();
            let (rec, resolution) = self.resolve_tab(t, window_id, claimed_tabs.remove(&t.volatile_id))?;
            self.report.tabs.count(resolution);
            self.ctx.cache.lock().put_tab(t.volatile_id, rec.id.clone());
            resolved.push((t, rec, resolution));
        }

        self.link_openers(&mut resolved)?;
        self.open_intervals(&live_windows, &resolved, &window_ids)?;

        let ctx = self.ctx;
        ctx.sessions
            .increment(&self.session, SessionCounter::Windows, self.report.windows.minted as i64);
        ctx.sessions
            .increment(&self.session, SessionCounter::Tabs, self.report.tabs.minted as i64);
        Ok(())
    }

    fn close_leftovers(&mut self, claimed_windows: &HashSet<WindowId>, claimed_tabs: &HashSet<TabId>) -> Result<()> {
        let leftover_tabs: Vec<TabId> = self
            .tabs
            .list_live()?
            .into_iter()
            .map(|t| t.id)
            .filter(|id| !claimed_tabs.contains(id))
            .collect();
        let leftover_windows = self
            .windows
            .list_live()?
            .iter()
            .filter(|w| !claimed_windows.contains(&w.id))
            .count();

        for id in &leftover_tabs {
            self.intervals.close_open_visit(id, self.now)?;
        }
        // Claimed records are closed too and reopened below with their new
        // volatile ids, so no transient duplicate can hit the live index.
        self.tabs.close_all_live(self.now)?;
        self.windows.close_all_live(self.now)?;

        self.report.leftovers_closed = leftover_tabs.len() + leftover_windows;
        Ok(())
    }

    /// End every open focus interval and add its time to the owner's
    /// running total, landed in the store before step 1 reads it.
    fn credit_open_focus(&self) -> Result<()> {
        let queue = &self.ctx.queue;
        for kind in [ObjectKind::Tab, ObjectKind::Window] {
            for (owner, ms) in self.intervals.close_all_focus(kind, self.now)? {
                match owner {
                    ObjectRef::Tab(id) => {
                        queue.modify_tab(&id, |tab| tab.tracking.active_duration_ms += ms)?;
                    }
                    ObjectRef::Window(id) => {
                        queue.modify_window(&id, |w| w.tracking.active_duration_ms += ms)?;
                    }
                }
            }
        }
        queue.flush()?;
        Ok(())
    }

    fn resurrect_since(&self) -> chrono::DateTime<chrono::Utc> {
        self.now - chrono_ms(self.ctx.settings.resurrection.reconcile_window_ms)
    }

    fn resolve_window(&self, w: &WindowSnapshot, claimed: Option<WindowRecord>) -> Result<(WindowId, Resolution)> {
        let fingerprint = window_fingerprint(&w.kind.to_string(), w.tab_urls()).ok();

        let (mut rec, resolution) = match claimed {
            Some(rec) => (rec, Resolution::Claimed),
            None => {
                let candidate = match &fingerprint {
                    Some(fp) => self.windows.find_resurrection_candidate(fp, self.resurrect_since())?,
                    None => None,
                };
                match candidate {
                    Some(rec) => (rec, Resolution::Resurrected),
                    None => {
                        let rec = WindowRecord {
                            id: WindowId::new(),
                            tracking: Tracking::new(w.volatile_id, fingerprint, self.session.clone(), self.now),
                            kind: w.kind,
                            focused: w.focused,
                        };
                        self.windows.insert(&rec)?;
                        return Ok((rec.id, Resolution::Minted));
                    }
                }
            }
        };

        rec.tracking.volatile_id = w.volatile_id;
        if fingerprint.is_some() {
            rec.tracking.fingerprint = fingerprint;
        }
        rec.tracking.closed_at = None;
        rec.tracking.session_id = self.session.clone();
        rec.kind = w.kind;
        rec.focused = w.focused;
        self.windows.replace(&rec)?;
        self.ctx.queue.discard(&[ObjectRef::Window(rec.id.clone())]);
        Ok((rec.id, resolution))
    }

    fn resolve_tab(
        &self,
        t: &TabSnapshot,
        window_id: Option<WindowId>,
        claimed: Option<TabRecord>,
    ) -> Result<(TabRecord, Resolution)> {
        let fingerprint = tab_fingerprint(&t.url).ok();

        let (mut rec, resolution) = match claimed {
            Some(rec) => (rec, Resolution::Claimed),
            None => {
                let candidate = match &fingerprint {
                    Some(fp) => self.tabs.find_resurrection_candidate(fp, self.resurrect_since())?,
                    None => None,
                };
                match candidate {
                    Some(rec) => (rec, Resolution::Resurrected),
                    None => {
                        let rec = TabRecord {
                            id: TabId::new(),
                            tracking: Tracking::new(t.volatile_id, fingerprint, self.session.clone(), self.now),
                            window_id,
                            opener_id: None,
                            url: t.url.clone(),
                            title: t.title.clone(),
                            index: t.index,
                            pinned: t.pinned,
                        };
                        self.tabs.insert(&rec)?;
                        return Ok((rec, Resolution::Minted));
                    }
                }
            }
        };

        rec.tracking.volatile_id = t.volatile_id;
        if fingerprint.is_some() {
            rec.tracking.fingerprint = fingerprint;
        }
        rec.tracking.closed_at = None;
        rec.tracking.session_id = self.session.clone();
        rec.window_id = window_id;
        rec.url = t.url.clone();
        rec.title = t.title.clone();
        rec.index = t.index;
        rec.pinned = t.pinned;
        self.tabs.replace(&rec)?;
        self.ctx.queue.discard(&[ObjectRef::Tab(rec.id.clone())]);
        Ok((rec, resolution))
    }

    /// Openers can appear anywhere in the enumeration, so they are linked
    /// once every tab has an identity.
    fn link_openers(&self, resolved: &mut [(&TabSnapshot, TabRecord, Resolution)]) -> Result<()> {
        let graph = self.ctx.graph();
        for (snap, rec, resolution) in resolved.iter_mut() {
            let Some(opener_vid) = snap.opener_volatile_id else { continue };
            let Some(opener) = self.ctx.resolve_tab(opener_vid)? else { continue };
            if opener == rec.id || rec.opener_id.as_ref() == Some(&opener) {
                continue;
            }
            rec.opener_id = Some(opener.clone());
            self.tabs.replace(rec)?;
            if *resolution == Resolution::Minted {
                graph.opener(&rec.id, &opener)?;
            }
        }
        Ok(())
    }

    fn open_intervals(
        &mut self,
        live_windows: &[&WindowSnapshot],
        resolved: &[(&TabSnapshot, TabRecord, Resolution)],
        window_ids: &HashMap<VolatileId, WindowId>,
    ) -> Result<()> {
        let mut visits = 0;
        for (_, rec, _) in resolved {
            if rec.url.is_empty() {
                continue;
            }
            let current = self.intervals.open_visit_for(&rec.id)?;
            if current.is_some_and(|v| v.url == rec.url) {
                continue;
            }
            self.intervals.open_visit(&rec.id, &self.session, &rec.url, self.now)?;
            visits += 1;
        }
        self.ctx
            .sessions
            .increment(&self.session, SessionCounter::Visits, visits);

        let mut active = self.ctx.active.lock();
        active.tab = None;
        active.window = None;
        active.by_window.clear();
        for (snap, rec, _) in resolved.iter().filter(|(s, _, _)| s.active) {
            if let Some(window_id) = window_ids.get(&snap.window_volatile_id) {
                active.by_window.insert(window_id.clone(), rec.id.clone());
            }
        }
        let focused = live_windows
            .iter()
            .find(|w| w.focused)
            .and_then(|w| window_ids.get(&w.volatile_id));
        if let Some(window_id) = focused {
            active.window = Some(window_id.clone());
            active.tab = active.by_window.get(window_id).cloned();
        }
        let (window, tab) = (active.window.clone(), active.tab.clone());
        drop(active);

        if let Some(window) = window {
            self.intervals
                .open_focus(&ObjectRef::Window(window), &self.session, self.now)?;
        }
        if let Some(tab) = tab {
            self.intervals.open_focus(&ObjectRef::Tab(tab), &self.session, self.now)?;
        }
        Ok(())
    }
}

fn dedupe_windows(snapshot: &LiveSnapshot) -> Vec<&WindowSnapshot> {
    let mut seen = HashSet::new();
    snapshot
        .windows
        .iter()
        .filter(|w| {
            let fresh = seen.insert(w.volatile_id);
            if !fresh {
                warn!(volatile_id = w.volatile_id, "window enumerated twice, ignoring repeat");
            }
            fresh
        })
        .collect()
}

fn dedupe_tabs(snapshot: &LiveSnapshot) -> Vec<&TabSnapshot> {
    let mut seen = HashSet::new();
    snapshot
        .windows
        .iter()
        .flat_map(|w| w.tabs.iter())
        .filter(|t| {
            let fresh = seen.insert(t.volatile_id);
            if !fresh {
                warn!(volatile_id = t.volatile_id, "tab enumerated twice, ignoring repeat");
            }
            fresh
        })
        .collect()
}

/// Hard delete closed records shadowed by a more recently active closed
/// record with the same fingerprint. Live records are never touched, so a
/// second run finds nothing.
#[instrument(skip(ctx))]
pub fn compact_closed_duplicates(ctx: &TrailContext) -> Result<usize> {
    let tabs = TabRepo::new(ctx.db.clone());
    let windows = WindowRepo::new(ctx.db.clone());

    let tab_ids = tabs.closed_duplicates()?;
    let window_ids = windows.closed_duplicates()?;

    let removed = tabs.delete_many(&tab_ids)? + windows.delete_many(&window_ids)?;
    forget(ctx, &tab_ids, &window_ids);
    if removed > 0 {
        info!(tabs = tab_ids.len(), windows = window_ids.len(), "closed duplicates compacted");
    }
    Ok(removed)
}

/// Drop every in-memory trace of hard-deleted objects.
pub(crate) fn forget(ctx: &TrailContext, tab_ids: &[TabId], window_ids: &[WindowId]) {
    let keys: Vec<ObjectRef> = tab_ids
        .iter()
        .cloned()
        .map(ObjectRef::Tab)
        .chain(window_ids.iter().cloned().map(ObjectRef::Window))
        .collect();
    ctx.queue.discard(&keys);
    let mut cache = ctx.cache.lock();
    for id in tab_ids {
        cache.forget_tab(id);
    }
    for id in window_ids {
        cache.forget_window(id);
    }
}

fn check_postconditions(ctx: &TrailContext, snapshot: &LiveSnapshot, report: &mut ReconcileReport) -> Result<()> {
    let tabs = TabRepo::new(ctx.db.clone());
    let windows = WindowRepo::new(ctx.db.clone());

    let live_tabs = tabs.count_live()?;
    let expected_tabs = dedupe_tabs(snapshot).len() as i64;
    if live_tabs != expected_tabs {
        report
            .warnings
            .push(format!("live tab count {live_tabs} differs from enumerated {expected_tabs}"));
    }
    let live_windows = windows.count_live()?;
    let expected_windows = dedupe_windows(snapshot).len() as i64;
    if live_windows != expected_windows {
        report
            .warnings
            .push(format!("live window count {live_windows} differs from enumerated {expected_windows}"));
    }

    let mut seen = HashSet::new();
    for tab in tabs.list_live()? {
        if !seen.insert(tab.tracking.volatile_id) {
            report
                .warnings
                .push(format!("volatile id {} held by more than one live tab", tab.tracking.volatile_id));
        }
    }

    for w in &report.warnings {
        warn!(warning = %w, "reconciliation post-condition failed");
    }
    Ok(())
}
