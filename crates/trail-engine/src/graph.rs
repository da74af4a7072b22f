//! Relationship graph between tabs.
//!
//! Structural edges (opener, sibling) are written once when a tab appears
//! and never decay. Temporal edges link tabs created close together; they
//! are recomputed periodically and pruned once weaker than the threshold.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::{debug, instrument};

use trail_core::clock::Clock;
use trail_core::ids::{SessionId, TabId, WindowId};
use trail_core::model::{EdgeKind, RelationshipEdge};
use trail_store::relationships::{edge, RelationshipRepo};
use trail_store::tabs::TabRepo;
use trail_store::Database;

use crate::error::Result;
use crate::write_queue::WriteQueue;

/// Opener chains longer than this are cut off.
const MAX_OPENER_DEPTH: usize = 64;

/// Linear decay: 1.0 at zero, exactly 0.0 at and beyond `window`.
pub fn calculate_strength(dt: Duration, window: Duration) -> f64 {
    let window_ms = window.num_milliseconds();
    if window_ms <= 0 {
        return 0.0;
    }
    let dt_ms = dt.num_milliseconds().abs();
    if dt_ms >= window_ms {
        return 0.0;
    }
    1.0 - dt_ms as f64 / window_ms as f64
}

#[derive(Clone, Debug)]
pub struct GraphConfig {
    pub sibling_strength: f64,
    pub temporal_window: Duration,
    pub temporal_horizon: Duration,
    pub prune_threshold: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedTab {
    pub id: TabId,
    pub strength: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationships {
    /// Nearest opener first.
    pub opener_chain: Vec<TabId>,
    pub children: Vec<TabId>,
    pub siblings: Vec<RelatedTab>,
    pub temporally_related: Vec<RelatedTab>,
}

pub struct GraphBuilder {
    db: Database,
    clock: Arc<dyn Clock>,
    config: GraphConfig,
    queue: Option<Arc<WriteQueue>>,
}

impl GraphBuilder {
    pub fn new(db: Database, clock: Arc<dyn Clock>, config: GraphConfig) -> Self {
        Self {
            db,
            clock,
            config,
            queue: None,
        }
    }

    /// Read tab placement through `queue`, so moves not yet flushed count.
    pub fn with_queue(mut self, queue: Arc<WriteQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    fn edges(&self) -> RelationshipRepo {
        RelationshipRepo::new(self.db.clone())
    }

    /// Record that `opener_id` opened `new_id`.
    #[instrument(skip(self), fields(tab_id = %new_id, opener_id = %opener_id))]
    pub fn opener(&self, new_id: &TabId, opener_id: &TabId) -> Result<bool> {
        if new_id == opener_id {
            return Ok(false);
        }
        let e = edge(opener_id.clone(), new_id.clone(), EdgeKind::Opener, 1.0, self.clock.now());
        Ok(self.edges().insert_if_absent(&e)?)
    }

    /// Link a new tab to every other live tab of its window and session.
    #[instrument(skip(self), fields(tab_id = %new_id))]
    pub fn siblings(&self, new_id: &TabId, session_id: &SessionId, window_id: &WindowId) -> Result<usize> {
        let now = self.clock.now();
        let edges: Vec<RelationshipEdge> = TabRepo::new(self.db.clone())
            .list_live()?
            .into_iter()
            .map(|t| match &self.queue {
                Some(queue) => queue.overlay_tab(t),
                None => t,
            })
            .filter(|t| t.window_id.as_ref() == Some(window_id))
            .filter(|t| t.id != *new_id && t.tracking.session_id == *session_id)
            .map(|t| edge(new_id.clone(), t.id, EdgeKind::Sibling, self.config.sibling_strength, now))
            .collect();
        Ok(self.edges().insert_many_if_absent(&edges)?)
    }

    /// Link tabs created within the temporal window of each other, over the
    /// recent horizon. Returns how many edges were new.
    #[instrument(skip(self))]
    pub fn recompute_temporal(&self) -> Result<usize> {
        let now = self.clock.now();
        let tabs = TabRepo::new(self.db.clone()).list_created_since(now - self.config.temporal_horizon)?;

        let mut edges = Vec::new();
        for (i, earlier) in tabs.iter().enumerate() {
            for later in &tabs[i + 1..] {
                let dt = later.tracking.created_at - earlier.tracking.created_at;
                if dt >= self.config.temporal_window {
                    break;
                }
                let strength = calculate_strength(dt, self.config.temporal_window);
                // Anything weaker would be pruned on the same tick.
                if strength > 0.0 && strength >= self.config.prune_threshold {
                    edges.push(edge(earlier.id.clone(), later.id.clone(), EdgeKind::Temporal, strength, now));
                }
            }
        }
        let inserted = self.edges().insert_many_if_absent(&edges)?;
        debug!(candidates = edges.len(), inserted, "temporal edges recomputed");
        Ok(inserted)
    }

    /// Drop temporal edges below the threshold.
    #[instrument(skip(self))]
    pub fn prune(&self) -> Result<usize> {
        Ok(self.edges().prune_temporal_below(self.config.prune_threshold)?)
    }

    #[instrument(skip(self), fields(tab_id = %id))]
    pub fn relationships(&self, id: &TabId) -> Result<Relationships> {
        let tabs = TabRepo::new(self.db.clone());

        let mut opener_chain = Vec::new();
        let mut seen = HashSet::from([id.clone()]);
        let mut cursor = tabs.find(id)?.and_then(|t| t.opener_id);
        while let Some(opener) = cursor {
            if opener_chain.len() >= MAX_OPENER_DEPTH || !seen.insert(opener.clone()) {
                break;
            }
            cursor = tabs.find(&opener)?.and_then(|t| t.opener_id);
            opener_chain.push(opener);
        }

        let children = tabs.list_children(id)?.into_iter().map(|t| t.id).collect();

        let related = |kind| -> Result<Vec<RelatedTab>> {
            Ok(self
                .edges()
                .list_for(id, Some(kind))?
                .into_iter()
                .map(|e| RelatedTab {
                    id: if e.source_id == *id { e.target_id } else { e.source_id },
                    strength: e.strength,
                })
                .collect())
        };

        Ok(Relationships {
            opener_chain,
            children,
            siblings: related(EdgeKind::Sibling)?,
            temporally_related: related(EdgeKind::Temporal)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trail_core::clock::{from_millis, ManualClock};
    use trail_core::model::{TabRecord, Tracking};
    use trail_store::sessions::SessionRepo;

    fn config() -> GraphConfig {
        GraphConfig {
            sibling_strength: 0.5,
            temporal_window: Duration::minutes(10),
            temporal_horizon: Duration::hours(1),
            prune_threshold: 0.2,
        }
    }

    fn setup() -> (Database, Arc<ManualClock>, GraphBuilder, SessionId) {
        let db = Database::in_memory().unwrap();
        let clock = Arc::new(ManualClock::at_epoch_millis(10 * 60 * 60 * 1000));
        let session = SessionRepo::new(db.clone()).create(from_millis(0), None).unwrap();
        let graph = GraphBuilder::new(db.clone(), clock.clone(), config());
        (db, clock, graph, session.id)
    }

    fn tab(db: &Database, session: &SessionId, volatile_id: i64, created_ms_ago: i64, clock: &ManualClock) -> TabRecord {
        let t = TabRecord {
            id: TabId::new(),
            tracking: Tracking::new(
                volatile_id,
                None,
                session.clone(),
                clock.now() - Duration::milliseconds(created_ms_ago),
            ),
            window_id: None,
            opener_id: None,
            url: format!("https://example.com/{volatile_id}"),
            title: String::new(),
            index: 0,
            pinned: false,
        };
        TabRepo::new(db.clone()).insert(&t).unwrap();
        t
    }

    #[test]
    fn strength_is_linear_and_hits_zero_at_window() {
        let w = Duration::minutes(10);
        assert_eq!(calculate_strength(Duration::zero(), w), 1.0);
        assert!((calculate_strength(Duration::minutes(5), w) - 0.5).abs() < 1e-9);
        assert_eq!(calculate_strength(w, w), 0.0);
        assert_eq!(calculate_strength(Duration::minutes(11), w), 0.0);
        assert_eq!(calculate_strength(Duration::minutes(1), Duration::zero()), 0.0);
    }

    #[test]
    fn strength_is_monotonically_decreasing() {
        let w = Duration::minutes(10);
        let mut prev = f64::INFINITY;
        for s in 0..=700 {
            let v = calculate_strength(Duration::seconds(s), w);
            assert!(v <= prev, "strength rose at {s}s");
            assert!((0.0..=1.0).contains(&v));
            prev = v;
        }
    }

    #[test]
    fn opener_edge_is_full_strength_and_idempotent() {
        let (db, clock, graph, sid) = setup();
        let parent = tab(&db, &sid, 1, 0, &clock);
        let child = tab(&db, &sid, 2, 0, &clock);
        assert!(graph.opener(&child.id, &parent.id).unwrap());
        assert!(!graph.opener(&child.id, &parent.id).unwrap());
        assert!(!graph.opener(&child.id, &child.id).unwrap());

        let edges = RelationshipRepo::new(db).list_for(&child.id, Some(EdgeKind::Opener)).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].strength, 1.0);
        assert_eq!(edges[0].source_id, parent.id);
    }

    #[test]
    fn siblings_link_live_tabs_in_window() {
        let (db, clock, graph, sid) = setup();
        let window = WindowId::new();
        let repo = TabRepo::new(db.clone());
        let mut ids = Vec::new();
        for v in 1..=3 {
            let mut t = tab(&db, &sid, v, 0, &clock);
            t.window_id = Some(window.clone());
            repo.replace(&t).unwrap();
            ids.push(t.id);
        }
        repo.close(&ids[1], clock.now()).unwrap();

        assert_eq!(graph.siblings(&ids[2], &sid, &window).unwrap(), 1);
        let rel = graph.relationships(&ids[2]).unwrap();
        assert_eq!(rel.siblings, vec![RelatedTab { id: ids[0].clone(), strength: 0.5 }]);
    }

    #[test]
    fn temporal_edges_follow_creation_gaps() {
        let (db, clock, graph, sid) = setup();
        let a = tab(&db, &sid, 1, 30 * 60 * 1000, &clock);
        let b = tab(&db, &sid, 2, 25 * 60 * 1000, &clock);
        let _far = tab(&db, &sid, 3, 5 * 60 * 1000, &clock);
        let _stale = tab(&db, &sid, 4, 2 * 60 * 60 * 1000, &clock);

        assert_eq!(graph.recompute_temporal().unwrap(), 1);
        let rel = graph.relationships(&a.id).unwrap();
        assert_eq!(rel.temporally_related.len(), 1);
        assert_eq!(rel.temporally_related[0].id, b.id);
        assert!((rel.temporally_related[0].strength - 0.5).abs() < 1e-9);

        assert_eq!(graph.recompute_temporal().unwrap(), 0);
    }

    #[test]
    fn temporal_pairs_below_prune_threshold_are_not_written() {
        let (db, clock, graph, sid) = setup();
        let a = tab(&db, &sid, 1, 30 * 60 * 1000, &clock);
        let _b = tab(&db, &sid, 2, 21 * 60 * 1000, &clock);

        assert_eq!(graph.recompute_temporal().unwrap(), 0);
        assert!(graph.relationships(&a.id).unwrap().temporally_related.is_empty());
        assert_eq!(graph.prune().unwrap(), 0);
    }

    #[test]
    fn siblings_follow_queued_moves() {
        let (db, clock, graph, sid) = setup();
        let window = WindowId::new();
        let other = WindowId::new();
        let repo = TabRepo::new(db.clone());
        let queue = WriteQueue::new(
            db.clone(),
            crate::write_queue::QueueConfig {
                flush_delay: std::time::Duration::from_secs(60),
                max_pending: 100,
            },
        );
        let graph = graph.with_queue(Arc::clone(&queue));

        let mut staying = tab(&db, &sid, 1, 0, &clock);
        staying.window_id = Some(window.clone());
        repo.replace(&staying).unwrap();
        let mut leaving = tab(&db, &sid, 2, 0, &clock);
        leaving.window_id = Some(window.clone());
        repo.replace(&leaving).unwrap();
        let mut arriving = tab(&db, &sid, 3, 0, &clock);
        arriving.window_id = Some(other.clone());
        repo.replace(&arriving).unwrap();
        let mut fresh = tab(&db, &sid, 4, 0, &clock);
        fresh.window_id = Some(window.clone());
        repo.replace(&fresh).unwrap();

        queue.modify_tab(&leaving.id, |t| t.window_id = Some(other.clone())).unwrap();
        queue.modify_tab(&arriving.id, |t| t.window_id = Some(window.clone())).unwrap();

        assert_eq!(graph.siblings(&fresh.id, &sid, &window).unwrap(), 2);
        let mut linked: Vec<TabId> = graph
            .relationships(&fresh.id)
            .unwrap()
            .siblings
            .into_iter()
            .map(|r| r.id)
            .collect();
        linked.sort();
        let mut expected = vec![staying.id, arriving.id];
        expected.sort();
        assert_eq!(linked, expected);
    }

    #[test]
    fn prune_spares_structural_edges() {
        let (db, clock, graph, sid) = setup();
        let a = tab(&db, &sid, 1, 0, &clock);
        let b = tab(&db, &sid, 2, 0, &clock);
        let repo = RelationshipRepo::new(db);
        repo.insert_if_absent(&edge(a.id.clone(), b.id.clone(), EdgeKind::Temporal, 0.19, clock.now()))
            .unwrap();
        repo.insert_if_absent(&edge(a.id.clone(), b.id.clone(), EdgeKind::Opener, 1.0, clock.now()))
            .unwrap();

        assert_eq!(graph.prune().unwrap(), 1);
        assert_eq!(repo.count(Some(EdgeKind::Temporal)).unwrap(), 0);
        assert_eq!(repo.count(Some(EdgeKind::Opener)).unwrap(), 1);
    }

    #[test]
    fn opener_chain_walks_up_and_survives_cycles() {
        let (db, clock, graph, sid) = setup();
        let repo = TabRepo::new(db.clone());
        let root = tab(&db, &sid, 1, 0, &clock);
        let mut mid = tab(&db, &sid, 2, 0, &clock);
        let mut leaf = tab(&db, &sid, 3, 0, &clock);
        mid.opener_id = Some(root.id.clone());
        leaf.opener_id = Some(mid.id.clone());
        repo.replace(&mid).unwrap();
        repo.replace(&leaf).unwrap();

        let rel = graph.relationships(&leaf.id).unwrap();
        assert_eq!(rel.opener_chain, vec![mid.id.clone(), root.id.clone()]);
        assert_eq!(graph.relationships(&root.id).unwrap().children, vec![mid.id.clone()]);

        let mut root = root;
        root.opener_id = Some(leaf.id.clone());
        repo.replace(&root).unwrap();
        let rel = graph.relationships(&leaf.id).unwrap();
        assert_eq!(rel.opener_chain.len(), 2);
    }
}
