use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::instrument;

use trail_core::clock::to_millis;
use trail_core::ids::TabId;
use trail_core::model::{EdgeKind, RelationshipEdge};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const EDGE_COLUMNS: &str = "source_id, target_id, kind, strength, created_at, metadata";

pub struct RelationshipRepo {
    db: Database,
}

impl RelationshipRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert an edge unless the same (source, target, kind) already exists.
    /// Returns whether a row was written.
    #[instrument(skip(self, edge), fields(source = %edge.source_id, target = %edge.target_id, kind = %edge.kind))]
    pub fn insert_if_absent(&self, edge: &RelationshipEdge) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| Ok(insert_edge(conn, edge)? > 0))
    }

    /// Batch variant in one transaction. Returns how many edges were new.
    #[instrument(skip(self, edges), fields(count = edges.len()))]
    pub fn insert_many_if_absent(&self, edges: &[RelationshipEdge]) -> Result<usize, StoreError> {
        if edges.is_empty() {
            return Ok(0);
        }
        self.db.with_tx(|conn| {
            let mut n = 0;
            for edge in edges {
                n += insert_edge(conn, edge)?;
            }
            Ok(n)
        })
    }

    /// Edges touching `id` in either direction, optionally of one kind.
    #[instrument(skip(self), fields(tab_id = %id))]
    pub fn list_for(&self, id: &TabId, kind: Option<EdgeKind>) -> Result<Vec<RelationshipEdge>, StoreError> {
        self.db.with_conn(|conn| {
            let kind = kind.map(|k| k.to_string());
            let mut stmt = conn.prepare(&format!(
                "SELECT {EDGE_COLUMNS} FROM relationships
                 WHERE (source_id = ?1 OR target_id = ?1) AND (?2 IS NULL OR kind = ?2)
                 ORDER BY strength DESC, created_at DESC"
            ))?;
            let mut rows = stmt.query(rusqlite::params![id.as_str(), kind])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_edge(row)?);
            }
            Ok(out)
        })
    }

    /// Drop temporal edges weaker than `threshold`. Structural edges never decay.
    #[instrument(skip(self))]
    pub fn prune_temporal_below(&self, threshold: f64) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM relationships WHERE kind = ?1 AND strength < ?2",
                rusqlite::params![EdgeKind::Temporal.to_string(), threshold],
            )?)
        })
    }

    #[instrument(skip(self))]
    pub fn count(&self, kind: Option<EdgeKind>) -> Result<i64, StoreError> {
        let kind = kind.map(|k| k.to_string());
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM relationships WHERE ?1 IS NULL OR kind = ?1",
                [kind],
                |row| row.get(0),
            )?)
        })
    }
}

fn insert_edge(conn: &Connection, edge: &RelationshipEdge) -> Result<usize, StoreError> {
    Ok(conn.execute(
        "INSERT OR IGNORE INTO relationships (source_id, target_id, kind, strength, created_at, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            edge.source_id.as_str(),
            edge.target_id.as_str(),
            edge.kind.to_string(),
            edge.strength,
            to_millis(edge.created_at),
            serde_json::to_string(&edge.metadata)?,
        ],
    )?)
}

fn row_to_edge(row: &rusqlite::Row<'_>) -> Result<RelationshipEdge, StoreError> {
    let kind: String = row_helpers::get(row, 2, "relationships", "kind")?;
    let metadata: String = row_helpers::get(row, 5, "relationships", "metadata")?;
    Ok(RelationshipEdge {
        source_id: TabId::from_raw(row_helpers::get::<String>(row, 0, "relationships", "source_id")?),
        target_id: TabId::from_raw(row_helpers::get::<String>(row, 1, "relationships", "target_id")?),
        kind: row_helpers::parse_enum(&kind, "relationships", "kind")?,
        strength: row_helpers::get(row, 3, "relationships", "strength")?,
        created_at: row_helpers::get_time(row, 4, "relationships", "created_at")?,
        metadata: row_helpers::parse_json(&metadata, "relationships", "metadata")?,
    })
}

/// Convenience constructor for edges without metadata.
pub fn edge(
    source_id: TabId,
    target_id: TabId,
    kind: EdgeKind,
    strength: f64,
    created_at: DateTime<Utc>,
) -> RelationshipEdge {
    RelationshipEdge {
        source_id,
        target_id,
        kind,
        strength,
        created_at,
        metadata: serde_json::json!({}),
    }
}
