use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::instrument;

use trail_core::clock::to_millis;
use trail_core::fingerprint::Fingerprint;
use trail_core::ids::{SessionId, TabId, VolatileId, WindowId};
use trail_core::model::TabRecord;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, millis_opt, TRACKING_COLUMNS};

fn select_tabs() -> String {
    format!("SELECT id, {TRACKING_COLUMNS}, window_id, opener_id, url, title, idx, pinned FROM tabs")
}

pub struct TabRepo {
    db: Database,
}

impl TabRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a freshly minted tab.
    #[instrument(skip(self, tab), fields(tab_id = %tab.id, volatile_id = tab.tracking.volatile_id))]
    pub fn insert(&self, tab: &TabRecord) -> Result<(), StoreError> {
        self.db.with_conn(|conn| insert_tab(conn, tab))
    }

    /// Write every column of an existing tab (used for resurrection and claims).
    #[instrument(skip(self, tab), fields(tab_id = %tab.id))]
    pub fn replace(&self, tab: &TabRecord) -> Result<(), StoreError> {
        self.db.with_conn(|conn| replace_tab(conn, tab))
    }

    #[instrument(skip(self), fields(tab_id = %id))]
    pub fn find(&self, id: &TabId) -> Result<Option<TabRecord>, StoreError> {
        self.db.with_conn(|conn| find_tab(conn, id))
    }

    pub fn get(&self, id: &TabId) -> Result<TabRecord, StoreError> {
        self.find(id)?
            .ok_or_else(|| StoreError::NotFound(format!("tab {id}")))
    }

    /// The live tab currently holding a volatile id, if any.
    #[instrument(skip(self))]
    pub fn find_live_by_volatile(&self, volatile_id: VolatileId) -> Result<Option<TabRecord>, StoreError> {
        let mut found = self.query(
            &format!("{} WHERE volatile_id = ?1 AND closed_at IS NULL", select_tabs()),
            &[&volatile_id],
        )?;
        Ok(found.pop())
    }

    #[instrument(skip(self))]
    pub fn list_live(&self) -> Result<Vec<TabRecord>, StoreError> {
        self.query(
            &format!("{} WHERE closed_at IS NULL ORDER BY created_at, id", select_tabs()),
            &[],
        )
    }

    #[instrument(skip(self), fields(window_id = %window_id))]
    pub fn list_live_in_window(&self, window_id: &WindowId) -> Result<Vec<TabRecord>, StoreError> {
        self.query(
            &format!(
                "{} WHERE window_id = ?1 AND closed_at IS NULL ORDER BY idx, created_at",
                select_tabs()
            ),
            &[&window_id.as_str()],
        )
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_by_session(&self, session_id: &SessionId) -> Result<Vec<TabRecord>, StoreError> {
        self.query(
            &format!("{} WHERE session_id = ?1 ORDER BY created_at, id", select_tabs()),
            &[&session_id.as_str()],
        )
    }

    /// Tabs created at or after `since`, oldest first.
    #[instrument(skip(self))]
    pub fn list_created_since(&self, since: DateTime<Utc>) -> Result<Vec<TabRecord>, StoreError> {
        self.query(
            &format!("{} WHERE created_at >= ?1 ORDER BY created_at, id", select_tabs()),
            &[&to_millis(since)],
        )
    }

    /// Tabs whose opener is `id`.
    #[instrument(skip(self), fields(tab_id = %id))]
    pub fn list_children(&self, id: &TabId) -> Result<Vec<TabRecord>, StoreError> {
        self.query(
            &format!("{} WHERE opener_id = ?1 ORDER BY created_at, id", select_tabs()),
            &[&id.as_str()],
        )
    }

    /// Most recently active closed tab with this fingerprint, closed at or after `closed_since`.
    /// Live tabs are never candidates.
    #[instrument(skip(self, fingerprint))]
    pub fn find_resurrection_candidate(
        &self,
        fingerprint: &Fingerprint,
        closed_since: DateTime<Utc>,
    ) -> Result<Option<TabRecord>, StoreError> {
        let mut found = self.query(
            &format!(
                "{} WHERE fingerprint = ?1 AND closed_at IS NOT NULL AND closed_at >= ?2
                 ORDER BY last_active_at DESC, closed_at DESC, id DESC LIMIT 1",
                select_tabs()
            ),
            &[&fingerprint.as_str(), &to_millis(closed_since)],
        )?;
        Ok(found.pop())
    }

    /// Case-insensitive substring search over title and URL.
    #[instrument(skip(self))]
    pub fn search(&self, needle: &str, limit: u32) -> Result<Vec<TabRecord>, StoreError> {
        let pattern = format!("%{}%", row_helpers::escape_like(needle));
        self.query(
            &format!(
                "{} WHERE title LIKE ?1 ESCAPE '\\' OR url LIKE ?1 ESCAPE '\\'
                 ORDER BY last_active_at DESC LIMIT ?2",
                select_tabs()
            ),
            &[&pattern, &limit],
        )
    }

    /// Soft delete. Returns false if the tab was already closed or is unknown.
    #[instrument(skip(self), fields(tab_id = %id))]
    pub fn close(&self, id: &TabId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE tabs SET closed_at = ?1 WHERE id = ?2 AND closed_at IS NULL",
                rusqlite::params![to_millis(at), id.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    /// Close every live tab. Used when a full enumeration replaces what the
    /// store believes is open.
    #[instrument(skip(self))]
    pub fn close_all_live(&self, at: DateTime<Utc>) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE tabs SET closed_at = ?1 WHERE closed_at IS NULL",
                [to_millis(at)],
            )?)
        })
    }

    /// Close every live tab in a window.
    #[instrument(skip(self), fields(window_id = %window_id))]
    pub fn close_in_window(&self, window_id: &WindowId, at: DateTime<Utc>) -> Result<Vec<TabId>, StoreError> {
        self.db.with_tx(|conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM tabs WHERE window_id = ?1 AND closed_at IS NULL")?;
            let ids = stmt
                .query_map([window_id.as_str()], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            conn.execute(
                "UPDATE tabs SET closed_at = ?1 WHERE window_id = ?2 AND closed_at IS NULL",
                rusqlite::params![to_millis(at), window_id.as_str()],
            )?;
            Ok(ids.into_iter().map(TabId::from_raw).collect())
        })
    }

    /// Ids of closed tabs that share a fingerprint with a more recently active
    /// closed tab. Live tabs are never included.
    #[instrument(skip(self))]
    pub fn closed_duplicates(&self) -> Result<Vec<TabId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM (
                     SELECT id, ROW_NUMBER() OVER (
                         PARTITION BY fingerprint ORDER BY last_active_at DESC, id DESC
                     ) AS rn
                     FROM tabs
                     WHERE closed_at IS NOT NULL AND fingerprint IS NOT NULL
                 ) WHERE rn > 1",
            )?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids.into_iter().map(TabId::from_raw).collect())
        })
    }

    /// Closed tabs closed before `cutoff` that do not belong to a saved session.
    #[instrument(skip(self))]
    pub fn list_stale_closed(&self, cutoff: DateTime<Utc>) -> Result<Vec<TabId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT t.id FROM tabs t JOIN sessions s ON s.id = t.session_id
                 WHERE t.closed_at IS NOT NULL AND t.closed_at < ?1 AND s.is_saved = 0",
            )?;
            let ids = stmt
                .query_map([to_millis(cutoff)], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids.into_iter().map(TabId::from_raw).collect())
        })
    }

    /// Hard delete tabs together with their intervals and edges.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub fn delete_many(&self, ids: &[TabId]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.db.with_tx(|conn| delete_ids(conn, ids))
    }

    /// Update user-authored fields. Returns false for an unknown tab.
    #[instrument(skip(self, tags, notes), fields(tab_id = %id))]
    pub fn update_user_fields(
        &self,
        id: &TabId,
        tags: Option<&[String]>,
        notes: Option<Option<&str>>,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| update_user_fields(conn, "tabs", id.as_str(), tags, notes))
    }

    #[instrument(skip(self))]
    pub fn count_live(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM tabs WHERE closed_at IS NULL", [], |r| r.get(0))?)
        })
    }

    fn query(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::types::ToSql],
    ) -> Result<Vec<TabRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params)?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_tab(row)?);
            }
            Ok(results)
        })
    }
}

pub(crate) fn find_tab(conn: &Connection, id: &TabId) -> Result<Option<TabRecord>, StoreError> {
    let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", select_tabs()))?;
    let mut rows = stmt.query([id.as_str()])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_tab(row)?)),
        None => Ok(None),
    }
}

fn insert_tab(conn: &Connection, tab: &TabRecord) -> Result<(), StoreError> {
    let t = &tab.tracking;
    conn.execute(
        "INSERT INTO tabs (id, volatile_id, fingerprint, session_id, created_at, last_active_at,
                           active_duration_ms, closed_at, tags, notes, metadata,
                           window_id, opener_id, url, title, idx, pinned)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        rusqlite::params![
            tab.id.as_str(),
            t.volatile_id,
            t.fingerprint.as_ref().map(|f| f.as_str()),
            t.session_id.as_str(),
            to_millis(t.created_at),
            to_millis(t.last_active_at),
            t.active_duration_ms,
            millis_opt(t.closed_at),
            serde_json::to_string(&t.tags)?,
            t.notes,
            serde_json::to_string(&t.metadata)?,
            tab.window_id.as_ref().map(|w| w.as_str()),
            tab.opener_id.as_ref().map(|o| o.as_str()),
            tab.url,
            tab.title,
            tab.index,
            tab.pinned,
        ],
    )?;
    Ok(())
}

fn replace_tab(conn: &Connection, tab: &TabRecord) -> Result<(), StoreError> {
    let t = &tab.tracking;
    let n = conn.execute(
        "UPDATE tabs SET volatile_id = ?2, fingerprint = ?3, session_id = ?4, created_at = ?5,
                last_active_at = ?6, active_duration_ms = ?7, closed_at = ?8, tags = ?9,
                notes = ?10, metadata = ?11, window_id = ?12, opener_id = ?13, url = ?14,
                title = ?15, idx = ?16, pinned = ?17
         WHERE id = ?1",
        rusqlite::params![
            tab.id.as_str(),
            t.volatile_id,
            t.fingerprint.as_ref().map(|f| f.as_str()),
            t.session_id.as_str(),
            to_millis(t.created_at),
            to_millis(t.last_active_at),
            t.active_duration_ms,
            millis_opt(t.closed_at),
            serde_json::to_string(&t.tags)?,
            t.notes,
            serde_json::to_string(&t.metadata)?,
            tab.window_id.as_ref().map(|w| w.as_str()),
            tab.opener_id.as_ref().map(|o| o.as_str()),
            tab.url,
            tab.title,
            tab.index,
            tab.pinned,
        ],
    )?;
    if n == 0 {
        return Err(StoreError::NotFound(format!("tab {}", tab.id)));
    }
    Ok(())
}

/// Bulk upsert of the runtime-owned columns. User-authored fields, session
/// ownership and `closed_at` are structural and never touched here, so a
/// queued write can not undo a close or a metadata edit.
pub fn upsert_volatile_many(conn: &Connection, tabs: &[TabRecord]) -> Result<usize, StoreError> {
    let mut stmt = conn.prepare(
        "INSERT INTO tabs (id, volatile_id, fingerprint, session_id, created_at, last_active_at,
                           active_duration_ms, closed_at, tags, notes, metadata,
                           window_id, opener_id, url, title, idx, pinned)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
         ON CONFLICT(id) DO UPDATE SET
             volatile_id = excluded.volatile_id,
             fingerprint = excluded.fingerprint,
             last_active_at = MAX(tabs.last_active_at, excluded.last_active_at),
             active_duration_ms = MAX(tabs.active_duration_ms, excluded.active_duration_ms),
             window_id = excluded.window_id,
             url = excluded.url,
             title = excluded.title,
             idx = excluded.idx,
             pinned = excluded.pinned",
    )?;
    let mut n = 0;
    for tab in tabs {
        let t = &tab.tracking;
        n += stmt.execute(rusqlite::params![
            tab.id.as_str(),
            t.volatile_id,
            t.fingerprint.as_ref().map(|f| f.as_str()),
            t.session_id.as_str(),
            to_millis(t.created_at),
            to_millis(t.last_active_at),
            t.active_duration_ms,
            millis_opt(t.closed_at),
            serde_json::to_string(&t.tags)?,
            t.notes,
            serde_json::to_string(&t.metadata)?,
            tab.window_id.as_ref().map(|w| w.as_str()),
            tab.opener_id.as_ref().map(|o| o.as_str()),
            tab.url,
            tab.title,
            tab.index,
            tab.pinned,
        ])?;
    }
    Ok(n)
}

/// Delete tab rows plus their visits, focus intervals and edges. Callers
/// provide the transaction.
pub fn delete_ids(conn: &Connection, ids: &[TabId]) -> Result<usize, StoreError> {
    let mut edges = conn.prepare("DELETE FROM relationships WHERE source_id = ?1 OR target_id = ?1")?;
    let mut visits = conn.prepare("DELETE FROM visits WHERE owner_id = ?1")?;
    let mut focus = conn.prepare("DELETE FROM focus_events WHERE owner_id = ?1")?;
    let mut tabs = conn.prepare("DELETE FROM tabs WHERE id = ?1")?;
    let mut n = 0;
    for id in ids {
        edges.execute([id.as_str()])?;
        visits.execute([id.as_str()])?;
        focus.execute([id.as_str()])?;
        n += tabs.execute([id.as_str()])?;
    }
    Ok(n)
}

/// Shared by tabs and windows: tags/notes are user-authored, so they bypass
/// the write queue and land with a keyed conditional update.
pub(crate) fn update_user_fields(
    conn: &Connection,
    table: &'static str,
    id: &str,
    tags: Option<&[String]>,
    notes: Option<Option<&str>>,
) -> Result<bool, StoreError> {
    let mut changed = true;
    if let Some(tags) = tags {
        changed = conn.execute(
            &format!("UPDATE {table} SET tags = ?1 WHERE id = ?2"),
            rusqlite::params![serde_json::to_string(tags)?, id],
        )? > 0;
    }
    if let Some(notes) = notes {
        changed = conn.execute(
            &format!("UPDATE {table} SET notes = ?1 WHERE id = ?2"),
            rusqlite::params![notes, id],
        )? > 0;
    }
    if tags.is_none() && notes.is_none() {
        changed = conn
            .query_row(&format!("SELECT 1 FROM {table} WHERE id = ?1"), [id], |_| Ok(()))
            .map(|_| true)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(false),
                other => Err(other),
            })?;
    }
    Ok(changed)
}

fn row_to_tab(row: &rusqlite::Row<'_>) -> Result<TabRecord, StoreError> {
    Ok(TabRecord {
        id: TabId::from_raw(row_helpers::get::<String>(row, 0, "tabs", "id")?),
        tracking: row_helpers::read_tracking(row, 1, "tabs")?,
        window_id: row_helpers::get_opt::<String>(row, 11, "tabs", "window_id")?.map(WindowId::from_raw),
        opener_id: row_helpers::get_opt::<String>(row, 12, "tabs", "opener_id")?.map(TabId::from_raw),
        url: row_helpers::get(row, 13, "tabs", "url")?,
        title: row_helpers::get(row, 14, "tabs", "title")?,
        index: row_helpers::get(row, 15, "tabs", "idx")?,
        pinned: row_helpers::get(row, 16, "tabs", "pinned")?,
    })
}
