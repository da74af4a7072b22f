use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::instrument;

use trail_core::clock::to_millis;
use trail_core::fingerprint::Fingerprint;
use trail_core::ids::{SessionId, VolatileId, WindowId};
use trail_core::model::WindowRecord;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, millis_opt, TRACKING_COLUMNS};
use crate::tabs::update_user_fields;

fn select_windows() -> String {
    format!("SELECT id, {TRACKING_COLUMNS}, kind, focused FROM windows")
}

pub struct WindowRepo {
    db: Database,
}

impl WindowRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, window), fields(window_id = %window.id, volatile_id = window.tracking.volatile_id))]
    pub fn insert(&self, window: &WindowRecord) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let t = &window.tracking;
            conn.execute(
                "INSERT INTO windows (id, volatile_id, fingerprint, session_id, created_at,
                                      last_active_at, active_duration_ms, closed_at, tags, notes,
                                      metadata, kind, focused)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                rusqlite::params![
                    window.id.as_str(),
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
                    window.kind.to_string(),
                    window.focused,
                ],
            )?;
            Ok(())
        })
    }

    /// Write every column of an existing window.
    #[instrument(skip(self, window), fields(window_id = %window.id))]
    pub fn replace(&self, window: &WindowRecord) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let t = &window.tracking;
            let n = conn.execute(
                "UPDATE windows SET volatile_id = ?2, fingerprint = ?3, session_id = ?4,
                        created_at = ?5, last_active_at = ?6, active_duration_ms = ?7,
                        closed_at = ?8, tags = ?9, notes = ?10, metadata = ?11, kind = ?12,
                        focused = ?13
                 WHERE id = ?1",
                rusqlite::params![
                    window.id.as_str(),
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
                    window.kind.to_string(),
                    window.focused,
                ],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(format!("window {}", window.id)));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(window_id = %id))]
    pub fn find(&self, id: &WindowId) -> Result<Option<WindowRecord>, StoreError> {
        let mut found = self.query(&format!("{} WHERE id = ?1", select_windows()), &[&id.as_str()])?;
        Ok(found.pop())
    }

    pub fn get(&self, id: &WindowId) -> Result<WindowRecord, StoreError> {
        self.find(id)?
            .ok_or_else(|| StoreError::NotFound(format!("window {id}")))
    }

    #[instrument(skip(self))]
    pub fn find_live_by_volatile(&self, volatile_id: VolatileId) -> Result<Option<WindowRecord>, StoreError> {
        let mut found = self.query(
            &format!("{} WHERE volatile_id = ?1 AND closed_at IS NULL", select_windows()),
            &[&volatile_id],
        )?;
        Ok(found.pop())
    }

    #[instrument(skip(self))]
    pub fn list_live(&self) -> Result<Vec<WindowRecord>, StoreError> {
        self.query(
            &format!("{} WHERE closed_at IS NULL ORDER BY created_at, id", select_windows()),
            &[],
        )
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn list_by_session(&self, session_id: &SessionId) -> Result<Vec<WindowRecord>, StoreError> {
        self.query(
            &format!("{} WHERE session_id = ?1 ORDER BY created_at, id", select_windows()),
            &[&session_id.as_str()],
        )
    }

    /// Most recently active closed window with this fingerprint, closed at or after `closed_since`.
    #[instrument(skip(self, fingerprint))]
    pub fn find_resurrection_candidate(
        &self,
        fingerprint: &Fingerprint,
        closed_since: DateTime<Utc>,
    ) -> Result<Option<WindowRecord>, StoreError> {
        let mut found = self.query(
            &format!(
                "{} WHERE fingerprint = ?1 AND closed_at IS NOT NULL AND closed_at >= ?2
                 ORDER BY last_active_at DESC, closed_at DESC, id DESC LIMIT 1",
                select_windows()
            ),
            &[&fingerprint.as_str(), &to_millis(closed_since)],
        )?;
        Ok(found.pop())
    }

    #[instrument(skip(self), fields(window_id = %id))]
    pub fn close(&self, id: &WindowId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE windows SET closed_at = ?1 WHERE id = ?2 AND closed_at IS NULL",
                rusqlite::params![to_millis(at), id.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    #[instrument(skip(self))]
    pub fn close_all_live(&self, at: DateTime<Utc>) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE windows SET closed_at = ?1, focused = 0 WHERE closed_at IS NULL",
                [to_millis(at)],
            )?)
        })
    }

    #[instrument(skip(self))]
    pub fn count_live(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM windows WHERE closed_at IS NULL", [], |r| r.get(0))?)
        })
    }

    /// Closed windows sharing a fingerprint with a more recently active closed window.
    #[instrument(skip(self))]
    pub fn closed_duplicates(&self) -> Result<Vec<WindowId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM (
                     SELECT id, ROW_NUMBER() OVER (
                         PARTITION BY fingerprint ORDER BY last_active_at DESC, id DESC
                     ) AS rn
                     FROM windows
                     WHERE closed_at IS NOT NULL AND fingerprint IS NOT NULL
                 ) WHERE rn > 1",
            )?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids.into_iter().map(WindowId::from_raw).collect())
        })
    }

    #[instrument(skip(self))]
    pub fn list_stale_closed(&self, cutoff: DateTime<Utc>) -> Result<Vec<WindowId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT w.id FROM windows w JOIN sessions s ON s.id = w.session_id
                 WHERE w.closed_at IS NOT NULL AND w.closed_at < ?1 AND s.is_saved = 0",
            )?;
            let ids = stmt
                .query_map([to_millis(cutoff)], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids.into_iter().map(WindowId::from_raw).collect())
        })
    }

    /// Hard delete windows and their focus intervals. Member tabs keep a
    /// dangling `window_id`; they are compacted on their own.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub fn delete_many(&self, ids: &[WindowId]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.db.with_tx(|conn| delete_ids(conn, ids))
    }

    #[instrument(skip(self, tags, notes), fields(window_id = %id))]
    pub fn update_user_fields(
        &self,
        id: &WindowId,
        tags: Option<&[String]>,
        notes: Option<Option<&str>>,
    ) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| update_user_fields(conn, "windows", id.as_str(), tags, notes))
    }

    fn query(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::types::ToSql],
    ) -> Result<Vec<WindowRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params)?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_window(row)?);
            }
            Ok(results)
        })
    }
}

/// Bulk upsert of the runtime-owned window columns.
pub fn upsert_volatile_many(conn: &Connection, windows: &[WindowRecord]) -> Result<usize, StoreError> {
    let mut stmt = conn.prepare(
        "INSERT INTO windows (id, volatile_id, fingerprint, session_id, created_at, last_active_at,
                              active_duration_ms, closed_at, tags, notes, metadata, kind, focused)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(id) DO UPDATE SET
             volatile_id = excluded.volatile_id,
             fingerprint = excluded.fingerprint,
             last_active_at = MAX(windows.last_active_at, excluded.last_active_at),
             active_duration_ms = MAX(windows.active_duration_ms, excluded.active_duration_ms),
             kind = excluded.kind,
             focused = excluded.focused",
    )?;
    let mut n = 0;
    for window in windows {
        let t = &window.tracking;
        n += stmt.execute(rusqlite::params![
            window.id.as_str(),
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
            window.kind.to_string(),
            window.focused,
        ])?;
    }
    Ok(n)
}

/// Delete window rows and their focus intervals. Callers provide the transaction.
pub fn delete_ids(conn: &Connection, ids: &[WindowId]) -> Result<usize, StoreError> {
    let mut focus = conn.prepare("DELETE FROM focus_events WHERE owner_id = ?1")?;
    let mut windows = conn.prepare("DELETE FROM windows WHERE id = ?1")?;
    let mut n = 0;
    for id in ids {
        focus.execute([id.as_str()])?;
        n += windows.execute([id.as_str()])?;
    }
    Ok(n)
}

fn row_to_window(row: &rusqlite::Row<'_>) -> Result<WindowRecord, StoreError> {
    let kind: String = row_helpers::get(row, 11, "windows", "kind")?;
    Ok(WindowRecord {
        id: WindowId::from_raw(row_helpers::get::<String>(row, 0, "windows", "id")?),
        tracking: row_helpers::read_tracking(row, 1, "windows")?,
        kind: row_helpers::parse_enum(&kind, "windows", "kind")?,
        focused: row_helpers::get(row, 12, "windows", "focused")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;
    use chrono::Duration;
    use trail_core::clock::from_millis;
    use trail_core::fingerprint::window_fingerprint;
    use trail_core::model::{Tracking, WindowKind};

    fn setup() -> (Database, SessionId) {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone()).create(from_millis(0), None).unwrap();
        (db, session.id)
    }

    fn window(session: &SessionId, volatile_id: VolatileId, urls: &[&str]) -> WindowRecord {
        let fp = window_fingerprint(&WindowKind::Normal.to_string(), urls.iter().copied()).ok();
        WindowRecord {
            id: WindowId::new(),
            tracking: Tracking::new(volatile_id, fp, session.clone(), from_millis(0)),
            kind: WindowKind::Normal,
            focused: false,
        }
    }

    #[test]
    fn insert_find_roundtrip() {
        let (db, sid) = setup();
        let repo = WindowRepo::new(db);
        let mut w = window(&sid, 1, &["https://a.com/"]);
        w.kind = WindowKind::Popup;
        repo.insert(&w).unwrap();
        assert_eq!(repo.get(&w.id).unwrap(), w);
        assert_eq!(repo.find_live_by_volatile(1).unwrap().map(|w| w.id), Some(w.id));
    }

    #[test]
    fn close_all_live_clears_focus() {
        let (db, sid) = setup();
        let repo = WindowRepo::new(db);
        let mut a = window(&sid, 1, &["https://a.com/"]);
        a.focused = true;
        let b = window(&sid, 2, &["https://b.com/"]);
        repo.insert(&a).unwrap();
        repo.insert(&b).unwrap();
        assert_eq!(repo.count_live().unwrap(), 2);

        assert_eq!(repo.close_all_live(from_millis(100)).unwrap(), 2);
        assert_eq!(repo.count_live().unwrap(), 0);
        let a = repo.get(&a.id).unwrap();
        assert!(!a.focused);
        assert_eq!(a.tracking.closed_at, Some(from_millis(100)));
    }

    #[test]
    fn resurrection_needs_matching_closed_window() {
        let (db, sid) = setup();
        let repo = WindowRepo::new(db);
        let w = window(&sid, 1, &["https://a.com/", "https://b.com/"]);
        repo.insert(&w).unwrap();
        let fp = w.tracking.fingerprint.clone().unwrap();
        let now = from_millis(3_600_000);

        assert!(repo.find_resurrection_candidate(&fp, now - Duration::minutes(30)).unwrap().is_none());
        repo.close(&w.id, now - Duration::minutes(2)).unwrap();
        let found = repo.find_resurrection_candidate(&fp, now - Duration::minutes(30)).unwrap();
        assert_eq!(found.map(|w| w.id), Some(w.id));
    }

    #[test]
    fn closed_duplicates_and_delete() {
        let (db, sid) = setup();
        let repo = WindowRepo::new(db);
        let mut a = window(&sid, 1, &["https://a.com/"]);
        a.tracking.last_active_at = from_millis(10);
        let mut b = window(&sid, 2, &["https://a.com/"]);
        b.tracking.last_active_at = from_millis(20);
        repo.insert(&a).unwrap();
        repo.insert(&b).unwrap();
        repo.close(&a.id, from_millis(30)).unwrap();
        repo.close(&b.id, from_millis(30)).unwrap();

        let dups = repo.closed_duplicates().unwrap();
        assert_eq!(dups, vec![a.id.clone()]);
        assert_eq!(repo.delete_many(&dups).unwrap(), 1);
        assert!(repo.find(&a.id).unwrap().is_none());
    }
}
