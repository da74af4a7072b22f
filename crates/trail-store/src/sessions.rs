use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tracing::instrument;

use trail_core::clock::to_millis;
use trail_core::ids::SessionId;
use trail_core::model::SessionRecord;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, millis_opt};

const SESSION_COLUMNS: &str = "id, name, started_at, ended_at, is_active, is_saved, expires_at, \
     tab_count, window_count, visit_count";

/// Denormalized per-session counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionCounter {
    Tabs,
    Windows,
    Visits,
}

impl SessionCounter {
    fn column(self) -> &'static str {
        match self {
            Self::Tabs => "tab_count",
            Self::Windows => "window_count",
            Self::Visits => "visit_count",
        }
    }
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new active session.
    #[instrument(skip(self))]
    pub fn create(
        &self,
        started_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<SessionRecord, StoreError> {
        let record = SessionRecord {
            id: SessionId::new(),
            name: None,
            started_at,
            ended_at: None,
            is_active: true,
            is_saved: false,
            expires_at,
            tab_count: 0,
            window_count: 0,
            visit_count: 0,
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, name, started_at, ended_at, is_active, is_saved, expires_at)
                 VALUES (?1, NULL, ?2, NULL, 1, 0, ?3)",
                rusqlite::params![
                    record.id.as_str(),
                    to_millis(started_at),
                    millis_opt(expires_at),
                ],
            )?;
            Ok(())
        })?;
        Ok(record)
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn find(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
    }

    pub fn get(&self, id: &SessionId) -> Result<SessionRecord, StoreError> {
        self.find(id)?
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    /// Active sessions, most recently started first.
    #[instrument(skip(self))]
    pub fn list_active(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.query(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE is_active = 1
                 ORDER BY started_at DESC, id DESC"
            ),
            &[],
        )
    }

    /// All sessions, most recently started first.
    #[instrument(skip(self))]
    pub fn list(&self, limit: u32, offset: u32) -> Result<Vec<SessionRecord>, StoreError> {
        self.query(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 ORDER BY started_at DESC, id DESC LIMIT ?1 OFFSET ?2"
            ),
            &[&limit, &offset],
        )
    }

    /// Retire every active session except `keep`. Returns how many were retired.
    #[instrument(skip(self))]
    pub fn retire_active(
        &self,
        ended_at: DateTime<Utc>,
        keep: Option<&SessionId>,
    ) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n = match keep {
                Some(keep) => conn.execute(
                    "UPDATE sessions SET is_active = 0, ended_at = ?1 WHERE is_active = 1 AND id != ?2",
                    rusqlite::params![to_millis(ended_at), keep.as_str()],
                )?,
                None => conn.execute(
                    "UPDATE sessions SET is_active = 0, ended_at = ?1 WHERE is_active = 1",
                    [to_millis(ended_at)],
                )?,
            };
            Ok(n)
        })
    }

    /// Bump a denormalized counter in place.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn increment(
        &self,
        id: &SessionId,
        counter: SessionCounter,
        by: i64,
    ) -> Result<(), StoreError> {
        let col = counter.column();
        self.db.with_conn(|conn| {
            conn.execute(
                &format!("UPDATE sessions SET {col} = {col} + ?1 WHERE id = ?2"),
                rusqlite::params![by, id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Exempt a session from expiry. Returns false if it does not exist.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn mark_saved(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE sessions SET is_saved = 1, expires_at = NULL WHERE id = ?1",
                [id.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn rename(&self, id: &SessionId, name: Option<&str>) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE sessions SET name = ?1 WHERE id = ?2",
                rusqlite::params![name, id.as_str()],
            )?;
            Ok(n > 0)
        })
    }

    /// Retired, unsaved sessions whose expiry has passed.
    #[instrument(skip(self))]
    pub fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<SessionId>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM sessions
                 WHERE is_active = 0 AND is_saved = 0 AND expires_at IS NOT NULL AND expires_at < ?1",
            )?;
            let ids = stmt
                .query_map([to_millis(now)], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids.into_iter().map(SessionId::from_raw).collect())
        })
    }

    /// Tabs and windows of this session that are still open.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn count_live_objects(&self, id: &SessionId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT (SELECT COUNT(*) FROM tabs WHERE session_id = ?1 AND closed_at IS NULL)
                      + (SELECT COUNT(*) FROM windows WHERE session_id = ?1 AND closed_at IS NULL)",
                [id.as_str()],
                |row| row.get(0),
            )?)
        })
    }

    /// Hard delete a session and everything recorded under it.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete_cascade(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_tx(|conn| {
            conn.execute(
                "DELETE FROM relationships
                 WHERE source_id IN (SELECT id FROM tabs WHERE session_id = ?1)
                    OR target_id IN (SELECT id FROM tabs WHERE session_id = ?1)",
                [id.as_str()],
            )?;
            conn.execute("DELETE FROM visits WHERE session_id = ?1", [id.as_str()])?;
            conn.execute("DELETE FROM focus_events WHERE session_id = ?1", [id.as_str()])?;
            conn.execute("DELETE FROM tabs WHERE session_id = ?1", [id.as_str()])?;
            conn.execute("DELETE FROM windows WHERE session_id = ?1", [id.as_str()])?;
            conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            Ok(())
        })
    }

    fn query(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::types::ToSql],
    ) -> Result<Vec<SessionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params)?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }
}

/// Whether a session row exists, for callers holding a raw connection.
pub fn session_exists(conn: &rusqlite::Connection, id: &SessionId) -> Result<bool, StoreError> {
    Ok(conn
        .query_row("SELECT 1 FROM sessions WHERE id = ?1", [id.as_str()], |_| Ok(()))
        .optional()?
        .is_some())
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<SessionRecord, StoreError> {
    Ok(SessionRecord {
        id: SessionId::from_raw(row_helpers::get::<String>(row, 0, "sessions", "id")?),
        name: row_helpers::get_opt(row, 1, "sessions", "name")?,
        started_at: row_helpers::get_time(row, 2, "sessions", "started_at")?,
        ended_at: row_helpers::get_time_opt(row, 3, "sessions", "ended_at")?,
        is_active: row_helpers::get(row, 4, "sessions", "is_active")?,
        is_saved: row_helpers::get(row, 5, "sessions", "is_saved")?,
        expires_at: row_helpers::get_time_opt(row, 6, "sessions", "expires_at")?,
        tab_count: row_helpers::get(row, 7, "sessions", "tab_count")?,
        window_count: row_helpers::get(row, 8, "sessions", "window_count")?,
        visit_count: row_helpers::get(row, 9, "sessions", "visit_count")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use trail_core::clock::from_millis;

    fn t(ms: i64) -> DateTime<Utc> {
        from_millis(ms)
    }

    #[test]
    fn create_and_get() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        let s = repo.create(t(1_000), Some(t(5_000))).unwrap();
        assert!(s.id.as_str().starts_with("sess_"));

        let fetched = repo.get(&s.id).unwrap();
        assert_eq!(fetched, s);
    }

    #[test]
    fn get_nonexistent_fails() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        let result = repo.get(&SessionId::from_raw("sess_missing"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_active_newest_first() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        let old = repo.create(t(1_000), None).unwrap();
        let new = repo.create(t(2_000), None).unwrap();
        let active = repo.list_active().unwrap();
        assert_eq!(active.iter().map(|s| &s.id).collect::<Vec<_>>(), vec![&new.id, &old.id]);
    }

    #[test]
    fn retire_all_but_one() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        let a = repo.create(t(1_000), None).unwrap();
        let b = repo.create(t(2_000), None).unwrap();
        let c = repo.create(t(3_000), None).unwrap();

        let retired = repo.retire_active(t(4_000), Some(&c.id)).unwrap();
        assert_eq!(retired, 2);

        let active = repo.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, c.id);
        assert_eq!(repo.get(&a.id).unwrap().ended_at, Some(t(4_000)));
        assert!(!repo.get(&b.id).unwrap().is_active);
    }

    #[test]
    fn counters_increment_in_place() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        let s = repo.create(t(0), None).unwrap();
        repo.increment(&s.id, SessionCounter::Tabs, 1).unwrap();
        repo.increment(&s.id, SessionCounter::Tabs, 2).unwrap();
        repo.increment(&s.id, SessionCounter::Visits, 1).unwrap();
        let s = repo.get(&s.id).unwrap();
        assert_eq!((s.tab_count, s.window_count, s.visit_count), (3, 0, 1));
    }

    #[test]
    fn saved_sessions_never_expire() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        let start = t(0);
        let keep = repo.create(start, Some(start + Duration::days(1))).unwrap();
        let drop = repo.create(start, Some(start + Duration::days(1))).unwrap();
        repo.retire_active(start, None).unwrap();
        assert!(repo.mark_saved(&keep.id).unwrap());

        let expired = repo.list_expired(start + Duration::days(2)).unwrap();
        assert_eq!(expired, vec![drop.id]);
        assert_eq!(repo.get(&keep.id).unwrap().expires_at, None);
    }

    #[test]
    fn active_sessions_never_expire() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        repo.create(t(0), Some(t(10))).unwrap();
        assert!(repo.list_expired(t(1_000)).unwrap().is_empty());
    }

    #[test]
    fn rename_and_mark_saved_missing() {
        let repo = SessionRepo::new(Database::in_memory().unwrap());
        let s = repo.create(t(0), None).unwrap();
        assert!(repo.rename(&s.id, Some("Research")).unwrap());
        assert_eq!(repo.get(&s.id).unwrap().name.as_deref(), Some("Research"));
        assert!(!repo.mark_saved(&SessionId::from_raw("sess_missing")).unwrap());
    }

    #[test]
    fn delete_cascade_removes_session() {
        let db = Database::in_memory().unwrap();
        let repo = SessionRepo::new(db.clone());
        let s = repo.create(t(0), None).unwrap();
        repo.delete_cascade(&s.id).unwrap();
        assert!(repo.find(&s.id).unwrap().is_none());
        assert!(!db.with_conn(|conn| session_exists(conn, &s.id)).unwrap());
    }
}
