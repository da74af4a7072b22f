//! Visit and focus intervals. An owner has at most one open interval of each
//! kind; opening a new one closes the previous.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::instrument;

use trail_core::clock::to_millis;
use trail_core::ids::{FocusId, ObjectRef, SessionId, TabId, VisitId, WindowId};
use trail_core::model::{FocusRecord, ObjectKind, VisitRecord};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

pub struct IntervalRepo {
    db: Database,
}

impl IntervalRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Start a visit for `owner`, ending whatever visit it had open.
    #[instrument(skip(self, url), fields(tab_id = %owner))]
    pub fn open_visit(
        &self,
        owner: &TabId,
        session_id: &SessionId,
        url: &str,
        at: DateTime<Utc>,
    ) -> Result<VisitRecord, StoreError> {
        let visit = VisitRecord {
            id: VisitId::new(),
            owner_id: owner.clone(),
            session_id: session_id.clone(),
            url: url.to_string(),
            start: at,
            end: None,
            duration_ms: None,
        };
        self.db.with_tx(|conn| {
            close_open(conn, "visits", owner.as_str(), at)?;
            conn.execute(
                "INSERT INTO visits (id, owner_id, session_id, url, start_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    visit.id.as_str(),
                    owner.as_str(),
                    session_id.as_str(),
                    url,
                    to_millis(at),
                ],
            )?;
            Ok(())
        })?;
        Ok(visit)
    }

    /// End the open visit, if any. Returns the closed interval's duration.
    #[instrument(skip(self), fields(tab_id = %owner))]
    pub fn close_open_visit(&self, owner: &TabId, at: DateTime<Utc>) -> Result<Option<i64>, StoreError> {
        self.db.with_conn(|conn| close_open(conn, "visits", owner.as_str(), at))
    }

    #[instrument(skip(self), fields(tab_id = %owner))]
    pub fn open_visit_for(&self, owner: &TabId) -> Result<Option<VisitRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, session_id, url, start_at, end_at, duration_ms
                 FROM visits WHERE owner_id = ?1 AND end_at IS NULL",
            )?;
            let mut rows = stmt.query([owner.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_visit(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Visits for one tab, newest first.
    #[instrument(skip(self), fields(tab_id = %owner))]
    pub fn visit_history(&self, owner: &TabId, limit: u32) -> Result<Vec<VisitRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_id, session_id, url, start_at, end_at, duration_ms
                 FROM visits WHERE owner_id = ?1 ORDER BY start_at DESC, id DESC LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![owner.as_str(), limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_visit(row)?);
            }
            Ok(out)
        })
    }

    /// Start a focus interval for `owner`, ending its previous one.
    #[instrument(skip(self), fields(owner = %owner))]
    pub fn open_focus(
        &self,
        owner: &ObjectRef,
        session_id: &SessionId,
        at: DateTime<Utc>,
    ) -> Result<FocusRecord, StoreError> {
        let focus = FocusRecord {
            id: FocusId::new(),
            owner: owner.clone(),
            session_id: session_id.clone(),
            start: at,
            end: None,
            duration_ms: None,
        };
        self.db.with_tx(|conn| {
            close_open(conn, "focus_events", owner.as_str(), at)?;
            conn.execute(
                "INSERT INTO focus_events (id, owner_kind, owner_id, session_id, start_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    focus.id.as_str(),
                    owner_kind(owner).to_string(),
                    owner.as_str(),
                    session_id.as_str(),
                    to_millis(at),
                ],
            )?;
            Ok(())
        })?;
        Ok(focus)
    }

    #[instrument(skip(self), fields(owner = %owner))]
    pub fn close_open_focus(&self, owner: &ObjectRef, at: DateTime<Utc>) -> Result<Option<i64>, StoreError> {
        self.db.with_conn(|conn| close_open(conn, "focus_events", owner.as_str(), at))
    }

    /// End every open focus interval of one kind, e.g. when focus leaves the
    /// host. Returns each owner with the duration it just accrued.
    #[instrument(skip(self))]
    pub fn close_all_focus(&self, kind: ObjectKind, at: DateTime<Utc>) -> Result<Vec<(ObjectRef, i64)>, StoreError> {
        let ms = to_millis(at);
        self.db.with_tx(|conn| {
            let mut stmt =
                conn.prepare("SELECT owner_id, start_at FROM focus_events WHERE owner_kind = ?1 AND end_at IS NULL")?;
            let mut rows = stmt.query([kind.to_string()])?;
            let mut closed = Vec::new();
            while let Some(row) = rows.next()? {
                let owner_id: String = row_helpers::get(row, 0, "focus_events", "owner_id")?;
                let start: i64 = row_helpers::get(row, 1, "focus_events", "start_at")?;
                closed.push((owner_ref(kind, owner_id), ms.max(start) - start));
            }
            drop(rows);
            drop(stmt);
            conn.execute(
                "UPDATE focus_events SET end_at = MAX(?1, start_at), duration_ms = MAX(?1 - start_at, 0)
                 WHERE owner_kind = ?2 AND end_at IS NULL",
                rusqlite::params![ms, kind.to_string()],
            )?;
            Ok(closed)
        })
    }

    #[instrument(skip(self), fields(owner = %owner))]
    pub fn focus_history(&self, owner: &ObjectRef, limit: u32) -> Result<Vec<FocusRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, owner_kind, owner_id, session_id, start_at, end_at, duration_ms
                 FROM focus_events WHERE owner_id = ?1 ORDER BY start_at DESC, id DESC LIMIT ?2",
            )?;
            let mut rows = stmt.query(rusqlite::params![owner.as_str(), limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_focus(row)?);
            }
            Ok(out)
        })
    }
}

fn owner_ref(kind: ObjectKind, owner_id: String) -> ObjectRef {
    match kind {
        ObjectKind::Tab => ObjectRef::Tab(TabId::from_raw(owner_id)),
        ObjectKind::Window => ObjectRef::Window(WindowId::from_raw(owner_id)),
    }
}

fn owner_kind(owner: &ObjectRef) -> ObjectKind {
    match owner {
        ObjectRef::Tab(_) => ObjectKind::Tab,
        ObjectRef::Window(_) => ObjectKind::Window,
    }
}

/// Close the owner's open interval in `table`. Durations never go negative
/// even if the clock stepped backwards.
fn close_open(
    conn: &Connection,
    table: &'static str,
    owner_id: &str,
    at: DateTime<Utc>,
) -> Result<Option<i64>, StoreError> {
    let start: Option<i64> = conn
        .query_row(
            &format!("SELECT start_at FROM {table} WHERE owner_id = ?1 AND end_at IS NULL"),
            [owner_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(start) = start else {
        return Ok(None);
    };
    let end = to_millis(at).max(start);
    let duration = end - start;
    conn.execute(
        &format!("UPDATE {table} SET end_at = ?1, duration_ms = ?2 WHERE owner_id = ?3 AND end_at IS NULL"),
        rusqlite::params![end, duration, owner_id],
    )?;
    Ok(Some(duration))
}

fn row_to_visit(row: &rusqlite::Row<'_>) -> Result<VisitRecord, StoreError> {
    Ok(VisitRecord {
        id: VisitId::from_raw(row_helpers::get::<String>(row, 0, "visits", "id")?),
        owner_id: TabId::from_raw(row_helpers::get::<String>(row, 1, "visits", "owner_id")?),
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 2, "visits", "session_id")?),
        url: row_helpers::get(row, 3, "visits", "url")?,
        start: row_helpers::get_time(row, 4, "visits", "start_at")?,
        end: row_helpers::get_time_opt(row, 5, "visits", "end_at")?,
        duration_ms: row_helpers::get_opt(row, 6, "visits", "duration_ms")?,
    })
}

fn row_to_focus(row: &rusqlite::Row<'_>) -> Result<FocusRecord, StoreError> {
    let kind_raw: String = row_helpers::get(row, 1, "focus_events", "owner_kind")?;
    let kind: ObjectKind = row_helpers::parse_enum(&kind_raw, "focus_events", "owner_kind")?;
    let owner = owner_ref(kind, row_helpers::get(row, 2, "focus_events", "owner_id")?);
    Ok(FocusRecord {
        id: FocusId::from_raw(row_helpers::get::<String>(row, 0, "focus_events", "id")?),
        owner,
        session_id: SessionId::from_raw(row_helpers::get::<String>(row, 3, "focus_events", "session_id")?),
        start: row_helpers::get_time(row, 4, "focus_events", "start_at")?,
        end: row_helpers::get_time_opt(row, 5, "focus_events", "end_at")?,
        duration_ms: row_helpers::get_opt(row, 6, "focus_events", "duration_ms")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionRepo;
    use trail_core::clock::from_millis;

    fn setup() -> (IntervalRepo, SessionId) {
        let db = Database::in_memory().unwrap();
        let session = SessionRepo::new(db.clone()).create(from_millis(0), None).unwrap();
        (IntervalRepo::new(db), session.id)
    }

    #[test]
    fn opening_a_visit_closes_the_previous() {
        let (repo, sid) = setup();
        let tab = TabId::new();
        repo.open_visit(&tab, &sid, "https://a.com/", from_millis(1_000)).unwrap();
        repo.open_visit(&tab, &sid, "https://b.com/", from_millis(4_000)).unwrap();

        let history = repo.visit_history(&tab, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].url, "https://b.com/");
        assert_eq!(history[0].end, None);
        assert_eq!(history[1].duration_ms, Some(3_000));
        assert_eq!(repo.open_visit_for(&tab).unwrap().map(|v| v.url), Some("https://b.com/".into()));
    }

    #[test]
    fn closing_without_open_visit_is_a_noop() {
        let (repo, _) = setup();
        assert_eq!(repo.close_open_visit(&TabId::new(), from_millis(5)).unwrap(), None);
    }

    #[test]
    fn duration_clamped_when_clock_goes_back() {
        let (repo, sid) = setup();
        let tab = TabId::new();
        repo.open_visit(&tab, &sid, "https://a.com/", from_millis(10_000)).unwrap();
        assert_eq!(repo.close_open_visit(&tab, from_millis(9_000)).unwrap(), Some(0));
    }

    #[test]
    fn focus_intervals_per_owner() {
        let (repo, sid) = setup();
        let win = ObjectRef::Window(WindowId::new());
        let tab = ObjectRef::Tab(TabId::new());
        repo.open_focus(&win, &sid, from_millis(0)).unwrap();
        repo.open_focus(&tab, &sid, from_millis(0)).unwrap();
        assert_eq!(repo.close_open_focus(&win, from_millis(2_500)).unwrap(), Some(2_500));

        let history = repo.focus_history(&tab, 5).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].owner, tab);
        assert!(history[0].end.is_none());
    }

    #[test]
    fn close_all_focus_by_kind() {
        let (repo, sid) = setup();
        let a = ObjectRef::Window(WindowId::new());
        let b = ObjectRef::Window(WindowId::new());
        let t = ObjectRef::Tab(TabId::new());
        for owner in [&a, &b, &t] {
            repo.open_focus(owner, &sid, from_millis(100)).unwrap();
        }
        repo.close_open_focus(&b, from_millis(300)).unwrap();
        repo.open_focus(&b, &sid, from_millis(400)).unwrap();

        let mut closed = repo.close_all_focus(ObjectKind::Window, from_millis(600)).unwrap();
        closed.sort_by_key(|(_, ms)| *ms);
        assert_eq!(closed, vec![(b.clone(), 200), (a.clone(), 500)]);
        assert_eq!(repo.focus_history(&a, 1).unwrap()[0].duration_ms, Some(500));
        assert!(repo.focus_history(&t, 1).unwrap()[0].end.is_none());
    }
}
