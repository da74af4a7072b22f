use chrono::{DateTime, Utc};
use tracing::instrument;

use trail_core::clock::to_millis;
use trail_core::model::TagRecord;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Catalog of tag names with usage counts, for suggestions.
pub struct TagRepo {
    db: Database,
}

impl TagRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Count one use of each tag. Blank names are skipped.
    #[instrument(skip(self, names), fields(count = names.len()))]
    pub fn record_usage(&self, names: &[String], at: DateTime<Utc>) -> Result<(), StoreError> {
        self.db.with_tx(|conn| {
            let mut stmt = conn.prepare(
                "INSERT INTO tags (name, use_count, last_used_at) VALUES (?1, 1, ?2)
                 ON CONFLICT(name) DO UPDATE SET
                     use_count = use_count + 1,
                     last_used_at = MAX(last_used_at, excluded.last_used_at)",
            )?;
            for name in names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
                stmt.execute(rusqlite::params![name, to_millis(at)])?;
            }
            Ok(())
        })
    }

    /// Most used first.
    #[instrument(skip(self))]
    pub fn list(&self, limit: u32) -> Result<Vec<TagRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, use_count, last_used_at FROM tags
                 ORDER BY use_count DESC, last_used_at DESC, name LIMIT ?1",
            )?;
            let mut rows = stmt.query([limit])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(TagRecord {
                    name: row_helpers::get(row, 0, "tags", "name")?,
                    use_count: row_helpers::get(row, 1, "tags", "use_count")?,
                    last_used_at: row_helpers::get_time(row, 2, "tags", "last_used_at")?,
                });
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trail_core::clock::from_millis;

    #[test]
    fn usage_accumulates() {
        let repo = TagRepo::new(Database::in_memory().unwrap());
        repo.record_usage(&["work".into(), "read".into()], from_millis(10)).unwrap();
        repo.record_usage(&["work".into(), "  ".into()], from_millis(20)).unwrap();

        let tags = repo.list(10).unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].name, "work");
        assert_eq!(tags[0].use_count, 2);
        assert_eq!(tags[0].last_used_at, from_millis(20));
        assert_eq!(tags[1].use_count, 1);
    }
}
