use rusqlite::{params, OptionalExtension};

use rfmp_shared::types::MessageId;

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Record that `id` was observed at `now`, refreshing any existing row.
    pub fn seen_touch(&self, id: &MessageId, now: u64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO seen (msg_id, last_seen_at) VALUES (?1, ?2)
             ON CONFLICT(msg_id) DO UPDATE SET last_seen_at = excluded.last_seen_at",
            params![id.to_hex(), now as i64],
        )?;
        Ok(())
    }

    /// Authoritative membership check behind the in-memory fast path.
    pub fn seen_contains(&self, id: &MessageId) -> Result<bool> {
        let row: Option<i64> = self
            .conn()
            .query_row(
                "SELECT last_seen_at FROM seen WHERE msg_id = ?1",
                params![id.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// Mark `id` as rebroadcast. Returns `true` only the first time, which is
    /// what limits store-and-forward relays to one per message per node.
    pub fn mark_rebroadcast(&self, id: &MessageId, now: u64) -> Result<bool> {
        self.seen_touch(id, now)?;
        let affected = self.conn().execute(
            "UPDATE seen SET rebroadcast = 1 WHERE msg_id = ?1 AND rebroadcast = 0",
            params![id.to_hex()],
        )?;
        Ok(affected > 0)
    }

    /// Drop seen rows last touched before `cutoff`.
    pub fn cleanup_seen(&self, cutoff: u64) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM seen WHERE last_seen_at < ?1",
            params![cutoff as i64],
        )?;
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_and_contains() {
        let db = Database::open_in_memory().unwrap();
        let id = MessageId([1; 6]);
        assert!(!db.seen_contains(&id).unwrap());
        db.seen_touch(&id, 100).unwrap();
        assert!(db.seen_contains(&id).unwrap());
    }

    #[test]
    fn rebroadcast_marker_fires_once() {
        let db = Database::open_in_memory().unwrap();
        let id = MessageId([2; 6]);
        assert!(db.mark_rebroadcast(&id, 100).unwrap());
        assert!(!db.mark_rebroadcast(&id, 101).unwrap());
    }

    #[test]
    fn cleanup_drops_old_rows() {
        let db = Database::open_in_memory().unwrap();
        db.seen_touch(&MessageId([1; 6]), 100).unwrap();
        db.seen_touch(&MessageId([2; 6]), 500).unwrap();

        assert_eq!(db.cleanup_seen(200).unwrap(), 1);
        assert!(!db.seen_contains(&MessageId([1; 6])).unwrap());
        assert!(db.seen_contains(&MessageId([2; 6])).unwrap());
    }
}
