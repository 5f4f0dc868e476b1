//! Durable transmission queue with leased dequeue.
//!
//! The TX loop leases the next eligible entry, writes it to the TNC, then
//! acks (delete) or nacks (retry later). A lease marks the entry in-flight
//! so a crash between lease and ack leaves the frame queued; leases expire
//! so a stalled process never wedges the queue permanently.

use rusqlite::{params, OptionalExtension};

use rfmp_shared::types::{MessageId, Priority};

use crate::database::Database;
use crate::error::Result;
use crate::models::{TxEntry, TxPurpose};

/// How long a leased entry stays invisible before it becomes eligible
/// again. All queue times are in milliseconds.
const LEASE_MS: u64 = 60_000;

impl Database {
    /// Append a frame to the transmission queue.
    pub fn enqueue_tx(
        &self,
        frame: &[u8],
        priority: Priority,
        purpose: TxPurpose,
        msg_id: Option<&MessageId>,
        enqueued_at: u64,
        next_eligible_at: u64,
    ) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO tx_queue
                 (frame, priority, purpose, msg_id, enqueued_at, attempts, next_eligible_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
            params![
                frame,
                priority as u8,
                purpose.as_str(),
                msg_id.map(|m| m.to_hex()),
                enqueued_at as i64,
                next_eligible_at as i64,
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Atomically lease the next eligible entry: lowest priority value first,
    /// FIFO within a priority. Returns `None` when nothing is ready.
    pub fn lease_next_tx(&self, now: u64) -> Result<Option<TxEntry>> {
        let entry = self
            .conn()
            .query_row(
                "SELECT id, frame, priority, purpose, msg_id, enqueued_at, attempts,
                        next_eligible_at
                 FROM tx_queue
                 WHERE next_eligible_at <= ?1
                   AND (lease_deadline IS NULL OR lease_deadline <= ?1)
                 ORDER BY priority ASC, enqueued_at ASC, id ASC
                 LIMIT 1",
                params![now as i64],
                row_to_entry,
            )
            .optional()?;

        if let Some(ref entry) = entry {
            self.conn().execute(
                "UPDATE tx_queue SET lease_deadline = ?2 WHERE id = ?1",
                params![entry.id, (now + LEASE_MS) as i64],
            )?;
        }
        Ok(entry)
    }

    /// Transmission succeeded: remove the entry.
    pub fn ack_tx(&self, id: i64) -> Result<()> {
        self.conn()
            .execute("DELETE FROM tx_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Transmission failed: release the lease and defer by `delay` ms.
    pub fn nack_tx(&self, id: i64, now: u64, delay: u64) -> Result<()> {
        self.conn().execute(
            "UPDATE tx_queue
             SET attempts = attempts + 1,
                 next_eligible_at = ?2,
                 lease_deadline = NULL
             WHERE id = ?1",
            params![id, (now + delay) as i64],
        )?;
        Ok(())
    }

    /// Clear stale leases left behind by an unclean shutdown.
    pub fn release_tx_leases(&self) -> Result<usize> {
        let affected = self
            .conn()
            .execute("UPDATE tx_queue SET lease_deadline = NULL", [])?;
        Ok(affected)
    }

    pub fn tx_queue_depth(&self) -> Result<u64> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM tx_queue", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Drop queued SYNC frames; used when a fresher filter snapshot is
    /// enqueued so stale summaries never hit the air.
    pub fn drop_queued_syncs(&self) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM tx_queue WHERE purpose = 'SYNC' AND lease_deadline IS NULL",
            [],
        )?;
        Ok(affected)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<TxEntry> {
    let priority_raw: u8 = row.get(2)?;
    let purpose_str: String = row.get(3)?;
    let msg_id_str: Option<String> = row.get(4)?;

    let priority = Priority::from_u8(priority_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Integer,
            format!("priority {priority_raw} out of range").into(),
        )
    })?;
    let purpose = TxPurpose::from_str(&purpose_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown purpose {purpose_str}").into(),
        )
    })?;
    let msg_id = match msg_id_str {
        Some(s) => Some(MessageId::from_hex(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                e.to_string().into(),
            )
        })?),
        None => None,
    };

    Ok(TxEntry {
        id: row.get(0)?,
        frame: row.get(1)?,
        priority,
        purpose,
        msg_id,
        enqueued_at: row.get::<_, i64>(5)? as u64,
        attempts: row.get(6)?,
        next_eligible_at: row.get::<_, i64>(7)? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enqueue(db: &Database, prio: Priority, at: u64) -> i64 {
        db.enqueue_tx(b"frame", prio, TxPurpose::Msg, None, at, at)
            .unwrap()
    }

    #[test]
    fn priority_then_fifo() {
        let db = Database::open_in_memory().unwrap();
        let low = enqueue(&db, Priority::Minimal, 10);
        let urgent = enqueue(&db, Priority::Urgent, 11);
        let urgent2 = enqueue(&db, Priority::Urgent, 12);

        let a = db.lease_next_tx(100).unwrap().unwrap();
        assert_eq!(a.id, urgent);
        db.ack_tx(a.id).unwrap();

        let b = db.lease_next_tx(100).unwrap().unwrap();
        assert_eq!(b.id, urgent2);
        db.ack_tx(b.id).unwrap();

        let c = db.lease_next_tx(100).unwrap().unwrap();
        assert_eq!(c.id, low);
    }

    #[test]
    fn lease_hides_entry_until_expiry() {
        let db = Database::open_in_memory().unwrap();
        enqueue(&db, Priority::Normal, 10);

        let leased = db.lease_next_tx(100).unwrap().unwrap();
        assert!(db.lease_next_tx(100).unwrap().is_none());
        // Past the lease deadline the entry is visible again.
        assert!(db.lease_next_tx(100 + LEASE_MS).unwrap().is_some());
        db.ack_tx(leased.id).unwrap();
        assert_eq!(db.tx_queue_depth().unwrap(), 0);
    }

    #[test]
    fn nack_defers_and_counts_attempts() {
        let db = Database::open_in_memory().unwrap();
        enqueue(&db, Priority::Normal, 10);

        let leased = db.lease_next_tx(100).unwrap().unwrap();
        assert_eq!(leased.attempts, 0);
        db.nack_tx(leased.id, 100, 50).unwrap();

        assert!(db.lease_next_tx(120).unwrap().is_none());
        let retried = db.lease_next_tx(151).unwrap().unwrap();
        assert_eq!(retried.attempts, 1);
    }

    #[test]
    fn not_eligible_before_time() {
        let db = Database::open_in_memory().unwrap();
        db.enqueue_tx(b"x", Priority::Normal, TxPurpose::Sync, None, 10, 500)
            .unwrap();
        assert!(db.lease_next_tx(499).unwrap().is_none());
        assert!(db.lease_next_tx(500).unwrap().is_some());
    }

    #[test]
    fn release_leases_on_startup() {
        let db = Database::open_in_memory().unwrap();
        enqueue(&db, Priority::Normal, 10);
        db.lease_next_tx(100).unwrap().unwrap();
        assert!(db.lease_next_tx(100).unwrap().is_none());

        db.release_tx_leases().unwrap();
        assert!(db.lease_next_tx(100).unwrap().is_some());
    }

    #[test]
    fn drop_queued_syncs_leaves_other_purposes() {
        let db = Database::open_in_memory().unwrap();
        db.enqueue_tx(b"s", Priority::Low, TxPurpose::Sync, None, 1, 1)
            .unwrap();
        db.enqueue_tx(b"m", Priority::Low, TxPurpose::Msg, None, 1, 1)
            .unwrap();

        assert_eq!(db.drop_queued_syncs().unwrap(), 1);
        assert_eq!(db.tx_queue_depth().unwrap(), 1);
    }

    #[test]
    fn entry_fields_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let id = MessageId([3; 6]);
        db.enqueue_tx(b"payload", Priority::Low, TxPurpose::Frag, Some(&id), 7, 7)
            .unwrap();

        let e = db.lease_next_tx(10).unwrap().unwrap();
        assert_eq!(e.frame, b"payload");
        assert_eq!(e.priority, Priority::Low);
        assert_eq!(e.purpose, TxPurpose::Frag);
        assert_eq!(e.msg_id, Some(id));
        assert_eq!(e.enqueued_at, 7);
    }
}
