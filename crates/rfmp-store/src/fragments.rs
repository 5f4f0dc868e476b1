use rusqlite::params;

use rfmp_shared::types::{Callsign, MessageId};

use crate::database::Database;
use crate::error::Result;
use crate::models::FragmentRow;

impl Database {
    /// Persist one inbound fragment. Duplicate `(from_node, msg_id, seq)`
    /// rows are ignored; returns whether the fragment was new.
    pub fn insert_fragment(&self, frag: &FragmentRow) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO fragments
                 (from_node, msg_id, seq, total, payload, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                frag.from_node.to_string(),
                frag.msg_id.to_hex(),
                frag.seq,
                frag.total,
                frag.payload,
                frag.received_at as i64,
            ],
        )?;
        Ok(affected > 0)
    }

    /// All stored fragments for one reassembly key, in `seq` order.
    pub fn list_fragments(
        &self,
        from_node: &Callsign,
        msg_id: &MessageId,
    ) -> Result<Vec<FragmentRow>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT from_node, msg_id, seq, total, payload, received_at
             FROM fragments
             WHERE from_node = ?1 AND msg_id = ?2
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(
            params![from_node.to_string(), msg_id.to_hex()],
            row_to_fragment,
        )?;
        let mut fragments = Vec::new();
        for row in rows {
            fragments.push(row?);
        }
        Ok(fragments)
    }

    pub fn delete_fragments(&self, from_node: &Callsign, msg_id: &MessageId) -> Result<()> {
        self.conn().execute(
            "DELETE FROM fragments WHERE from_node = ?1 AND msg_id = ?2",
            params![from_node.to_string(), msg_id.to_hex()],
        )?;
        Ok(())
    }

    /// Drop all fragments received before `cutoff`. Returns rows removed.
    pub fn cleanup_fragments(&self, cutoff: u64) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM fragments WHERE received_at < ?1",
            params![cutoff as i64],
        )?;
        Ok(affected)
    }
}

fn row_to_fragment(row: &rusqlite::Row<'_>) -> rusqlite::Result<FragmentRow> {
    let from_str: String = row.get(0)?;
    let id_str: String = row.get(1)?;

    let from_node = Callsign::parse(&from_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })?;
    let msg_id = MessageId::from_hex(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })?;

    Ok(FragmentRow {
        from_node,
        msg_id,
        seq: row.get(2)?,
        total: row.get(3)?,
        payload: row.get(4)?,
        received_at: row.get::<_, i64>(5)? as u64,
    })
}
