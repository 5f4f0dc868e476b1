use chrono::DateTime;
use rusqlite::params;

use rfmp_shared::types::Callsign;

use crate::database::Database;
use crate::error::Result;
use crate::models::NodeInfo;

impl Database {
    /// Record activity from a node: bump `packet_count` and `last_seen`,
    /// creating the row on first contact.
    pub fn upsert_node(&self, callsign: &Callsign, now: u64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO nodes (callsign, first_seen, last_seen, packet_count)
             VALUES (?1, ?2, ?2, 1)
             ON CONFLICT(callsign) DO UPDATE SET
                 last_seen = excluded.last_seen,
                 packet_count = packet_count + 1",
            params![callsign.to_string(), now as i64],
        )?;
        Ok(())
    }

    /// List known nodes, optionally only those heard within the last
    /// `active_within` seconds, most recently heard first.
    pub fn list_nodes(&self, now: u64, active_within: Option<u64>) -> Result<Vec<NodeInfo>> {
        let cutoff = active_within.map(|w| (now.saturating_sub(w)) as i64);
        let mut stmt = self.conn().prepare_cached(
            "SELECT callsign, first_seen, last_seen, packet_count
             FROM nodes
             WHERE (?1 IS NULL OR last_seen >= ?1)
             ORDER BY last_seen DESC",
        )?;
        let rows = stmt.query_map(params![cutoff], row_to_node)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row?);
        }
        Ok(nodes)
    }
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeInfo> {
    let callsign_str: String = row.get(0)?;
    let first_seen: i64 = row.get(1)?;
    let last_seen: i64 = row.get(2)?;
    let packet_count: i64 = row.get(3)?;

    let callsign = Callsign::parse(&callsign_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })?;

    let ts = |t: i64, col: usize| {
        DateTime::from_timestamp(t, 0).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                col,
                rusqlite::types::Type::Integer,
                format!("timestamp {t} out of range").into(),
            )
        })
    };

    Ok(NodeInfo {
        callsign,
        first_seen: ts(first_seen, 1)?,
        last_seen: ts(last_seen, 2)?,
        packet_count: packet_count as u64,
    })
}
