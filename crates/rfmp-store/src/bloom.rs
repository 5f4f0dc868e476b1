//! Persistence for the rotating Bloom windows. Saved on every rotation and
//! at shutdown so a restart within one window duration keeps its sync state.

use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::models::BloomWindowRow;

impl Database {
    pub fn save_bloom_window(&self, w: &BloomWindowRow) -> Result<()> {
        self.conn().execute(
            "INSERT INTO bloom_windows (window_index, opened_at, salt, k, m_log2, bits, count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(window_index) DO UPDATE SET
                 opened_at = excluded.opened_at,
                 salt = excluded.salt,
                 k = excluded.k,
                 m_log2 = excluded.m_log2,
                 bits = excluded.bits,
                 count = excluded.count",
            params![
                w.window_index,
                w.opened_at,
                w.salt,
                w.k,
                w.m_log2,
                w.bits,
                w.count,
            ],
        )?;
        Ok(())
    }

    /// Load all persisted windows, ordered by `window_index`.
    pub fn load_bloom_windows(&self) -> Result<Vec<BloomWindowRow>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT window_index, opened_at, salt, k, m_log2, bits, count
             FROM bloom_windows
             ORDER BY window_index ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BloomWindowRow {
                window_index: row.get(0)?,
                opened_at: row.get(1)?,
                salt: row.get(2)?,
                k: row.get(3)?,
                m_log2: row.get(4)?,
                bits: row.get(5)?,
                count: row.get(6)?,
            })
        })?;
        let mut windows = Vec::new();
        for row in rows {
            windows.push(row?);
        }
        Ok(windows)
    }
}
