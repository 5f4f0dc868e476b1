use chrono::DateTime;
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::models::ChannelInfo;

impl Database {
    /// Bump a channel's message count and activity time, creating the row on
    /// first use.
    pub fn upsert_channel(&self, name: &str, now: u64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO channels (name, message_count, last_activity)
             VALUES (?1, 1, ?2)
             ON CONFLICT(name) DO UPDATE SET
                 message_count = message_count + 1,
                 last_activity = excluded.last_activity",
            params![name, now as i64],
        )?;
        Ok(())
    }

    pub fn list_channels(&self) -> Result<Vec<ChannelInfo>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT name, message_count, last_activity
             FROM channels
             ORDER BY last_activity DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            let last_activity: i64 = row.get(2)?;
            Ok(ChannelInfo {
                name: row.get(0)?,
                message_count: row.get::<_, i64>(1)? as u64,
                last_activity: DateTime::from_timestamp(last_activity, 0).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Integer,
                        format!("timestamp {last_activity} out of range").into(),
                    )
                })?,
            })
        })?;
        let mut channels = Vec::new();
        for row in rows {
            channels.push(row?);
        }
        Ok(channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_and_list() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_channel("general", 100).unwrap();
        db.upsert_channel("general", 200).unwrap();
        db.upsert_channel("wx", 150).unwrap();

        let channels = db.list_channels().unwrap();
        assert_eq!(channels.len(), 2);
        // Most recently active first.
        assert_eq!(channels[0].name, "general");
        assert_eq!(channels[0].message_count, 2);
        assert_eq!(channels[0].last_activity.timestamp(), 200);
        assert_eq!(channels[1].name, "wx");
    }
}
