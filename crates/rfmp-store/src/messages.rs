use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use rfmp_shared::types::{Callsign, MessageId, Priority};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{InsertOutcome, StoredMessage};

impl Database {
    /// Insert a message, verifying the content-address invariant first.
    ///
    /// Idempotent on `id`: re-inserting an existing row returns
    /// [`InsertOutcome::Duplicate`] and leaves the stored row untouched.
    /// A row whose `id` disagrees with the recomputed fingerprint of
    /// `(from_node, timestamp, body)` is rejected with
    /// [`StoreError::IdMismatch`].
    pub fn insert_message(&self, message: &StoredMessage) -> Result<InsertOutcome> {
        let computed =
            MessageId::fingerprint(&message.from_node, message.timestamp, &message.body);
        if computed != message.id {
            return Err(StoreError::IdMismatch {
                stored: message.id.to_hex(),
                computed: computed.to_hex(),
            });
        }

        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO messages
                 (id, from_node, author, timestamp, channel, priority, reply_to, body,
                  received_at, transmitted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                message.id.to_hex(),
                message.from_node.to_string(),
                message.author,
                message.timestamp,
                message.channel,
                message.priority as u8,
                message.reply_to.map(|r| r.to_hex()),
                message.body,
                message.received_at.map(|t| t.timestamp()),
                message.transmitted_at.map(|t| t.timestamp()),
            ],
        )?;

        Ok(if affected > 0 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::Duplicate
        })
    }

    pub fn get_message(&self, id: &MessageId) -> Result<Option<StoredMessage>> {
        self.conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_hex()],
                row_to_message,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    /// Short-id lookup: match on a hex prefix of at least 8 characters.
    pub fn get_message_by_prefix(&self, prefix: &str) -> Result<Option<StoredMessage>> {
        if prefix.len() < 8 || !prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Ok(None);
        }
        let pattern = format!("{}%", prefix.to_ascii_lowercase());
        self.conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM messages WHERE id LIKE ?1"),
                params![pattern],
                row_to_message,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    pub fn contains_message(&self, id: &MessageId) -> Result<bool> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE id = ?1",
            params![id.to_hex()],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// List messages newest-first, optionally restricted to a channel and a
    /// lower timestamp bound.
    pub fn list_messages(
        &self,
        channel: Option<&str>,
        since: Option<u32>,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.conn().prepare_cached(&format!(
            "SELECT {COLUMNS} FROM messages
             WHERE (?1 IS NULL OR channel = ?1)
               AND (?2 IS NULL OR timestamp >= ?2)
             ORDER BY timestamp DESC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(params![channel, since, limit], row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Ids of messages accepted within `[since, until)` local time, used to
    /// rebuild Bloom windows and drive sync comparisons.
    pub fn list_recent_ids(&self, since: u64, until: u64) -> Result<Vec<MessageId>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT id FROM messages
             WHERE COALESCE(received_at, timestamp) >= ?1
               AND COALESCE(received_at, timestamp) < ?2",
        )?;
        let rows = stmt.query_map(params![since as i64, until as i64], |row| {
            row.get::<_, String>(0)
        })?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(MessageId::from_hex(&row?)?);
        }
        Ok(ids)
    }

    /// Stamp the first successful transmission of a message.
    pub fn set_transmitted_at(&self, id: &MessageId, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE messages SET transmitted_at = ?2
             WHERE id = ?1 AND transmitted_at IS NULL",
            params![id.to_hex(), at.timestamp()],
        )?;
        Ok(())
    }

    pub fn message_count(&self) -> Result<u64> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

const COLUMNS: &str = "id, from_node, author, timestamp, channel, priority, reply_to, body, \
                       received_at, transmitted_at";

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let id_str: String = row.get(0)?;
    let from_str: String = row.get(1)?;
    let author: String = row.get(2)?;
    let timestamp: u32 = row.get(3)?;
    let channel: String = row.get(4)?;
    let priority_raw: u8 = row.get(5)?;
    let reply_str: Option<String> = row.get(6)?;
    let body: Vec<u8> = row.get(7)?;
    let received_at: Option<i64> = row.get(8)?;
    let transmitted_at: Option<i64> = row.get(9)?;

    let id = MessageId::from_hex(&id_str).map_err(|e| conversion_err(0, e))?;
    let from_node = Callsign::parse(&from_str).map_err(|e| conversion_err(1, e))?;
    let priority = Priority::from_u8(priority_raw)
        .ok_or_else(|| conversion_err(5, format!("priority {priority_raw} out of range")))?;
    let reply_to = match reply_str {
        Some(s) => Some(MessageId::from_hex(&s).map_err(|e| conversion_err(6, e))?),
        None => None,
    };

    Ok(StoredMessage {
        id,
        from_node,
        author,
        timestamp,
        channel,
        priority,
        reply_to,
        body,
        received_at: received_at.and_then(|t| DateTime::from_timestamp(t, 0)),
        transmitted_at: transmitted_at.and_then(|t| DateTime::from_timestamp(t, 0)),
    })
}

fn conversion_err(
    col: usize,
    err: impl std::fmt::Display,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        col,
        rusqlite::types::Type::Text,
        err.to_string().into(),
    )
}
