//! v001 -- Initial schema creation.
//!
//! Creates the seven core tables: `messages`, `fragments`, `tx_queue`,
//! `seen`, `bloom_windows`, `nodes`, and `channels`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id             TEXT PRIMARY KEY NOT NULL,  -- 12 hex chars (6-byte fingerprint)
    from_node      TEXT NOT NULL,              -- canonical callsign
    author         TEXT NOT NULL DEFAULT '',   -- application nickname, may be empty
    timestamp      INTEGER NOT NULL,           -- sender clock, unix seconds (u32)
    channel        TEXT NOT NULL,
    priority       INTEGER NOT NULL,           -- 0 urgent .. 3 minimal
    reply_to       TEXT,                       -- nullable message id
    body           BLOB NOT NULL,
    received_at    INTEGER,                    -- local unix seconds, null for own sends
    transmitted_at INTEGER                     -- local unix seconds, null until acked
);

CREATE INDEX IF NOT EXISTS idx_messages_channel_ts
    ON messages(channel, timestamp DESC);

CREATE INDEX IF NOT EXISTS idx_messages_ts
    ON messages(timestamp DESC);

-- ----------------------------------------------------------------
-- Inbound fragments (persisted so reassembly survives restart)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS fragments (
    from_node   TEXT NOT NULL,
    msg_id      TEXT NOT NULL,
    seq         INTEGER NOT NULL,
    total       INTEGER NOT NULL,
    payload     BLOB NOT NULL,
    received_at INTEGER NOT NULL,

    PRIMARY KEY (from_node, msg_id, seq)
);

-- ----------------------------------------------------------------
-- Transmission queue (leased dequeue)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS tx_queue (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    frame            BLOB NOT NULL,            -- encoded RFMP payload
    priority         INTEGER NOT NULL,
    purpose          TEXT NOT NULL,            -- MSG | FRAG | SYNC | REQ
    msg_id           TEXT,                     -- originating message if any
    enqueued_at      INTEGER NOT NULL,
    attempts         INTEGER NOT NULL DEFAULT 0,
    next_eligible_at INTEGER NOT NULL,
    lease_deadline   INTEGER                   -- in-flight marker
);

CREATE INDEX IF NOT EXISTS idx_tx_queue_dequeue
    ON tx_queue(next_eligible_at, priority, enqueued_at);

-- ----------------------------------------------------------------
-- Seen cache (authoritative; the in-memory LRU is the fast path)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS seen (
    msg_id       TEXT PRIMARY KEY NOT NULL,
    last_seen_at INTEGER NOT NULL,
    rebroadcast  INTEGER NOT NULL DEFAULT 0    -- boolean 0/1
);

-- ----------------------------------------------------------------
-- Bloom windows (persisted on rotation and shutdown)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS bloom_windows (
    window_index INTEGER PRIMARY KEY,          -- 0..2
    opened_at    INTEGER NOT NULL,
    salt         INTEGER NOT NULL,
    k            INTEGER NOT NULL,
    m_log2       INTEGER NOT NULL,
    bits         BLOB NOT NULL,
    count        INTEGER NOT NULL DEFAULT 0
);

-- ----------------------------------------------------------------
-- Nodes heard on air
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS nodes (
    callsign     TEXT PRIMARY KEY NOT NULL,
    first_seen   INTEGER NOT NULL,
    last_seen    INTEGER NOT NULL,
    packet_count INTEGER NOT NULL DEFAULT 0
);

-- ----------------------------------------------------------------
-- Channels
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channels (
    name          TEXT PRIMARY KEY NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0,
    last_activity INTEGER NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
