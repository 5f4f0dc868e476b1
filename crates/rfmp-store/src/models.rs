use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use rfmp_shared::types::{Callsign, MessageId, Priority};

/// A message as persisted, with reception/transmission bookkeeping on top of
/// the wire fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub from_node: Callsign,
    pub author: String,
    /// Sender-asserted creation time, seconds since epoch (wire field).
    pub timestamp: u32,
    pub channel: String,
    pub priority: Priority,
    pub reply_to: Option<MessageId>,
    pub body: Vec<u8>,
    pub received_at: Option<DateTime<Utc>>,
    pub transmitted_at: Option<DateTime<Utc>>,
}

/// Outcome of an idempotent message insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// What a queued frame is for; drives scheduling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPurpose {
    Msg,
    Frag,
    Sync,
    Req,
}

impl TxPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Msg => "MSG",
            Self::Frag => "FRAG",
            Self::Sync => "SYNC",
            Self::Req => "REQ",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "MSG" => Some(Self::Msg),
            "FRAG" => Some(Self::Frag),
            "SYNC" => Some(Self::Sync),
            "REQ" => Some(Self::Req),
            _ => None,
        }
    }
}

/// One durable transmission-queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxEntry {
    pub id: i64,
    pub frame: Vec<u8>,
    pub priority: Priority,
    pub purpose: TxPurpose,
    /// Originating message, when the frame carries one (MSG/FRAG).
    pub msg_id: Option<MessageId>,
    pub enqueued_at: u64,
    pub attempts: u32,
    pub next_eligible_at: u64,
}

/// A persisted Bloom window, reloaded on cold start so sync state survives
/// restarts within one window duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomWindowRow {
    pub window_index: u8,
    pub opened_at: u32,
    pub salt: u32,
    pub k: u8,
    pub m_log2: u8,
    pub bits: Vec<u8>,
    pub count: u32,
}

/// Activity record for a radio node heard on the channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub callsign: Callsign,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub packet_count: u64,
}

/// Aggregate statistics for one channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelInfo {
    pub name: String,
    pub message_count: u64,
    pub last_activity: DateTime<Utc>,
}

/// A persisted inbound fragment awaiting reassembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentRow {
    pub from_node: Callsign,
    pub msg_id: MessageId,
    pub seq: u8,
    pub total: u8,
    pub payload: Vec<u8>,
    pub received_at: u64,
}
