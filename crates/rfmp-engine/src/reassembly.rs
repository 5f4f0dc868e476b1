//! Fragmentation of oversize outbound frames and reassembly of inbound
//! FRAG streams.
//!
//! Reassembly buffers are keyed by `(from_node, msg_id)`, capped at
//! [`MAX_BUFFERS`], and expire after [`DEFAULT_TTL_SECS`] without a new
//! unique sequence number. Completion re-decodes the inner MSG and verifies
//! that its id matches the one the fragments were labelled with.

use std::collections::{BTreeMap, HashMap};

use rfmp_shared::constants::FRAG_OVERHEAD;
use rfmp_shared::frames::{Frame, MsgFrame};
use rfmp_shared::types::{Callsign, MessageId};

/// Outstanding reassembly buffers before oldest-first eviction.
pub const MAX_BUFFERS: usize = 64;

/// Buffer inactivity timeout.
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Split an encoded MSG frame into FRAG frames when it exceeds the MTU.
///
/// Returns `None` when the frame fits in one transmission. Payload per FRAG
/// is `mtu - 12` bytes (the FRAG header overhead), so every emitted FRAG
/// encodes to at most `mtu` bytes.
pub fn fragment_encoded(encoded: &[u8], id: MessageId, mtu: usize) -> Option<Vec<Frame>> {
    if encoded.len() <= mtu {
        return None;
    }
    let chunk = mtu.saturating_sub(FRAG_OVERHEAD).max(1);
    let total = encoded.len().div_ceil(chunk);
    debug_assert!(total <= u8::MAX as usize, "body limits keep total under 256");

    Some(
        encoded
            .chunks(chunk)
            .enumerate()
            .map(|(seq, payload)| Frame::Frag {
                id,
                seq: seq as u8,
                total: total as u8,
                payload: payload.to_vec(),
            })
            .collect(),
    )
}

/// Result of ingesting one inbound fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragOutcome {
    /// New fragment stored; message still incomplete.
    Stored,
    /// Sequence number already held; ignored.
    Duplicate,
    /// Fragment disagrees with the buffer's `total`; ignored.
    TotalMismatch,
    /// All sequences present and the inner MSG decoded with a matching id.
    Complete(MsgFrame),
    /// Reassembled bytes did not decode to a MSG with the labelled id; the
    /// whole buffer was discarded.
    IdMismatch,
}

#[derive(Debug)]
struct Buffer {
    total: u8,
    parts: BTreeMap<u8, Vec<u8>>,
    last_activity: u64,
}

#[derive(Debug, Default)]
pub struct Reassembler {
    buffers: HashMap<(Callsign, MessageId), Buffer>,
    evicted: Vec<(Callsign, MessageId)>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest one fragment. `now` drives inactivity tracking.
    pub fn ingest(
        &mut self,
        from: &Callsign,
        id: MessageId,
        seq: u8,
        total: u8,
        payload: Vec<u8>,
        now: u64,
    ) -> FragOutcome {
        let key = (from.clone(), id);

        if !self.buffers.contains_key(&key) && self.buffers.len() >= MAX_BUFFERS {
            self.evict_oldest();
        }

        let buffer = self.buffers.entry(key.clone()).or_insert_with(|| Buffer {
            total,
            parts: BTreeMap::new(),
            last_activity: now,
        });

        if buffer.total != total {
            return FragOutcome::TotalMismatch;
        }
        if buffer.parts.contains_key(&seq) {
            return FragOutcome::Duplicate;
        }

        buffer.parts.insert(seq, payload);
        buffer.last_activity = now;
        let complete = buffer.parts.len() >= buffer.total as usize;

        if !complete {
            return FragOutcome::Stored;
        }

        // Complete: concatenate in seq order and decode the inner MSG.
        let Some(buffer) = self.buffers.remove(&key) else {
            return FragOutcome::Stored;
        };
        let mut assembled = Vec::new();
        for part in buffer.parts.values() {
            assembled.extend_from_slice(part);
        }

        match Frame::decode(&assembled) {
            Ok(Frame::Msg(msg)) if msg.id == id => FragOutcome::Complete(msg),
            _ => FragOutcome::IdMismatch,
        }
    }

    fn evict_oldest(&mut self) {
        if let Some(key) = self
            .buffers
            .iter()
            .min_by_key(|(_, b)| b.last_activity)
            .map(|(k, _)| k.clone())
        {
            self.buffers.remove(&key);
            self.evicted.push(key);
        }
    }

    /// Drop buffers inactive for longer than `ttl_secs`, returning their
    /// keys so the caller can purge persisted fragments and consider a REQ.
    pub fn sweep(&mut self, now: u64, ttl_secs: u64) -> Vec<(Callsign, MessageId)> {
        let expired: Vec<_> = self
            .buffers
            .iter()
            .filter(|(_, b)| now.saturating_sub(b.last_activity) >= ttl_secs)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.buffers.remove(key);
        }
        expired
    }

    /// Keys evicted for capacity pressure since the last call.
    pub fn drain_evicted(&mut self) -> Vec<(Callsign, MessageId)> {
        std::mem::take(&mut self.evicted)
    }

    /// Seed a buffer from fragments persisted before a restart.
    pub fn restore(
        &mut self,
        from: &Callsign,
        id: MessageId,
        total: u8,
        parts: impl IntoIterator<Item = (u8, Vec<u8>)>,
        now: u64,
    ) {
        let buffer = self
            .buffers
            .entry((from.clone(), id))
            .or_insert_with(|| Buffer {
                total,
                parts: BTreeMap::new(),
                last_activity: now,
            });
        for (seq, payload) in parts {
            buffer.parts.entry(seq).or_insert(payload);
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Missing sequence numbers for one buffer, if it exists.
    pub fn missing(&self, from: &Callsign, id: &MessageId) -> Option<Vec<u8>> {
        self.buffers.get(&(from.clone(), *id)).map(|b| {
            (0..b.total).filter(|s| !b.parts.contains_key(s)).collect()
        })
    }
}
