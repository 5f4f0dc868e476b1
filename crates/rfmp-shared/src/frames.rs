//! RFMP frame codec: the four frame types carried inside the AX.25 I-field.
//!
//! Every payload starts with a 2-octet header (magic 'R', then version nibble
//! + type nibble). All multi-byte integers are big-endian.

use crate::constants::{
    BLOOM_M_LOG2_MAX, BLOOM_M_LOG2_MIN, MAX_AUTHOR_LEN, MAX_CHANNEL_LEN, MESSAGE_ID_LEN,
    REQ_MAX_IDS, RFMP_MAGIC, RFMP_VERSION, SYNC_WINDOW_COUNT,
};
use crate::error::FramingError;
use crate::types::{MessageId, Priority};

/// Frame type nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Msg = 0,
    Frag = 1,
    Sync = 2,
    Req = 3,
}

impl FrameType {
    pub fn from_nibble(n: u8) -> Option<Self> {
        match n {
            0 => Some(Self::Msg),
            1 => Some(Self::Frag),
            2 => Some(Self::Sync),
            3 => Some(Self::Req),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Msg => "MSG",
            Self::Frag => "FRAG",
            Self::Sync => "SYNC",
            Self::Req => "REQ",
        }
    }
}

/// Wire form of a microblog message.
///
/// The transmitting node's callsign is *not* in the payload; it rides in the
/// AX.25 source address and participates in the id fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgFrame {
    pub id: MessageId,
    pub timestamp: u32,
    pub priority: Priority,
    pub channel: String,
    /// Application nickname, possibly empty for legacy senders.
    pub author: String,
    pub reply_to: Option<MessageId>,
    pub body: Vec<u8>,
}

/// One Bloom window as carried in a SYNC frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncWindow {
    pub opened_at: u32,
    pub salt: u32,
    pub k: u8,
    pub m_log2: u8,
    /// `2^m_log2 / 8` bytes, LSB-first within each byte.
    pub bits: Vec<u8>,
}

impl SyncWindow {
    pub fn m(&self) -> u32 {
        1u32 << self.m_log2
    }
}

/// Tagged union over the four RFMP frame types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Msg(MsgFrame),
    Frag {
        id: MessageId,
        seq: u8,
        total: u8,
        payload: Vec<u8>,
    },
    Sync(Vec<SyncWindow>),
    Req(Vec<MessageId>),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Msg(_) => FrameType::Msg,
            Frame::Frag { .. } => FrameType::Frag,
            Frame::Sync(_) => FrameType::Sync,
            Frame::Req(_) => FrameType::Req,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(RFMP_MAGIC);
        out.push((RFMP_VERSION << 4) | self.frame_type() as u8);

        match self {
            Frame::Msg(msg) => {
                out.extend_from_slice(msg.id.as_bytes());
                out.extend_from_slice(&msg.timestamp.to_be_bytes());
                out.push(msg.priority as u8);
                out.push(msg.channel.len() as u8);
                out.extend_from_slice(msg.channel.as_bytes());
                out.push(msg.author.len() as u8);
                out.extend_from_slice(msg.author.as_bytes());
                match msg.reply_to {
                    Some(reply) => {
                        out.push(1);
                        out.extend_from_slice(reply.as_bytes());
                    }
                    None => out.push(0),
                }
                out.extend_from_slice(&(msg.body.len() as u16).to_be_bytes());
                out.extend_from_slice(&msg.body);
            }
            Frame::Frag {
                id,
                seq,
                total,
                payload,
            } => {
                out.extend_from_slice(id.as_bytes());
                out.push(*seq);
                out.push(*total);
                out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
                out.extend_from_slice(payload);
            }
            Frame::Sync(windows) => {
                out.push(windows.len() as u8);
                for w in windows {
                    out.extend_from_slice(&w.opened_at.to_be_bytes());
                    out.extend_from_slice(&w.salt.to_be_bytes());
                    out.push(w.k);
                    out.push(w.m_log2);
                    out.extend_from_slice(&w.bits);
                }
            }
            Frame::Req(ids) => {
                out.push(ids.len() as u8);
                for id in ids {
                    out.extend_from_slice(id.as_bytes());
                }
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, FramingError> {
        let mut r = Reader::new(data);

        let magic = r.u8("magic")?;
        if magic != RFMP_MAGIC {
            return Err(FramingError::RfmpBadMagic(magic));
        }
        let vt = r.u8("version/type")?;
        let version = vt >> 4;
        if version != RFMP_VERSION {
            return Err(FramingError::RfmpBadVersion(version));
        }
        let frame_type =
            FrameType::from_nibble(vt & 0x0F).ok_or(FramingError::RfmpBadType(vt & 0x0F))?;

        match frame_type {
            FrameType::Msg => {
                let id = r.message_id("id")?;
                let timestamp = r.u32("timestamp")?;
                let priority = Priority::from_u8(r.u8("priority")?)
                    .ok_or(FramingError::RfmpBadField("priority"))?;
                let chan_len = r.u8("chan_len")? as usize;
                if chan_len == 0 || chan_len > MAX_CHANNEL_LEN {
                    return Err(FramingError::FieldTooLong("channel"));
                }
                let channel = r.str("channel", chan_len)?;
                validate_channel(&channel)?;
                let author_len = r.u8("author_len")? as usize;
                if author_len > MAX_AUTHOR_LEN {
                    return Err(FramingError::FieldTooLong("author"));
                }
                let author = r.str("author", author_len)?;
                let reply_to = match r.u8("reply_flag")? {
                    0 => None,
                    _ => Some(r.message_id("reply_id")?),
                };
                let body_len = r.u16("body_len")? as usize;
                let body = r.bytes("body", body_len)?.to_vec();
                Ok(Frame::Msg(MsgFrame {
                    id,
                    timestamp,
                    priority,
                    channel,
                    author,
                    reply_to,
                    body,
                }))
            }
            FrameType::Frag => {
                let id = r.message_id("id")?;
                let seq = r.u8("seq")?;
                let total = r.u8("total")?;
                if total == 0 || seq >= total {
                    return Err(FramingError::RfmpBadField("fragment seq/total"));
                }
                let payload_len = r.u16("payload_len")? as usize;
                let payload = r.bytes("payload", payload_len)?.to_vec();
                Ok(Frame::Frag {
                    id,
                    seq,
                    total,
                    payload,
                })
            }
            FrameType::Sync => {
                let count = r.u8("window_count")? as usize;
                if count != SYNC_WINDOW_COUNT {
                    return Err(FramingError::RfmpBadField("window count"));
                }
                let mut windows = Vec::with_capacity(count);
                for _ in 0..count {
                    let opened_at = r.u32("opened_at")?;
                    let salt = r.u32("salt")?;
                    let k = r.u8("k")?;
                    let m_log2 = r.u8("m_log2")?;
                    if !(BLOOM_M_LOG2_MIN..=BLOOM_M_LOG2_MAX).contains(&m_log2) {
                        return Err(FramingError::RfmpBadField("bloom m_log2"));
                    }
                    let byte_len = (1usize << m_log2) / 8;
                    let bits = r.bytes("bloom bits", byte_len)?.to_vec();
                    windows.push(SyncWindow {
                        opened_at,
                        salt,
                        k,
                        m_log2,
                        bits,
                    });
                }
                Ok(Frame::Sync(windows))
            }
            FrameType::Req => {
                let count = r.u8("count")? as usize;
                if count > REQ_MAX_IDS {
                    return Err(FramingError::RfmpBadField("req count"));
                }
                let mut ids = Vec::with_capacity(count);
                for _ in 0..count {
                    ids.push(r.message_id("req id")?);
                }
                Ok(Frame::Req(ids))
            }
        }
    }
}

/// Channel names are ASCII `[a-z0-9_-]`, 1-32 bytes.
pub fn validate_channel(name: &str) -> Result<(), FramingError> {
    let ok = !name.is_empty()
        && name.len() <= MAX_CHANNEL_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(FramingError::InvalidChannel(name.to_string()))
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, what: &'static str, len: usize) -> Result<&'a [u8], FramingError> {
        if self.data.len() < self.pos + len {
            return Err(FramingError::RfmpTruncated(what));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, FramingError> {
        Ok(self.bytes(what, 1)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, FramingError> {
        let b = self.bytes(what, 2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, FramingError> {
        let b = self.bytes(what, 4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn str(&mut self, what: &'static str, len: usize) -> Result<String, FramingError> {
        let b = self.bytes(what, len)?;
        String::from_utf8(b.to_vec()).map_err(|_| FramingError::RfmpBadField(what))
    }

    fn message_id(&mut self, what: &'static str) -> Result<MessageId, FramingError> {
        let b = self.bytes(what, MESSAGE_ID_LEN)?;
        let mut id = [0u8; MESSAGE_ID_LEN];
        id.copy_from_slice(b);
        Ok(MessageId(id))
    }
}
