use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::{FINGERPRINT_SEP, MESSAGE_ID_LEN};
use crate::error::FramingError;

/// Content-addressed message identifier: first 6 bytes of the fingerprint
/// hash, rendered as 12 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub [u8; MESSAGE_ID_LEN]);

impl MessageId {
    /// Compute the fingerprint for `(from_node, timestamp, body)`.
    ///
    /// Preimage: `callsign ‖ 0x1F ‖ be32(timestamp) ‖ 0x1F ‖ body`, hashed
    /// with SHA-256 and truncated to the first 6 bytes. Any change to the
    /// three inputs produces a different id, which is what lets receivers
    /// reject tampered MSG frames.
    pub fn fingerprint(from_node: &Callsign, timestamp: u32, body: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(from_node.to_string().as_bytes());
        hasher.update([FINGERPRINT_SEP]);
        hasher.update(timestamp.to_be_bytes());
        hasher.update([FINGERPRINT_SEP]);
        hasher.update(body);
        let digest = hasher.finalize();

        let mut id = [0u8; MESSAGE_ID_LEN];
        id.copy_from_slice(&digest[..MESSAGE_ID_LEN]);
        Self(id)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != MESSAGE_ID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; MESSAGE_ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Prefix comparison for short-id lookups. Accepts 8..=12 hex chars.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        if prefix.len() < 8 || prefix.len() > 12 {
            return false;
        }
        self.to_hex().starts_with(&prefix.to_ascii_lowercase())
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LEN] {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Message priority, 0 (urgent) through 3 (minimal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    Urgent = 0,
    Normal = 1,
    Low = 2,
    Minimal = 3,
}

impl Priority {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Urgent),
            1 => Some(Self::Normal),
            2 => Some(Self::Low),
            3 => Some(Self::Minimal),
            _ => None,
        }
    }

    /// One step lower urgency, saturating at `Minimal`. Pushes and
    /// rebroadcasts ride below fresh traffic.
    pub fn demoted(self) -> Self {
        Self::from_u8((self as u8).saturating_add(1).min(3)).unwrap_or(Self::Minimal)
    }
}

/// Amateur radio callsign with optional SSID, e.g. `N0CALL` or `N0CALL-7`.
///
/// Canonical form is uppercase ASCII, 1-6 characters, SSID 0-15. The SSID is
/// omitted from the string form when zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Callsign {
    call: String,
    ssid: u8,
}

impl Callsign {
    pub fn new(call: &str, ssid: u8) -> Result<Self, FramingError> {
        let call = call.to_ascii_uppercase();
        if call.is_empty() || call.len() > 6 {
            return Err(FramingError::InvalidCallsign(call));
        }
        if !call.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(FramingError::InvalidCallsign(call));
        }
        if ssid > 15 {
            return Err(FramingError::InvalidCallsign(format!("{call}-{ssid}")));
        }
        Ok(Self { call, ssid })
    }

    /// Parse the canonical string form (`CALL` or `CALL-N`).
    pub fn parse(s: &str) -> Result<Self, FramingError> {
        match s.split_once('-') {
            Some((call, ssid)) => {
                let ssid: u8 = ssid
                    .parse()
                    .map_err(|_| FramingError::InvalidCallsign(s.to_string()))?;
                Self::new(call, ssid)
            }
            None => Self::new(s, 0),
        }
    }

    pub fn call(&self) -> &str {
        &self.call
    }

    pub fn ssid(&self) -> u8 {
        self.ssid
    }
}

impl std::fmt::Display for Callsign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.call)
        } else {
            write!(f, "{}-{}", self.call, self.ssid)
        }
    }
}
