/// RFMP magic byte ('R'), first octet of every RFMP payload.
pub const RFMP_MAGIC: u8 = 0x52;

/// Protocol version carried in the high nibble of the second header octet.
pub const RFMP_VERSION: u8 = 0x3;

/// Field separator used in the message-ID fingerprint preimage.
pub const FINGERPRINT_SEP: u8 = 0x1F;

/// Message ID length in raw bytes (12 hex chars when rendered).
pub const MESSAGE_ID_LEN: usize = 6;

/// Default destination callsign for RFMP broadcasts.
pub const DEFAULT_DESTINATION: &str = "RFMP-0";

/// Default air MTU: maximum RFMP payload bytes per AX.25 UI frame.
pub const DEFAULT_MTU: usize = 200;

/// FRAG frame overhead: hdr(2) + id(6) + seq(1) + total(1) + len(2).
pub const FRAG_OVERHEAD: usize = 12;

/// Application limit on message body size in bytes.
pub const MAX_BODY_LEN: usize = 500;

/// Protocol limit on message body size (u16 length field).
pub const MAX_BODY_LEN_WIRE: usize = 65_535;

/// Maximum author nickname length in bytes.
pub const MAX_AUTHOR_LEN: usize = 32;

/// Maximum channel name length in bytes.
pub const MAX_CHANNEL_LEN: usize = 32;

/// Number of Bloom windows carried in a SYNC frame.
pub const SYNC_WINDOW_COUNT: usize = 3;

/// Default Bloom filter size exponent (2^10 = 1024 bits).
pub const DEFAULT_BLOOM_M_LOG2: u8 = 10;

/// Default number of Bloom hash functions.
pub const DEFAULT_BLOOM_K: u8 = 4;

/// Accepted range for a received SYNC window's m_log2.
pub const BLOOM_M_LOG2_MIN: u8 = 6;
pub const BLOOM_M_LOG2_MAX: u8 = 14;

/// Maximum message IDs carried in one REQ frame.
pub const REQ_MAX_IDS: usize = 255;

/// Maximum digipeater addresses in an AX.25 address field.
pub const MAX_DIGIPEATERS: usize = 8;
