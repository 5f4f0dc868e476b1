use thiserror::Error;

/// Errors surfaced while decoding the framing layers (KISS, AX.25, RFMP).
///
/// All variants are drop-and-count at runtime: a malformed frame is logged,
/// a counter is incremented, and the receive loop continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("KISS stream ended inside a frame")]
    KissTruncated,

    #[error("KISS escape sequence invalid")]
    KissBadEscape,

    #[error("AX.25 frame malformed: {0}")]
    Ax25Malformed(&'static str),

    #[error("RFMP magic byte mismatch: got {0:#04x}")]
    RfmpBadMagic(u8),

    #[error("RFMP protocol version {0} not supported")]
    RfmpBadVersion(u8),

    #[error("RFMP frame type {0} unknown")]
    RfmpBadType(u8),

    #[error("RFMP frame truncated while reading {0}")]
    RfmpTruncated(&'static str),

    #[error("RFMP field out of range: {0}")]
    RfmpBadField(&'static str),

    #[error("invalid callsign: {0}")]
    InvalidCallsign(String),

    #[error("invalid channel name: {0}")]
    InvalidChannel(String),

    #[error("field too long: {0}")]
    FieldTooLong(&'static str),
}
