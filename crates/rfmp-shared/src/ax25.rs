//! AX.25 UI-frame subset: address field encode/decode plus the fixed
//! control/PID bytes. Connected-mode frames are out of scope; anything that
//! is not a UI frame with PID 0xF0 is rejected.

use crate::constants::MAX_DIGIPEATERS;
use crate::error::FramingError;
use crate::types::Callsign;

/// Control byte for an unnumbered-information frame.
pub const CONTROL_UI: u8 = 0x03;

/// PID byte meaning "no layer-3 protocol".
pub const PID_NO_L3: u8 = 0xF0;

const ADDR_LEN: usize = 7;

/// Encode one 7-octet AX.25 address: six shifted ASCII octets padded with
/// space, then the SSID octet `0b011S_SSS1` with the low bit marking
/// end-of-address.
fn encode_address(cs: &Callsign, is_last: bool) -> [u8; ADDR_LEN] {
    let mut out = [b' ' << 1; ADDR_LEN];
    for (i, b) in cs.call().bytes().take(6).enumerate() {
        out[i] = b << 1;
    }
    let mut ssid = 0b0110_0000 | (cs.ssid() << 1);
    if is_last {
        ssid |= 0x01;
    }
    out[6] = ssid;
    out
}

fn decode_address(data: &[u8]) -> Result<(Callsign, bool), FramingError> {
    debug_assert_eq!(data.len(), ADDR_LEN);
    let mut call = String::with_capacity(6);
    for &b in &data[..6] {
        let c = (b >> 1) as char;
        if c != ' ' {
            call.push(c);
        }
    }
    let ssid = (data[6] >> 1) & 0x0F;
    let is_last = data[6] & 0x01 != 0;
    let cs = Callsign::new(&call, ssid)
        .map_err(|_| FramingError::Ax25Malformed("address not a valid callsign"))?;
    Ok((cs, is_last))
}

/// A decoded AX.25 UI frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiFrame {
    pub destination: Callsign,
    pub source: Callsign,
    /// Digipeater path, copied through on ingest but not interpreted.
    pub digipeaters: Vec<Callsign>,
    /// Information field: the RFMP payload.
    pub info: Vec<u8>,
}

impl UiFrame {
    pub fn new(source: Callsign, destination: Callsign, info: Vec<u8>) -> Self {
        Self {
            destination,
            source,
            digipeaters: Vec::new(),
            info,
        }
    }

    /// Serialize to the on-air byte layout:
    /// dest(7) ‖ source(7) ‖ digis(n×7) ‖ control ‖ pid ‖ info.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ADDR_LEN * (2 + self.digipeaters.len()) + 2 + self.info.len());
        out.extend_from_slice(&encode_address(&self.destination, false));
        out.extend_from_slice(&encode_address(&self.source, self.digipeaters.is_empty()));
        for (i, digi) in self.digipeaters.iter().enumerate() {
            let is_last = i == self.digipeaters.len() - 1;
            out.extend_from_slice(&encode_address(digi, is_last));
        }
        out.push(CONTROL_UI);
        out.push(PID_NO_L3);
        out.extend_from_slice(&self.info);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, FramingError> {
        if data.len() < 2 * ADDR_LEN + 2 {
            return Err(FramingError::Ax25Malformed("frame shorter than minimum"));
        }

        let (destination, dest_last) = decode_address(&data[0..ADDR_LEN])?;
        if dest_last {
            return Err(FramingError::Ax25Malformed(
                "end-of-address bit set on destination",
            ));
        }
        let (source, mut saw_last) = decode_address(&data[ADDR_LEN..2 * ADDR_LEN])?;

        let mut digipeaters = Vec::new();
        let mut idx = 2 * ADDR_LEN;
        while !saw_last {
            if digipeaters.len() == MAX_DIGIPEATERS {
                return Err(FramingError::Ax25Malformed("digipeater path too long"));
            }
            if data.len() < idx + ADDR_LEN {
                return Err(FramingError::Ax25Malformed(
                    "address field not a multiple of 7",
                ));
            }
            let (digi, is_last) = decode_address(&data[idx..idx + ADDR_LEN])?;
            digipeaters.push(digi);
            saw_last = is_last;
            idx += ADDR_LEN;
        }

        if data.len() < idx + 2 {
            return Err(FramingError::Ax25Malformed("missing control/PID"));
        }
        if data[idx] != CONTROL_UI {
            return Err(FramingError::Ax25Malformed("control byte is not UI"));
        }
        if data[idx + 1] != PID_NO_L3 {
            return Err(FramingError::Ax25Malformed("PID is not no-L3"));
        }

        Ok(Self {
            destination,
            source,
            digipeaters,
            info: data[idx + 2..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cs(s: &str) -> Callsign {
        Callsign::parse(s).unwrap()
    }

    #[test]
    fn roundtrip_no_digis() {
        let frame = UiFrame::new(cs("N0CALL-1"), cs("RFMP-0"), b"payload".to_vec());
        let decoded = UiFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn roundtrip_with_digis() {
        let mut frame = UiFrame::new(cs("K7ABC"), cs("RFMP-0"), vec![1, 2, 3]);
        frame.digipeaters = vec![cs("WIDE1-1"), cs("WIDE2-2")];
        let decoded = UiFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn address_shift_layout() {
        // "RFMP-0" destination: 'R'<<1, 'F'<<1, 'M'<<1, 'P'<<1, pad, pad.
        let frame = UiFrame::new(cs("N0CALL"), cs("RFMP-0"), Vec::new());
        let bytes = frame.encode();
        assert_eq!(bytes[0], b'R' << 1);
        assert_eq!(bytes[1], b'F' << 1);
        assert_eq!(bytes[2], b'M' << 1);
        assert_eq!(bytes[3], b'P' << 1);
        assert_eq!(bytes[4], b' ' << 1);
        assert_eq!(bytes[5], b' ' << 1);
        // SSID 0, not last.
        assert_eq!(bytes[6], 0b0110_0000);
        // Source SSID octet carries the end-of-address bit.
        assert_eq!(bytes[13] & 0x01, 0x01);
    }

    #[test]
    fn control_and_pid_fixed() {
        let frame = UiFrame::new(cs("N0CALL"), cs("RFMP-0"), b"x".to_vec());
        let bytes = frame.encode();
        assert_eq!(bytes[14], CONTROL_UI);
        assert_eq!(bytes[15], PID_NO_L3);
    }

    #[test]
    fn rejects_non_ui_control() {
        let mut bytes = UiFrame::new(cs("N0CALL"), cs("RFMP-0"), vec![]).encode();
        bytes[14] = 0x3F; // SABM
        assert!(matches!(
            UiFrame::decode(&bytes),
            Err(FramingError::Ax25Malformed(_))
        ));
    }

    #[test]
    fn rejects_wrong_pid() {
        let mut bytes = UiFrame::new(cs("N0CALL"), cs("RFMP-0"), vec![]).encode();
        bytes[15] = 0xCC;
        assert!(matches!(
            UiFrame::decode(&bytes),
            Err(FramingError::Ax25Malformed(_))
        ));
    }

    #[test]
    fn rejects_missing_end_of_address() {
        let mut bytes = UiFrame::new(cs("N0CALL"), cs("RFMP-0"), vec![]).encode();
        bytes[13] &= !0x01; // clear end-of-address on source
        assert!(matches!(
            UiFrame::decode(&bytes),
            Err(FramingError::Ax25Malformed(_))
        ));
    }

    #[test]
    fn rejects_short_frame() {
        assert!(UiFrame::decode(&[0u8; 10]).is_err());
    }
}
