//! Frame control field handling and MHR encode/parse.
//!
//! PAN-ID presence follows IEEE 802.15.4-2015 Table 7-2 for version-2015
//! frames and the classic intra-PAN rule for earlier versions.
//! Addresses are kept in wire order (LSB first); short addresses occupy
//! the first two bytes of the eight-byte storage.

use crate::security::{self, SecurityParams};
use crate::types::{AddrMode, FrameType, FrameVersion};

/// Decoded frame control word plus the sequence-handling flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameControl {
    pub frame_type: FrameType,
    pub security_enabled: bool,
    pub frame_pending: bool,
    pub ack_requested: bool,
    pub intra_pan: bool,
    pub sequence_suppressed: bool,
    pub ie_present: bool,
    pub dst_addr_mode: AddrMode,
    pub frame_version: FrameVersion,
    pub src_addr_mode: AddrMode,
}

impl FrameControl {
    pub fn encode(&self) -> u16 {
        let mut fcf = self.frame_type as u16;
        if self.security_enabled {
            fcf |= 1 << 3;
        }
        if self.frame_pending {
            fcf |= 1 << 4;
        }
        if self.ack_requested {
            fcf |= 1 << 5;
        }
        if self.intra_pan {
            fcf |= 1 << 6;
        }
        if self.sequence_suppressed {
            fcf |= 1 << 8;
        }
        if self.ie_present {
            fcf |= 1 << 9;
        }
        fcf |= (self.dst_addr_mode as u16) << 10;
        fcf |= (self.frame_version as u16) << 12;
        fcf |= (self.src_addr_mode as u16) << 14;
        fcf
    }

    pub fn decode(fcf: u16) -> Option<Self> {
        let frame_version = FrameVersion::from_bits(((fcf >> 12) & 0x3) as u8)?;
        Some(Self {
            frame_type: FrameType::from_bits((fcf & 0x7) as u8)?,
            security_enabled: fcf & (1 << 3) != 0,
            frame_pending: fcf & (1 << 4) != 0,
            ack_requested: fcf & (1 << 5) != 0,
            intra_pan: fcf & (1 << 6) != 0,
            // Bits 8 and 9 are reserved before version 2015.
            sequence_suppressed: frame_version == FrameVersion::V2015 && fcf & (1 << 8) != 0,
            ie_present: frame_version == FrameVersion::V2015 && fcf & (1 << 9) != 0,
            dst_addr_mode: AddrMode::from_bits(((fcf >> 10) & 0x3) as u8)?,
            frame_version,
            src_addr_mode: AddrMode::from_bits(((fcf >> 14) & 0x3) as u8)?,
        })
    }

    /// Destination PAN field presence.
    pub fn dst_pan_present(&self) -> bool {
        if self.frame_version == FrameVersion::V2015 {
            match (self.dst_addr_mode, self.src_addr_mode) {
                (AddrMode::None, AddrMode::None) => self.intra_pan,
                (_, AddrMode::None) => !self.intra_pan,
                (AddrMode::None, _) => false,
                (AddrMode::Ext, AddrMode::Ext) => !self.intra_pan,
                // At least one short address present.
                _ => true,
            }
        } else {
            self.dst_addr_mode != AddrMode::None
        }
    }

    /// Source PAN field presence.
    pub fn src_pan_present(&self) -> bool {
        if self.frame_version == FrameVersion::V2015 {
            match (self.dst_addr_mode, self.src_addr_mode) {
                (_, AddrMode::None) => false,
                (AddrMode::None, _) => !self.intra_pan,
                (AddrMode::Ext, AddrMode::Ext) => false,
                _ => !self.intra_pan,
            }
        } else {
            self.src_addr_mode != AddrMode::None && !self.intra_pan
        }
    }

    /// PAN and address field length after the sequence number.
    pub fn address_length(&self) -> usize {
        let mut len = self.dst_addr_mode.len() + self.src_addr_mode.len();
        if self.dst_pan_present() {
            len += 2;
        }
        if self.src_pan_present() {
            len += 2;
        }
        len
    }

    /// Sequence number field presence.
    pub fn has_sequence(&self) -> bool {
        !(self.frame_version == FrameVersion::V2015 && self.sequence_suppressed)
    }
}

/// MHR fields gathered for encoding.
pub struct MhrFields<'a> {
    pub fcf: FrameControl,
    pub seq: u8,
    pub dst_pan: u16,
    pub src_pan: u16,
    pub dst_addr: &'a [u8; 8],
    pub src_addr: &'a [u8; 8],
    pub security: Option<&'a SecurityParams>,
}

/// Write the MHR (FCF through aux security header) into `buf`.
/// Returns the written length, or None when `buf` is too short.
pub fn write_mhr(buf: &mut [u8], fields: &MhrFields<'_>) -> Option<usize> {
    let fcf = fields.fcf;
    let mut need = 2 + fcf.address_length();
    if fcf.has_sequence() {
        need += 1;
    }
    let aux_len = match fields.security {
        Some(sec) if fcf.security_enabled => security::aux_header_length(sec.key_id_mode),
        _ => 0,
    };
    need += aux_len;
    if buf.len() < need {
        return None;
    }

    let mut at = 0;
    buf[at..at + 2].copy_from_slice(&fcf.encode().to_le_bytes());
    at += 2;
    if fcf.has_sequence() {
        buf[at] = fields.seq;
        at += 1;
    }
    if fcf.dst_pan_present() {
        buf[at..at + 2].copy_from_slice(&fields.dst_pan.to_le_bytes());
        at += 2;
    }
    let dlen = fcf.dst_addr_mode.len();
    buf[at..at + dlen].copy_from_slice(&fields.dst_addr[..dlen]);
    at += dlen;
    if fcf.src_pan_present() {
        buf[at..at + 2].copy_from_slice(&fields.src_pan.to_le_bytes());
        at += 2;
    }
    let slen = fcf.src_addr_mode.len();
    buf[at..at + slen].copy_from_slice(&fields.src_addr[..slen]);
    at += slen;
    if let Some(sec) = fields.security {
        if fcf.security_enabled {
            at += security::write_aux_header(&mut buf[at..], sec)?;
        }
    }
    Some(at)
}

/// Parsed MHR of a received frame.
#[derive(Clone, Copy, Debug)]
pub struct ParsedMhr {
    pub fcf: FrameControl,
    pub seq: u8,
    pub dst_pan: u16,
    pub src_pan: u16,
    pub dst_addr: [u8; 8],
    pub src_addr: [u8; 8],
    pub security: Option<SecurityParams>,
    /// Total MHR length including the aux security header.
    pub mhr_len: usize,
}

/// Parse the MHR.  Absent PAN fields inherit the peer field or
/// `default_pan` per the compression rules.
pub fn parse_mhr(data: &[u8], default_pan: u16) -> Option<ParsedMhr> {
    if data.len() < 2 {
        return None;
    }
    let fcf = FrameControl::decode(u16::from_le_bytes([data[0], data[1]]))?;
    let mut at = 2;

    let seq = if fcf.has_sequence() {
        let s = *data.get(at)?;
        at += 1;
        s
    } else {
        0
    };

    let mut dst_pan = default_pan;
    if fcf.dst_pan_present() {
        dst_pan = u16::from_le_bytes([*data.get(at)?, *data.get(at + 1)?]);
        at += 2;
    }
    let mut dst_addr = [0u8; 8];
    let dlen = fcf.dst_addr_mode.len();
    dst_addr[..dlen].copy_from_slice(data.get(at..at + dlen)?);
    at += dlen;

    let mut src_pan = dst_pan;
    if fcf.src_pan_present() {
        src_pan = u16::from_le_bytes([*data.get(at)?, *data.get(at + 1)?]);
        at += 2;
    }
    let mut src_addr = [0u8; 8];
    let slen = fcf.src_addr_mode.len();
    src_addr[..slen].copy_from_slice(data.get(at..at + slen)?);
    at += slen;

    let security = if fcf.security_enabled {
        let (params, aux_len) = security::parse_aux_header(data.get(at..)?)?;
        at += aux_len;
        Some(params)
    } else {
        None
    };

    Some(ParsedMhr {
        fcf,
        seq,
        dst_pan,
        src_pan,
        dst_addr,
        src_addr,
        security,
        mhr_len: at,
    })
}
