//! MAC security: the auxiliary header, the CCM* transformation, and the
//! key/device description tables (the security MIB).
//!
//! The CCM* engine follows IEEE 802.15.4 Annex B with a 13-byte nonce
//! (source EUI-64, frame counter, security level) and L = 2.  Security
//! levels map to a MIC of 0/4/8/16 bytes, with payload encryption for
//! levels 4..=7; auth-only levels fold the payload into the
//! authenticated region.  The MIC is always masked with the level-0
//! keystream block, so auth-only and encrypted frames share one code
//! path.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

/// Security parameters carried in (or destined for) an aux header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SecurityParams {
    pub level: u8,
    pub key_id_mode: u8,
    pub key_index: u8,
    pub key_source: [u8; 8],
    pub frame_counter: u32,
}

/// MIC length for a security level.
pub fn mic_length(level: u8) -> usize {
    match level & 0x3 {
        0 => 0,
        1 => 4,
        2 => 8,
        _ => 16,
    }
}

/// Aux security header length for a key-id mode.
pub fn aux_header_length(key_id_mode: u8) -> usize {
    5 + match key_id_mode {
        0 => 0,
        1 => 1,
        2 => 5,
        _ => 9,
    }
}

/// Encode the aux security header.  Returns the written length.
pub fn write_aux_header(buf: &mut [u8], sec: &SecurityParams) -> Option<usize> {
    let len = aux_header_length(sec.key_id_mode);
    if buf.len() < len {
        return None;
    }
    buf[0] = (sec.level & 0x7) | ((sec.key_id_mode & 0x3) << 3);
    buf[1..5].copy_from_slice(&sec.frame_counter.to_le_bytes());
    let mut at = 5;
    match sec.key_id_mode {
        2 => {
            buf[at..at + 4].copy_from_slice(&sec.key_source[..4]);
            at += 4;
        }
        3 => {
            buf[at..at + 8].copy_from_slice(&sec.key_source);
            at += 8;
        }
        _ => {}
    }
    if sec.key_id_mode != 0 {
        buf[at] = sec.key_index;
        at += 1;
    }
    Some(at)
}

/// Parse an aux security header; returns the parameters and length.
pub fn parse_aux_header(data: &[u8]) -> Option<(SecurityParams, usize)> {
    if data.len() < 5 {
        return None;
    }
    let level = data[0] & 0x7;
    let key_id_mode = (data[0] >> 3) & 0x3;
    let frame_counter = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
    let need = aux_header_length(key_id_mode);
    if data.len() < need {
        return None;
    }
    let mut key_source = [0u8; 8];
    let mut at = 5;
    match key_id_mode {
        2 => {
            key_source[..4].copy_from_slice(&data[at..at + 4]);
            at += 4;
        }
        3 => {
            key_source.copy_from_slice(&data[at..at + 8]);
            at += 8;
        }
        _ => {}
    }
    let key_index = if key_id_mode != 0 {
        let idx = data[at];
        at += 1;
        idx
    } else {
        0
    };
    Some((
        SecurityParams {
            level,
            key_id_mode,
            key_index,
            key_source,
            frame_counter,
        },
        at,
    ))
}

/// CCM* nonce: source EUI-64, frame counter (big-endian), level.
pub fn build_nonce(source_eui64: &[u8; 8], frame_counter: u32, level: u8) -> [u8; 13] {
    let mut nonce = [0u8; 13];
    nonce[..8].copy_from_slice(source_eui64);
    nonce[8..12].copy_from_slice(&frame_counter.to_be_bytes());
    nonce[12] = level;
    nonce
}

// =============================================================================
// CCM* engine
// =============================================================================

const BLOCK: usize = 16;

pub struct CcmStar {
    cipher: Aes128,
}

impl CcmStar {
    pub fn new(key: &[u8; 16]) -> Self {
        Self {
            cipher: Aes128::new(GenericArray::from_slice(key)),
        }
    }

    fn cipher_block(&self, block: &mut [u8; BLOCK]) {
        let ga = GenericArray::from_mut_slice(block);
        self.cipher.encrypt_block(ga);
    }

    /// CBC-MAC over B0, the authenticated data and the message.
    fn compute_tag(&self, nonce: &[u8; 13], auth: &[u8], msg: &[u8], mic_len: usize) -> [u8; BLOCK] {
        let mut state = [0u8; BLOCK];
        state[0] = 0x01
            | (((mic_len as u8).saturating_sub(2) / 2) << 3)
            | if auth.is_empty() { 0 } else { 0x40 };
        state[1..14].copy_from_slice(nonce);
        state[14..16].copy_from_slice(&(msg.len() as u16).to_be_bytes());
        self.cipher_block(&mut state);

        if !auth.is_empty() {
            // First auth block starts with the 16-bit length.
            let mut block = [0u8; BLOCK];
            block[..2].copy_from_slice(&(auth.len() as u16).to_be_bytes());
            let first = auth.len().min(BLOCK - 2);
            block[2..2 + first].copy_from_slice(&auth[..first]);
            xor_block(&mut state, &block);
            self.cipher_block(&mut state);
            let mut at = first;
            while at < auth.len() {
                let mut block = [0u8; BLOCK];
                let n = (auth.len() - at).min(BLOCK);
                block[..n].copy_from_slice(&auth[at..at + n]);
                xor_block(&mut state, &block);
                self.cipher_block(&mut state);
                at += n;
            }
        }

        let mut at = 0;
        while at < msg.len() {
            let mut block = [0u8; BLOCK];
            let n = (msg.len() - at).min(BLOCK);
            block[..n].copy_from_slice(&msg[at..at + n]);
            xor_block(&mut state, &block);
            self.cipher_block(&mut state);
            at += n;
        }
        state
    }

    /// Keystream block A_i for counter `i`.
    fn keystream(&self, nonce: &[u8; 13], counter: u16) -> [u8; BLOCK] {
        let mut block = [0u8; BLOCK];
        block[0] = 0x01;
        block[1..14].copy_from_slice(nonce);
        block[14..16].copy_from_slice(&counter.to_be_bytes());
        self.cipher_block(&mut block);
        block
    }

    fn ctr_xor(&self, nonce: &[u8; 13], data: &mut [u8]) {
        let mut counter = 1u16;
        let mut at = 0;
        while at < data.len() {
            let ks = self.keystream(nonce, counter);
            let n = (data.len() - at).min(BLOCK);
            for i in 0..n {
                data[at + i] ^= ks[i];
            }
            counter = counter.wrapping_add(1);
            at += n;
        }
    }

    /// Secure `frame` in place.  `frame[..open_len]` is the open header
    /// (MHR, aux header, and an open command byte for command frames);
    /// the remainder up to `mic_len` from the end is the payload; the
    /// last `mic_len` bytes receive the MIC.
    pub fn encrypt_in_place(
        &self,
        nonce: &[u8; 13],
        level: u8,
        frame: &mut [u8],
        open_len: usize,
    ) -> bool {
        let mic_len = mic_length(level);
        if frame.len() < open_len + mic_len {
            return false;
        }
        let payload_end = frame.len() - mic_len;

        if mic_len > 0 {
            let (auth, msg) = if level & 0x4 != 0 {
                frame[..payload_end].split_at(open_len)
            } else {
                // Auth-only: everything is authenticated data.
                (&frame[..payload_end], &frame[..0])
            };
            let tag = self.compute_tag(nonce, auth, msg, mic_len);
            let s0 = self.keystream(nonce, 0);
            for i in 0..mic_len {
                frame[payload_end + i] = tag[i] ^ s0[i];
            }
        }
        if level & 0x4 != 0 {
            self.ctr_xor(nonce, &mut frame[open_len..payload_end]);
        }
        true
    }

    /// Reverse of [`encrypt_in_place`]: decrypt the payload and verify
    /// the MIC.  Returns false on verification failure (the payload is
    /// left decrypted; callers drop the frame).
    pub fn decrypt_in_place(
        &self,
        nonce: &[u8; 13],
        level: u8,
        frame: &mut [u8],
        open_len: usize,
    ) -> bool {
        let mic_len = mic_length(level);
        if frame.len() < open_len + mic_len {
            return false;
        }
        let payload_end = frame.len() - mic_len;

        if level & 0x4 != 0 {
            self.ctr_xor(nonce, &mut frame[open_len..payload_end]);
        }
        if mic_len == 0 {
            return true;
        }
        let (auth, msg) = if level & 0x4 != 0 {
            frame[..payload_end].split_at(open_len)
        } else {
            (&frame[..payload_end], &frame[..0])
        };
        let tag = self.compute_tag(nonce, auth, msg, mic_len);
        let s0 = self.keystream(nonce, 0);
        let mut diff = 0u8;
        for i in 0..mic_len {
            diff |= frame[payload_end + i] ^ tag[i] ^ s0[i];
        }
        diff == 0
    }
}

fn xor_block(state: &mut [u8; BLOCK], block: &[u8; BLOCK]) {
    for i in 0..BLOCK {
        state[i] ^= block[i];
    }
}

// =============================================================================
// Security MIB: key and device description tables
// =============================================================================

pub const KEY_TABLE_SIZE: usize = 4;
pub const DEVICE_TABLE_SIZE: usize = 32;

/// Peer device descriptor: addresses and the incoming frame counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub pan_id: u16,
    pub short_addr: u16,
    pub ext_addr: [u8; 8],
    pub frame_counter: u32,
    pub exempt: bool,
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self {
            pan_id: 0xFFFF,
            short_addr: 0xFFFF,
            ext_addr: [0; 8],
            frame_counter: 0,
            exempt: false,
        }
    }
}

/// Key descriptor with its lookup material.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyDescriptor {
    pub key: [u8; 16],
    pub lookup_index: u8,
    pub lookup_source: [u8; 8],
}

/// The security MIB held inside the MAC state.
pub struct SecurityMaterial {
    pub keys: [Option<KeyDescriptor>; KEY_TABLE_SIZE],
    pub devices: [Option<DeviceDescriptor>; DEVICE_TABLE_SIZE],
    pub default_key_source: [u8; 8],
    pub frame_counter: u32,
}

impl SecurityMaterial {
    pub const fn new() -> Self {
        Self {
            keys: [None; KEY_TABLE_SIZE],
            devices: [None; DEVICE_TABLE_SIZE],
            default_key_source: [0; 8],
            frame_counter: 0,
        }
    }

    /// Resolve a key from aux-header parameters.
    ///
    /// Mode 1 matches by index against the default key source; modes 2
    /// and 3 also match the explicit source.  Mode 0 (implicit) falls
    /// back to the first installed key.
    pub fn key_lookup(&self, params: &SecurityParams) -> Option<&KeyDescriptor> {
        match params.key_id_mode {
            0 => self.keys.iter().flatten().next(),
            1 => self
                .keys
                .iter()
                .flatten()
                .find(|k| k.lookup_index == params.key_index),
            _ => self.keys.iter().flatten().find(|k| {
                k.lookup_index == params.key_index && k.lookup_source == params.key_source
            }),
        }
    }

    /// Find a device by its source address.
    pub fn device_lookup(
        &self,
        mode: crate::types::AddrMode,
        addr: &[u8; 8],
        pan_id: u16,
    ) -> Option<usize> {
        use crate::types::AddrMode;
        self.devices.iter().position(|d| match (mode, d) {
            (AddrMode::Short, Some(d)) => {
                d.short_addr == u16::from_le_bytes([addr[0], addr[1]])
                    && (d.pan_id == pan_id || d.pan_id == 0xFFFF)
            }
            (AddrMode::Ext, Some(d)) => d.ext_addr == *addr,
            _ => false,
        })
    }
}
