//! Frame buffers: the pre-built TX frame and the pre-parsed RX frame.
//!
//! Both sides keep their dynamic storage (payload, IE vectors, raw
//! bytes) in heap-owned buffers so every queued frame is accounted for
//! by the allocator and freed exactly once.  Buffers carry an owned
//! `next` link; queue membership is ownership.

use meshcore_mem::{HeapBox, HeapBytes};

use crate::fcf::{FrameControl, ParsedMhr};
use crate::ie::IeRegions;
use crate::security::SecurityParams;
use crate::types::{MacCommand, MacStatus};

/// Transmit priority; higher wins, FIFO within a class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TxPriority {
    Low = 0,
    Med = 1,
    High = 2,
}

/// A frame under construction or queued for transmission.
pub struct PreBuiltFrame {
    pub fcf: FrameControl,
    pub dsn: u8,
    pub dst_pan: u16,
    pub src_pan: u16,
    pub dst_addr: [u8; 8],
    pub src_addr: [u8; 8],
    pub security: SecurityParams,
    pub mic_len: u8,
    /// MHR length including the aux security header; zero means a raw
    /// passthrough payload (no MAC header is built).
    pub header_length_with_security: u16,
    pub msdu_handle: u8,
    /// Command id for MAC command frames; carried as open payload.
    pub command_id: Option<MacCommand>,
    pub payload: Option<HeapBytes>,
    /// Pre-encoded header/payload IE vectors (terminators excluded).
    pub header_ies: Option<HeapBytes>,
    pub payload_ies: Option<HeapBytes>,
    pub priority: TxPriority,
    /// True for MCPS requests from the upper layer (vs. MAC-internal
    /// command/beacon traffic).
    pub upper_layer_request: bool,
    pub asynch_request: bool,
    /// Parked for a polling child instead of sent directly.
    pub indirect: bool,
    /// Remaining indirect lifetime, milliseconds.
    pub indirect_ttl_ms: u32,
    /// Extra driver CCA periods under FHSS multi-CCA.
    pub csma_periods_left: u8,
    /// Absolute PHY transmit time (CSMA-extension drivers), µs.
    pub tx_time: u32,
    /// Retry counts accumulated across FHSS requeues.
    pub fhss_retry_count: u8,
    pub fhss_cca_retry_count: u8,
    pub status: MacStatus,
    pub next: Option<HeapBox<PreBuiltFrame>>,
}

impl PreBuiltFrame {
    pub fn new() -> Self {
        Self {
            fcf: FrameControl::default(),
            dsn: 0,
            dst_pan: 0xFFFF,
            src_pan: 0xFFFF,
            dst_addr: [0; 8],
            src_addr: [0; 8],
            security: SecurityParams::default(),
            mic_len: 0,
            header_length_with_security: 0,
            msdu_handle: 0,
            command_id: None,
            payload: None,
            header_ies: None,
            payload_ies: None,
            priority: TxPriority::Low,
            upper_layer_request: false,
            asynch_request: false,
            indirect: false,
            indirect_ttl_ms: 0,
            csma_periods_left: 0,
            tx_time: 0,
            fhss_retry_count: 0,
            fhss_cca_retry_count: 0,
            status: MacStatus::Success,
            next: None,
        }
    }

    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map_or(0, |p| p.len())
    }

    pub fn header_ies_len(&self) -> usize {
        self.header_ies.as_ref().map_or(0, |p| p.len())
    }

    pub fn payload_ies_len(&self) -> usize {
        self.payload_ies.as_ref().map_or(0, |p| p.len())
    }

    /// Bytes after the MHR, terminators included.
    pub fn total_payload_length(&self) -> usize {
        self.payload_len()
            + self.header_ies_len()
            + self.payload_ies_len()
            + crate::ie::terminator_overhead(
                self.header_ies_len() > 0,
                self.payload_ies_len() > 0,
                self.payload_len() > 0,
            )
    }

    pub fn ack_requested(&self) -> bool {
        self.fcf.ack_requested
    }
}

impl Default for PreBuiltFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// A received frame: raw bytes plus everything parsed out of them.
pub struct PreParsedFrame {
    /// The MAC frame as received (FCS already stripped by the driver).
    pub raw: HeapBytes,
    pub mhr: ParsedMhr,
    /// IE/payload regions, offsets relative to the end of the MHR.
    pub regions: IeRegions,
    /// Length of the decrypted content after the MHR (MIC excluded).
    pub content_len: usize,
    pub lqi: u8,
    pub rssi_dbm: i8,
    pub timestamp: u32,
    /// Device-table slot of the sender, when known.
    pub device_index: Option<usize>,
    pub next: Option<HeapBox<PreParsedFrame>>,
}

impl PreParsedFrame {
    /// Content bytes after the MHR (IEs plus payload).
    pub fn content(&self) -> &[u8] {
        &self.raw.as_slice()[self.mhr.mhr_len..self.mhr.mhr_len + self.content_len]
    }

    /// The MAC data payload region.
    pub fn mac_payload(&self) -> &[u8] {
        let (at, len) = self.regions.payload;
        &self.content()[at..at + len]
    }

    pub fn header_ies(&self) -> &[u8] {
        let (at, len) = self.regions.header_ie;
        &self.content()[at..at + len]
    }

    pub fn payload_ies(&self) -> &[u8] {
        let (at, len) = self.regions.payload_ie;
        &self.content()[at..at + len]
    }
}
