//! Service access point types: MCPS/MLME requests, confirms and
//! indications, and the upper-layer callback trait.

use bitflags::bitflags;

use crate::pib::PibAttribute;
use crate::security::SecurityParams;
use crate::types::{AddrMode, ChannelList, ChannelPage, MacStatus, MLME_MAC_RES_SIZE_MAX};

bitflags! {
    /// MCPS-DATA.request transmit options.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TxOptions: u8 {
        /// Request an acknowledgement.
        const ACK_REQUESTED = 1 << 0;
        /// Park the frame for the destination to poll (indirect TX).
        const INDIRECT = 1 << 2;
        /// Set the frame-pending bit in the outgoing FCF.
        const PENDING_BIT = 1 << 3;
        /// Suppress the sequence number (version-2015 frames only).
        const SEQ_SUPPRESSED = 1 << 4;
        /// PAN-ID suppression input to the 2015 compression rules.
        const PAN_ID_SUPPRESSED = 1 << 5;
        /// Asynchronous transmission bypassing the channel schedule;
        /// extension mode only, never combined with `ACK_REQUESTED`.
        const ASYNCH = 1 << 6;
    }
}

/// Security selection carried in requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SecuritySelection {
    pub level: u8,
    pub key_id_mode: u8,
    pub key_index: u8,
    pub key_source: [u8; 8],
}

/// MCPS-DATA.request.
#[derive(Clone, Copy, Debug)]
pub struct DataRequest<'a> {
    pub src_addr_mode: AddrMode,
    pub dst_addr_mode: AddrMode,
    pub dst_pan_id: u16,
    pub dst_addr: [u8; 8],
    pub msdu: &'a [u8],
    pub msdu_handle: u8,
    pub options: TxOptions,
    pub key: SecuritySelection,
}

impl<'a> DataRequest<'a> {
    pub fn to_short(dst_pan_id: u16, dst_short: u16, msdu: &'a [u8], handle: u8) -> Self {
        let mut dst_addr = [0u8; 8];
        dst_addr[..2].copy_from_slice(&dst_short.to_le_bytes());
        Self {
            src_addr_mode: AddrMode::None,
            dst_addr_mode: AddrMode::Short,
            dst_pan_id,
            dst_addr,
            msdu,
            msdu_handle: handle,
            options: TxOptions::empty(),
            key: SecuritySelection::default(),
        }
    }
}

/// Pre-encoded IE vectors attached to an extended data request.
#[derive(Clone, Copy, Debug, Default)]
pub struct IeList<'a> {
    pub header_ies: &'a [u8],
    pub payload_ies: &'a [u8],
}

/// MCPS-DATA.confirm.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataConfirm {
    pub msdu_handle: u8,
    pub status: MacStatus,
    pub cca_retries: u8,
    pub tx_retries: u8,
    pub timestamp: u32,
}

/// Acknowledgement content attached to an extended data confirm.
#[derive(Clone, Copy, Debug, Default)]
pub struct AckPayload<'a> {
    pub payload: &'a [u8],
    pub header_ies: &'a [u8],
    pub payload_ies: &'a [u8],
}

/// MCPS-DATA.indication.
#[derive(Clone, Copy, Debug)]
pub struct DataIndication<'a> {
    pub src_addr_mode: AddrMode,
    pub src_pan_id: u16,
    pub src_addr: [u8; 8],
    pub dst_addr_mode: AddrMode,
    pub dst_pan_id: u16,
    pub dst_addr: [u8; 8],
    pub msdu: &'a [u8],
    pub header_ies: &'a [u8],
    pub payload_ies: &'a [u8],
    pub mpdu_linkquality: u8,
    pub signal_dbm: i8,
    pub timestamp: u32,
    pub dsn: u8,
    pub security: SecurityParams,
}

/// MLME-POLL.request.
#[derive(Clone, Copy, Debug)]
pub struct PollRequest {
    pub coord_addr_mode: AddrMode,
    pub coord_pan_id: u16,
    pub coord_address: [u8; 8],
    pub key: SecuritySelection,
}

/// MLME-START.request (the subset a non-beaconing PAN uses).
#[derive(Clone, Copy, Debug)]
pub struct StartRequest {
    pub pan_id: u16,
    pub logical_channel: u8,
    pub channel_page: ChannelPage,
    pub pan_coordinator: bool,
    pub rx_on_when_idle: bool,
}

/// Scan flavors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanType {
    EnergyDetect,
    Active,
    Passive,
    Orphan,
}

/// MLME-SCAN.request.
#[derive(Clone, Copy, Debug)]
pub struct ScanRequest {
    pub scan_type: ScanType,
    pub channels: ChannelList,
    /// Dwell exponent: per-channel time is
    /// `aBaseSuperframeDuration * (2^duration + 1)` symbols.
    pub duration: u8,
    pub key: SecuritySelection,
}

/// One discovered PAN.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PanDescriptor {
    pub coord_addr_mode: AddrMode,
    pub coord_address: [u8; 8],
    pub coord_pan_id: u16,
    pub logical_channel: u8,
    pub channel_page: ChannelPage,
    pub superframe_spec: [u8; 2],
    pub gts_permit: bool,
    pub link_quality: u8,
    pub timestamp: u32,
}

/// MLME-SCAN.confirm.
#[derive(Clone, Debug)]
pub struct ScanConfirm {
    pub status: MacStatus,
    pub scan_type: ScanType,
    pub unscanned: ChannelList,
    pub ed_values: heapless::Vec<u8, MLME_MAC_RES_SIZE_MAX>,
    pub pan_descriptors: heapless::Vec<PanDescriptor, MLME_MAC_RES_SIZE_MAX>,
}

/// MLME-BEACON-NOTIFY.indication.
#[derive(Clone, Copy, Debug)]
pub struct BeaconIndication<'a> {
    pub descriptor: PanDescriptor,
    pub bsn: u8,
    pub payload: &'a [u8],
}

/// MLME-COMM-STATUS.indication: a dropped secured frame and why.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommStatusIndication {
    pub status: MacStatus,
    pub src_addr_mode: AddrMode,
    pub src_addr: [u8; 8],
    pub dst_addr_mode: AddrMode,
    pub dst_addr: [u8; 8],
    pub pan_id: u16,
    pub security: SecurityParams,
}

/// Asynchronous MLME confirms.
#[derive(Clone, Copy, Debug)]
pub enum MlmeConfirm<'a> {
    Scan(&'a ScanConfirm),
    Start(MacStatus),
    Poll(MacStatus),
}

/// Unsolicited MLME indications.
#[derive(Clone, Copy, Debug)]
pub enum MlmeIndication<'a> {
    BeaconNotify(&'a BeaconIndication<'a>),
    CommStatus(&'a CommStatusIndication),
}

/// MLME-GET/SET argument plumbing lives in [`crate::pib`]; requests that
/// target an indexed table carry the index here.
#[derive(Clone, Copy, Debug)]
pub struct AttributeRef {
    pub attribute: PibAttribute,
    pub index: u8,
}

/// Upper-layer callbacks registered with the MAC.
///
/// Every callback runs on the event-loop thread, outside the MAC state
/// borrow, so implementations may call back into the MAC freely.
pub trait MacCallbacks: Sync {
    fn data_confirm(&self, confirm: &DataConfirm, ack: Option<&AckPayload<'_>>);
    fn data_indication(&self, indication: &DataIndication<'_>);
    fn purge_confirm(&self, msdu_handle: u8, status: MacStatus);
    fn mlme_confirm(&self, confirm: &MlmeConfirm<'_>);
    fn mlme_indication(&self, indication: &MlmeIndication<'_>);
}
