//! The PAN Information Base: attribute storage, identifiers and values.
//!
//! Validation and write-through to the PHY happen in the MLME set/get
//! handlers; this module only owns the data.

use heapless::Vec;

use crate::security::{DeviceDescriptor, KeyDescriptor, SecurityParams};
use crate::types::ChannelPage;

/// Longest beacon payload the PIB stores.
pub const MAX_BEACON_PAYLOAD: usize = 75;

/// Default ACK wait in 50 µs slots.
pub const DEFAULT_ACK_WAIT_SLOTS: u16 = 120;

/// Settable/readable attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PibAttribute {
    ShortAddress,
    PanId,
    ExtendedAddress,
    CurrentChannel,
    MinBe,
    MaxBe,
    MaxCsmaBackoffs,
    MaxFrameRetries,
    FrameCounter,
    RxOnWhenIdle,
    SecurityEnabled,
    GtsPermit,
    PromiscuousMode,
    BeaconPayload,
    BeaconPayloadLength,
    DeviceTable,
    KeyTable,
    DefaultKeySource,
    AutoRequestKeyIndex,
    AutoRequestKeyIdMode,
    AutoRequestSecurityLevel,
    AutoRequestKeySource,
    AcceptAnyBeacon,
    BroadcastDisabled,
    CoordShortAddress,
    CoordExtendedAddress,
    AckWaitDuration,
}

/// Attribute values crossing the MLME-SET/GET boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PibValue {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    Ext([u8; 8]),
    Key(KeyDescriptor),
    Device(DeviceDescriptor),
    BeaconPayload(Vec<u8, MAX_BEACON_PAYLOAD>),
}

/// The writable MAC configuration.
pub struct Pib {
    pub short_address: u16,
    pub pan_id: u16,
    pub mac64: [u8; 8],
    pub current_channel: u8,
    pub channel_page: ChannelPage,
    pub min_be: u8,
    pub max_be: u8,
    pub max_csma_backoffs: u8,
    pub max_frame_retries: u8,
    pub rx_on_when_idle: bool,
    pub security_enabled: bool,
    pub gts_permit: bool,
    pub promiscuous_mode: bool,
    pub accept_any_beacon: bool,
    pub broadcast_disabled: bool,
    pub beacon_payload: Vec<u8, MAX_BEACON_PAYLOAD>,
    pub auto_request: SecurityParams,
    pub coord_short_address: u16,
    pub coord_ext_address: [u8; 8],
    pub ack_wait_slots: u16,
}

impl Pib {
    pub const fn new() -> Self {
        Self {
            short_address: 0xFFFF,
            pan_id: 0xFFFF,
            mac64: [0; 8],
            current_channel: 11,
            channel_page: ChannelPage::Page0,
            min_be: 3,
            max_be: 5,
            max_csma_backoffs: 4,
            max_frame_retries: 3,
            rx_on_when_idle: true,
            security_enabled: false,
            gts_permit: false,
            promiscuous_mode: false,
            accept_any_beacon: false,
            broadcast_disabled: false,
            beacon_payload: Vec::new(),
            auto_request: SecurityParams {
                level: 0,
                key_id_mode: 0,
                key_index: 0,
                key_source: [0; 8],
                frame_counter: 0,
            },
            coord_short_address: 0xFFFF,
            coord_ext_address: [0; 8],
            ack_wait_slots: DEFAULT_ACK_WAIT_SLOTS,
        }
    }

    /// A short address below 0xFFFE is usable as a source address.
    pub fn short_address_valid(&self) -> bool {
        self.short_address < 0xFFFE
    }
}

impl Default for Pib {
    fn default() -> Self {
        Self::new()
    }
}
