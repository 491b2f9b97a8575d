//! Shared MAC types: status taxonomy, addressing, channel pages and the
//! protocol constants used across the MLME/MCPS machinery.

/// Status codes surfaced through confirms and indications.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacStatus {
    Success,
    BusyChannel,
    NoAck,
    FrameTooLong,
    InvalidParameter,
    UnavailableKey,
    CounterError,
    SecurityFail,
    ImproperSecurityLevel,
    UnsupportedSecurity,
    UnsupportedLegacy,
    TransactionOverflow,
    TransactionExpired,
    TrxOff,
    NoData,
    ScanInProgress,
    LimitReached,
    InvalidHandle,
    InvalidAddress,
    InvalidIndex,
    UnsupportedAttribute,
    NoBeacon,
}

/// Addressing mode field of the frame control word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AddrMode {
    #[default]
    None = 0,
    Short = 2,
    Ext = 3,
}

impl AddrMode {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(AddrMode::None),
            2 => Some(AddrMode::Short),
            3 => Some(AddrMode::Ext),
            _ => None,
        }
    }

    /// On-air address length in bytes.
    pub fn len(self) -> usize {
        match self {
            AddrMode::None => 0,
            AddrMode::Short => 2,
            AddrMode::Ext => 8,
        }
    }
}

/// Frame version field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum FrameVersion {
    #[default]
    V2003 = 0,
    V2006 = 1,
    V2015 = 2,
}

impl FrameVersion {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(FrameVersion::V2003),
            1 => Some(FrameVersion::V2006),
            2 => Some(FrameVersion::V2015),
            _ => None,
        }
    }
}

/// Frame type field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FrameType {
    Beacon = 0,
    #[default]
    Data = 1,
    Ack = 2,
    Cmd = 3,
}

impl FrameType {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(FrameType::Beacon),
            1 => Some(FrameType::Data),
            2 => Some(FrameType::Ack),
            3 => Some(FrameType::Cmd),
            _ => None,
        }
    }
}

/// MAC command frame identifiers (the ones this core emits or consumes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacCommand {
    DataReq,
    BeaconReq,
    Other(u8),
}

impl MacCommand {
    pub fn id(self) -> u8 {
        match self {
            MacCommand::DataReq => 0x04,
            MacCommand::BeaconReq => 0x07,
            MacCommand::Other(id) => id,
        }
    }

    pub fn from_id(id: u8) -> Self {
        match id {
            0x04 => MacCommand::DataReq,
            0x07 => MacCommand::BeaconReq,
            other => MacCommand::Other(other),
        }
    }
}

/// Channel page, selecting the modulation and symbol-rate map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ChannelPage {
    #[default]
    Page0 = 0,
    Page1 = 1,
    Page2 = 2,
    Page3 = 3,
    Page4 = 4,
    Page5 = 5,
    Page6 = 6,
    Page9 = 9,
    Page10 = 10,
}

impl ChannelPage {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ChannelPage::Page0),
            1 => Some(ChannelPage::Page1),
            2 => Some(ChannelPage::Page2),
            3 => Some(ChannelPage::Page3),
            4 => Some(ChannelPage::Page4),
            5 => Some(ChannelPage::Page5),
            6 => Some(ChannelPage::Page6),
            9 => Some(ChannelPage::Page9),
            10 => Some(ChannelPage::Page10),
            _ => None,
        }
    }
}

/// Symbols per second for a page/channel pair.  Page 0 splits at
/// channels 0 and 10 (868 BPSK / 915 BPSK / 2450 O-QPSK), page 6 at 9.
pub fn channel_symbol_rate(page: ChannelPage, channel: u8) -> u32 {
    match page {
        ChannelPage::Page0 => {
            if channel == 0 {
                20_000
            } else if (1..=10).contains(&channel) {
                40_000
            } else {
                62_500
            }
        }
        ChannelPage::Page1 => {
            if channel == 0 {
                12_500
            } else {
                50_000
            }
        }
        ChannelPage::Page2 => {
            if channel == 0 {
                25_000
            } else {
                62_500
            }
        }
        ChannelPage::Page3 => 167_000,
        ChannelPage::Page6 => {
            if channel <= 9 {
                20_000
            } else {
                100_000
            }
        }
        _ => 62_500,
    }
}

/// A scan channel set: page plus a mask of up to 256 channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelList {
    pub page: ChannelPage,
    pub mask: [u32; 8],
}

impl Default for ChannelList {
    fn default() -> Self {
        Self {
            page: ChannelPage::Page0,
            mask: [0; 8],
        }
    }
}

impl ChannelList {
    /// Pop the lowest enabled channel from the mask.  Pages 9 and 10 use
    /// the full eight words; the classic pages only the first.
    pub fn take_next_channel(&mut self) -> Option<u8> {
        let words = match self.page {
            ChannelPage::Page9 | ChannelPage::Page10 => 8,
            _ => 1,
        };
        for (w, word) in self.mask.iter_mut().take(words).enumerate() {
            if *word != 0 {
                let bit = word.trailing_zeros();
                *word &= !(1 << bit);
                return Some((w as u32 * 32 + bit) as u8);
            }
        }
        None
    }
}

/// One base superframe in symbols.
pub const BASE_SUPERFRAME_DURATION: u32 = 960;

/// Unit backoff period in symbols.
pub const UNIT_BACKOFF_PERIOD: u32 = 20;

/// Slot length of the high-resolution timer, in microseconds.
pub const SLOT_TIME_US: u32 = 50;

/// Largest classic PHY packet (127 bytes) and its FCS overhead.
pub const MAX_PHY_PACKET_SIZE: u16 = 127;
pub const FCS_LENGTH: u16 = 2;

/// Minimum MAC overhead assumed when validating request lengths.
pub const DATA_PACKET_MIN_HEADER_LENGTH: u16 = 23;

/// Payloads above this need a 2006+ version marker on a classic PHY.
pub const MAX_SAFE_PAYLOAD_SIZE: u16 = 102;

/// Upper bound for an enhanced ACK frame.
pub const ENHANCED_ACK_MAX_LENGTH: u16 = 255;

/// Scan results are capped at this many PAN descriptors.
pub const MLME_MAC_RES_SIZE_MAX: usize = 16;

/// FHSS synchronization info carried at the tail of beacon payloads.
pub const FHSS_SYNCH_INFO_LENGTH: usize = 21;

/// Indirect-data housekeeping cadence in milliseconds.
pub const MAC_INDIRECT_TICK_MS: u32 = 100;

/// Default indirect-entry lifetime in milliseconds.
pub const MAC_INDIRECT_TIMEOUT_MS: u32 = 7000;
