//! PHY driver contract.
//!
//! Only byte slices and plain values cross this boundary: the MAC hands
//! the driver a fully built frame (without PHY header/tail bytes, which
//! the driver owns) and the driver completes asynchronously through
//! [`crate::MacCore::phy_tx_done`] / [`crate::MacCore::phy_rx`].
//!
//! All methods take `&self`; drivers use interior mutability for their
//! own state so TX submission and RX delivery can come from different
//! contexts.

/// Radio state requested through `state_control`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhyState {
    Down,
    Up,
    Sniffer,
    RxEnergy,
}

/// Address registers a driver keeps in hardware filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressKind {
    Mac64,
    Mac16,
    PanId,
}

/// CSMA parameters handed to drivers with driver-timed transmission.
#[derive(Clone, Copy, Debug, Default)]
pub struct CsmaParams {
    /// Absolute PHY timestamp for the transmission, microseconds.
    pub backoff_time: u32,
    /// Whether the driver performs CCA before transmitting.
    pub cca_enabled: bool,
}

/// Completion status reported by the driver after a TX attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhyTxStatus {
    /// Frame went out; no ACK involvement (broadcast or ACK not wanted).
    Success,
    /// Unicast done and the requested ACK arrived.
    Done,
    /// ACK arrived with the frame-pending bit set.
    DonePending,
    /// Channel was busy at CCA time.
    CcaFail,
    /// No ACK after the driver's own retries.
    Fail,
    /// The driver lost the transmission; the radio needs a cycle.
    Timeout,
}

/// The radio driver abstraction consumed by the MAC.
pub trait Phy: Sync {
    /// Change radio state; `channel` applies to Up/RxEnergy.
    fn state_control(&self, state: PhyState, channel: u8) -> i8;

    /// Program an address filter register.
    fn address_write(&self, kind: AddressKind, address: &[u8]);

    /// Submit one frame for transmission.  Returns nonzero when the
    /// driver cannot accept it; completion arrives via `phy_tx_done`.
    fn tx(&self, buf: &[u8]) -> i8;

    fn set_channel(&self, channel: u8) -> i8;

    /// Configure driver-timed CSMA (only meaningful when
    /// [`csma_extension_supported`](Self::csma_extension_supported)).
    fn set_csma_parameters(&self, params: &CsmaParams);

    /// Current PHY timestamp in microseconds.
    fn read_timestamp(&self) -> u32;

    /// Latest energy-detect sample for the tuned channel.
    fn read_channel_energy(&self) -> u8;

    /// PHY MTU in bytes (MAC frame incl. FCS).
    fn mtu(&self) -> u16;

    /// Driver-owned bytes before the MAC frame.
    fn header_length(&self) -> u8;

    /// Driver-owned bytes after the MAC frame.
    fn tail_length(&self) -> u8;

    /// True when the driver times transmissions itself from
    /// [`CsmaParams`]; otherwise the MAC drives CCA with a slot timer.
    fn csma_extension_supported(&self) -> bool;

    /// Hardware beacon filter override; optional.
    fn accept_any_beacon(&self, _accept: bool) {}
}
