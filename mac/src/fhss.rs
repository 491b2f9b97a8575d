//! Frequency-hopping coordination hooks.
//!
//! The MAC is hop-agnostic: an installed [`FhssHooks`] implementation
//! decides queue selection, transmit gating and retry policy, and
//! receives beacon synchronization info.  Without hooks installed the
//! broadcast queue is unused and every decision defaults to "go".

/// Frame classes as seen by the hop scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FhssFrameKind {
    /// Beacon carrying synchronization info.
    Synch,
    /// MAC command soliciting synchronization.
    SynchRequest,
    Data,
}

/// Timing configuration for multi-CCA transmissions under FHSS.
#[derive(Clone, Copy, Debug)]
pub struct FhssTimingConfig {
    /// Gap between consecutive CCA periods, microseconds.
    pub multi_cca_interval: u32,
    /// Number of CSMA-CA periods the driver performs per transmission.
    pub csma_ca_periods: u8,
}

impl Default for FhssTimingConfig {
    fn default() -> Self {
        Self {
            multi_cca_interval: 1000,
            csma_ca_periods: 1,
        }
    }
}

/// Host-provided hop scheduler.
pub trait FhssHooks: Sync {
    /// May this frame transmit right now?  A false answer leaves the
    /// frame queued for a later attempt.
    fn check_tx_conditions(
        &self,
        is_broadcast: bool,
        handle: u8,
        kind: FhssFrameKind,
        frame_length: u16,
        phy_header_length: u8,
        phy_tail_length: u8,
    ) -> bool;

    /// Route this frame to the broadcast queue?
    fn use_broadcast_queue(&self, is_broadcast: bool, kind: FhssFrameKind) -> bool;

    /// Failed frame disposition: true requeues for another attempt.
    fn data_tx_fail(&self, handle: u8, kind: FhssFrameKind) -> bool;

    /// Beacon synchronization info stripped from a received beacon tail.
    fn receive_synch_info(&self, pan_id: u16, source: &[u8; 8], timestamp: u32, info: &[u8]);

    /// Synchronization info appended to outgoing beacons.
    fn write_synch_info(&self, info: &mut [u8]);
}
