#![cfg_attr(not(test), no_std)]

//! IEEE 802.15.4 MAC core: MLME/MCPS service access points, CSMA-CA
//! transmission scheduling, indirect data, scanning, security and the
//! sleepy-device helpers.
//!
//! The MAC is a context object ([`MacCore`]): no hidden globals.  It is
//! wired at boot to the heap, the event system, the slot timers and one
//! PHY driver, and from then on runs entirely from events and timer
//! callbacks.  All mutable state lives in one critical cell; upper-layer
//! callbacks and PHY submissions happen outside the state borrow so they
//! may re-enter the MAC.

pub mod blacklist;
pub mod buffer;
pub mod data_poll;
pub mod fcf;
pub mod fhss;
pub mod ie;
pub mod indirect;
pub mod mcps;
pub mod mlme;
pub mod phy;
pub mod pib;
pub mod queue;
pub mod sap;
pub mod security;
pub mod types;

#[cfg(test)]
mod mac_tests;

use heapless::Vec;
use meshcore_event::{
    Event, EventSystem, Priority, SlotTimerClient, SlotTimerId, SlotTimers, TaskletId,
};
use meshcore_lib::{CriticalCell, CriticalSection, Lfsr64};
use meshcore_mem::{Heap, HeapBox, HeapBytes};

use buffer::{PreBuiltFrame, PreParsedFrame};
use fhss::{FhssHooks, FhssTimingConfig};
use phy::{Phy, PhyTxStatus};
use pib::Pib;
use queue::{RxQueue, TxQueue};
use sap::{
    AckPayload, BeaconIndication, CommStatusIndication, DataConfirm, DataIndication, MacCallbacks,
    MlmeConfirm, MlmeIndication, PanDescriptor, ScanConfirm,
};
use security::SecurityMaterial;
use types::MacStatus;

// =============================================================================
// MAC tasklet events
// =============================================================================

pub(crate) const EV_INIT: u8 = 0;
pub(crate) const EV_DATA_IND: u8 = 1;
pub(crate) const EV_DATA_CNF: u8 = 2;
pub(crate) const EV_DATA_CNF_FAIL: u8 = 3;
pub(crate) const EV_TRIG_TX: u8 = 4;
pub(crate) const EV_ACK_TIMEOUT: u8 = 5;
pub(crate) const EV_MLME_TIMER: u8 = 6;
pub(crate) const EV_INDIRECT_TICK: u8 = 7;
pub(crate) const EV_SCAN_CONFIRM: u8 = 8;

/// Slot-timer ticks (50 µs) per MLME housekeeping period.
pub(crate) const MLME_TIMER_SLOTS: u16 = 300;

// =============================================================================
// Internal state
// =============================================================================

/// Outcome of the most recent PHY transaction, pending confirm mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TxResult {
    Idle,
    Done,
    DonePending,
    CcaFail,
    TxFail,
    Timeout,
    PrecondFail,
}

/// What the MLME housekeeping timer is currently counting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MlmeTimerRole {
    Idle,
    Scan,
    DataWait,
}

/// Traffic counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MacStats {
    pub tx_count: u32,
    pub tx_bytes: u32,
    pub tx_fail: u32,
    pub cca_attempts: u32,
    pub cca_fail: u32,
    pub retries: u32,
    pub rx_count: u32,
    pub rx_drop: u32,
    pub tx_queue_max: u16,
    pub bc_tx_count: u32,
}

/// Enhanced-ACK content registered by the upper layer.
pub(crate) struct EnhancedAckPayload {
    pub(crate) header_ies: Option<HeapBytes>,
    pub(crate) payload_ies: Option<HeapBytes>,
    pub(crate) payload: Option<HeapBytes>,
}

pub(crate) struct ScanState {
    pub(crate) scan_type: sap::ScanType,
    pub(crate) channels: types::ChannelList,
    pub(crate) duration: u8,
    pub(crate) current_channel: u8,
    pub(crate) max_ed: u8,
    pub(crate) ed_values: Vec<u8, { types::MLME_MAC_RES_SIZE_MAX }>,
    pub(crate) pans: Vec<PanDescriptor, { types::MLME_MAC_RES_SIZE_MAX }>,
    pub(crate) dwell_periods: u32,
}

pub(crate) struct MacInner {
    pub(crate) pib: Pib,
    pub(crate) sec: SecurityMaterial,
    pub(crate) sqn: u8,
    pub(crate) beacon_sqn: u8,
    pub(crate) mac_up: bool,
    pub(crate) pan_coordinator: bool,
    pub(crate) radio_on: bool,
    pub(crate) radio_tx_active: bool,
    pub(crate) mac_extension_enabled: bool,
    // TX machine
    pub(crate) active_tx: Option<HeapBox<PreBuiltFrame>>,
    pub(crate) tx_queue: TxQueue,
    pub(crate) bc_queue: TxQueue,
    pub(crate) indirect_queue: TxQueue,
    pub(crate) tx_result: TxResult,
    pub(crate) cca_retry: u8,
    pub(crate) tx_retry: u8,
    pub(crate) current_be: u8,
    pub(crate) tx_process_active: bool,
    pub(crate) ack_tx_active: bool,
    pub(crate) enhanced_ack_ready: bool,
    pub(crate) waiting_ack: bool,
    pub(crate) tx_requested_ack: bool,
    pub(crate) ack_timestamp: u32,
    pub(crate) enhanced_ack_payload: EnhancedAckPayload,
    pub(crate) tx_buf: Option<HeapBytes>,
    pub(crate) tx_len: u16,
    pub(crate) ack_buf: Option<HeapBytes>,
    pub(crate) ack_len: u16,
    pub(crate) pending_fail: Option<(u8, MacStatus)>,
    // Poll / indirect bookkeeping
    pub(crate) waiting_data: bool,
    pub(crate) data_poll_req: bool,
    pub(crate) rx_data_at_poll: bool,
    pub(crate) indirect_timer_running: bool,
    // RX
    pub(crate) rx_queue: RxQueue,
    pub(crate) ingress_threshold: u32,
    // Scanning
    pub(crate) scan: Option<ScanState>,
    pub(crate) scan_result: Option<HeapBox<ScanConfirm>>,
    // Glue
    pub(crate) callbacks: Option<&'static dyn MacCallbacks>,
    pub(crate) fhss: Option<&'static dyn FhssHooks>,
    pub(crate) fhss_timing: FhssTimingConfig,
    pub(crate) on_broadcast_channel: bool,
    pub(crate) tasklet: TaskletId,
    pub(crate) cca_timer: SlotTimerId,
    pub(crate) ack_timer: SlotTimerId,
    pub(crate) mlme_timer: SlotTimerId,
    pub(crate) mlme_timer_role: MlmeTimerRole,
    pub(crate) mlme_tick_count: u32,
    pub(crate) trig_tx_pending: bool,
    pub(crate) rng: Lfsr64,
    pub(crate) stats: MacStats,
}

impl MacInner {
    const fn new() -> Self {
        Self {
            pib: Pib::new(),
            sec: SecurityMaterial::new(),
            sqn: 0,
            beacon_sqn: 0,
            mac_up: false,
            pan_coordinator: false,
            radio_on: false,
            radio_tx_active: false,
            mac_extension_enabled: false,
            active_tx: None,
            tx_queue: TxQueue::new(),
            bc_queue: TxQueue::new(),
            indirect_queue: TxQueue::new(),
            tx_result: TxResult::Idle,
            cca_retry: 0,
            tx_retry: 0,
            current_be: 3,
            tx_process_active: false,
            ack_tx_active: false,
            enhanced_ack_ready: false,
            waiting_ack: false,
            tx_requested_ack: false,
            ack_timestamp: 0,
            enhanced_ack_payload: EnhancedAckPayload {
                header_ies: None,
                payload_ies: None,
                payload: None,
            },
            tx_buf: None,
            tx_len: 0,
            ack_buf: None,
            ack_len: 0,
            pending_fail: None,
            waiting_data: false,
            data_poll_req: false,
            rx_data_at_poll: false,
            indirect_timer_running: false,
            rx_queue: RxQueue::new(),
            ingress_threshold: u32::MAX,
            scan: None,
            scan_result: None,
            callbacks: None,
            fhss: None,
            fhss_timing: FhssTimingConfig {
                multi_cca_interval: 1000,
                csma_ca_periods: 1,
            },
            on_broadcast_channel: false,
            tasklet: -1,
            cca_timer: -1,
            ack_timer: -1,
            mlme_timer: -1,
            mlme_timer_role: MlmeTimerRole::Idle,
            mlme_tick_count: 0,
            trig_tx_pending: false,
            rng: Lfsr64::with_seed(0),
            stats: MacStats {
                tx_count: 0,
                tx_bytes: 0,
                tx_fail: 0,
                cca_attempts: 0,
                cca_fail: 0,
                retries: 0,
                rx_count: 0,
                rx_drop: 0,
                tx_queue_max: 0,
                bc_tx_count: 0,
            },
        }
    }
}

/// Work items collected under the state borrow and dispatched after it.
pub(crate) enum Outcall {
    DataConfirm {
        confirm: DataConfirm,
        ack: Option<HeapBox<PreParsedFrame>>,
    },
    DataIndication(HeapBox<PreParsedFrame>),
    BeaconNotify {
        frame: HeapBox<PreParsedFrame>,
        descriptor: PanDescriptor,
        payload_offset: usize,
        payload_len: usize,
        synch_info: bool,
    },
    CommStatus(CommStatusIndication),
    PollConfirm(MacStatus),
    ScanConfirm(HeapBox<ScanConfirm>),
    PurgeConfirm {
        handle: u8,
        status: MacStatus,
    },
}

pub(crate) type Outcalls = Vec<Outcall, 8>;

// =============================================================================
// MacCore
// =============================================================================

/// The 802.15.4 MAC context.
pub struct MacCore {
    pub(crate) heap: &'static Heap,
    pub(crate) events: &'static EventSystem,
    pub(crate) timers: &'static SlotTimers,
    pub(crate) phy: &'static dyn Phy,
    pub(crate) state: CriticalCell<MacInner>,
}

impl MacCore {
    pub const fn new(
        cs: &'static CriticalSection,
        heap: &'static Heap,
        events: &'static EventSystem,
        timers: &'static SlotTimers,
        phy: &'static dyn Phy,
    ) -> Self {
        Self {
            heap,
            events,
            timers,
            phy,
            state: CriticalCell::new(cs, MacInner::new()),
        }
    }

    /// Wire the MAC into the runtime.  `tasklet` is the id returned by
    /// `handler_create` for a handler that forwards events to
    /// [`MacCore::on_event`]; `seed` feeds the backoff PRNG.
    pub fn init(
        &'static self,
        tasklet: TaskletId,
        callbacks: &'static dyn MacCallbacks,
        seed: u64,
    ) -> Result<(), MacStatus> {
        let cca = self
            .timers
            .register(self)
            .map_err(|_| MacStatus::TransactionOverflow)?;
        let ack = self
            .timers
            .register(self)
            .map_err(|_| MacStatus::TransactionOverflow)?;
        let mlme = self
            .timers
            .register(self)
            .map_err(|_| MacStatus::TransactionOverflow)?;

        let mtu = self.phy.mtu();
        let tx_buf = HeapBytes::new_in(self.heap, mtu).ok_or(MacStatus::TransactionOverflow)?;
        let ack_buf = HeapBytes::new_in(self.heap, mtu).ok_or(MacStatus::TransactionOverflow)?;

        self.state.with(|inner| {
            inner.tasklet = tasklet;
            inner.callbacks = Some(callbacks);
            inner.cca_timer = cca;
            inner.ack_timer = ack;
            inner.mlme_timer = mlme;
            inner.tx_buf = Some(tx_buf);
            inner.ack_buf = Some(ack_buf);
            inner.rng = Lfsr64::with_seed(seed);
        });
        Ok(())
    }

    /// Enable version-2015 extension behavior (IEs, sequence-number
    /// suppression, enhanced ACK).
    pub fn extension_enable(&self, enabled: bool) {
        self.state.with(|inner| inner.mac_extension_enabled = enabled);
    }

    /// Install frequency-hopping hooks and timing.
    pub fn fhss_attach(&self, hooks: &'static dyn FhssHooks, timing: FhssTimingConfig) {
        self.state.with(|inner| {
            inner.fhss = Some(hooks);
            inner.fhss_timing = timing;
        });
    }

    /// FHSS channel-schedule notification: the radio is currently on the
    /// broadcast channel, so the broadcast queue drains first.
    pub fn set_on_broadcast_channel(&self, on: bool) {
        self.state.with(|inner| inner.on_broadcast_channel = on);
        self.post_event(EV_TRIG_TX);
    }

    /// Drop newly received frames once the heap holds this many bytes.
    pub fn set_ingress_threshold(&self, bytes: u32) {
        self.state.with(|inner| inner.ingress_threshold = bytes);
    }

    /// Content for outgoing enhanced ACKs.
    pub fn set_enhanced_ack_payload(
        &self,
        header_ies: &[u8],
        payload_ies: &[u8],
        payload: &[u8],
    ) -> Result<(), MacStatus> {
        let header = copy_opt(self.heap, header_ies).ok_or(MacStatus::TransactionOverflow)?;
        let pies = copy_opt(self.heap, payload_ies).ok_or(MacStatus::TransactionOverflow)?;
        let pl = copy_opt(self.heap, payload).ok_or(MacStatus::TransactionOverflow)?;
        self.state.with(|inner| {
            inner.enhanced_ack_payload = EnhancedAckPayload {
                header_ies: header,
                payload_ies: pies,
                payload: pl,
            };
        });
        Ok(())
    }

    pub fn stats(&self) -> MacStats {
        self.state.with(|inner| inner.stats)
    }

    // -------------------------------------------------------------------------
    // Event plumbing
    // -------------------------------------------------------------------------

    pub(crate) fn post_event(&self, event_type: u8) {
        let (tasklet, skip) = self.state.with(|inner| {
            let skip = event_type == EV_TRIG_TX && inner.trig_tx_pending;
            if event_type == EV_TRIG_TX {
                inner.trig_tx_pending = true;
            }
            (inner.tasklet, skip)
        });
        if skip || tasklet < 0 {
            return;
        }
        let event = Event {
            receiver: tasklet,
            sender: tasklet,
            event_type,
            event_id: event_type,
            event_data: 0,
            data_ptr: 0,
            priority: Priority::High,
        };
        if self.events.send(&event).is_err() {
            log::warn!("mac event {} dropped", event_type);
        }
    }

    /// Tasklet entry point; the host's handler function forwards every
    /// event for the MAC tasklet here.
    pub fn on_event(&self, event: &Event) {
        match event.event_type {
            EV_INIT => {}
            EV_DATA_IND => self.process_rx_queue(),
            EV_DATA_CNF => self.tx_done_event(),
            EV_DATA_CNF_FAIL => self.tx_fail_event(),
            EV_TRIG_TX => {
                self.state.with(|inner| inner.trig_tx_pending = false);
                self.trig_tx();
            }
            EV_ACK_TIMEOUT => self.ack_timeout_event(),
            EV_MLME_TIMER => self.mlme_timer_event(),
            EV_INDIRECT_TICK => self.indirect_tick_event(),
            EV_SCAN_CONFIRM => self.scan_confirm_event(),
            other => log::debug!("mac: unknown event {}", other),
        }
    }

    /// Deliver collected callbacks outside the state borrow.
    pub(crate) fn dispatch_outcalls(&self, calls: Outcalls) {
        let (cbs, fhss) = self.state.with(|inner| (inner.callbacks, inner.fhss));
        let cbs = match cbs {
            Some(cbs) => cbs,
            None => return,
        };
        for call in calls {
            match call {
                Outcall::DataConfirm { confirm, ack } => match ack {
                    Some(frame) => {
                        let payload = AckPayload {
                            payload: frame.mac_payload(),
                            header_ies: frame.header_ies(),
                            payload_ies: frame.payload_ies(),
                        };
                        cbs.data_confirm(&confirm, Some(&payload));
                    }
                    None => cbs.data_confirm(&confirm, None),
                },
                Outcall::DataIndication(frame) => {
                    let mhr = frame.mhr;
                    let ind = DataIndication {
                        src_addr_mode: mhr.fcf.src_addr_mode,
                        src_pan_id: mhr.src_pan,
                        src_addr: mhr.src_addr,
                        dst_addr_mode: mhr.fcf.dst_addr_mode,
                        dst_pan_id: mhr.dst_pan,
                        dst_addr: mhr.dst_addr,
                        msdu: frame.mac_payload(),
                        header_ies: frame.header_ies(),
                        payload_ies: frame.payload_ies(),
                        mpdu_linkquality: frame.lqi,
                        signal_dbm: frame.rssi_dbm,
                        timestamp: frame.timestamp,
                        dsn: mhr.seq,
                        security: mhr.security.unwrap_or_default(),
                    };
                    cbs.data_indication(&ind);
                }
                Outcall::BeaconNotify {
                    frame,
                    descriptor,
                    payload_offset,
                    payload_len,
                    synch_info,
                } => {
                    let full = frame.mac_payload();
                    let end = (payload_offset + payload_len).min(full.len());
                    let payload = &full[payload_offset.min(end)..end];
                    if synch_info {
                        if let Some(hooks) = fhss {
                            let info = &full[end..];
                            hooks.receive_synch_info(
                                descriptor.coord_pan_id,
                                &descriptor.coord_address,
                                frame.timestamp,
                                info,
                            );
                        }
                    }
                    let ind = BeaconIndication {
                        descriptor,
                        bsn: frame.mhr.seq,
                        payload,
                    };
                    cbs.mlme_indication(&MlmeIndication::BeaconNotify(&ind));
                }
                Outcall::CommStatus(ind) => {
                    cbs.mlme_indication(&MlmeIndication::CommStatus(&ind));
                }
                Outcall::PollConfirm(status) => {
                    cbs.mlme_confirm(&MlmeConfirm::Poll(status));
                }
                Outcall::ScanConfirm(confirm) => {
                    cbs.mlme_confirm(&MlmeConfirm::Scan(&confirm));
                }
                Outcall::PurgeConfirm { handle, status } => {
                    cbs.purge_confirm(handle, status);
                }
            }
        }
    }
}

fn copy_opt(heap: &'static Heap, data: &[u8]) -> Option<Option<HeapBytes>> {
    if data.is_empty() {
        Some(None)
    } else {
        HeapBytes::copy_temporary_in(heap, data).map(Some)
    }
}

// =============================================================================
// Slot-timer dispatch
// =============================================================================

impl SlotTimerClient for MacCore {
    fn timer_interrupt(&self, id: SlotTimerId, slots: u16) {
        let (cca, ack, mlme) = self
            .state
            .with(|inner| (inner.cca_timer, inner.ack_timer, inner.mlme_timer));
        if id == cca {
            self.cca_timer_fire();
        } else if id == ack {
            self.post_event(EV_ACK_TIMEOUT);
        } else if id == mlme {
            self.mlme_timer_fire(slots);
        }
    }
}

// =============================================================================
// PHY completion entry points
// =============================================================================

/// What a completed PHY transaction requires next.
enum TxFollowUp {
    None,
    Backoff,
    Event(u8),
    AckWait(u16),
    ResumePreempted,
}

impl MacCore {
    /// Driver TX completion callback; safe from interrupt context.
    pub fn phy_tx_done(&self, status: PhyTxStatus, cca_retry: u8, retry: u8) {
        let follow_up = self.state.with(|inner| {
            inner.radio_tx_active = false;

            if inner.ack_tx_active {
                // Enhanced-ACK completion: no confirm, resume whatever it
                // preempted.
                inner.ack_tx_active = false;
                inner.tx_process_active = false;
                return if inner.active_tx.is_some() {
                    TxFollowUp::ResumePreempted
                } else {
                    TxFollowUp::None
                };
            }
            if inner.active_tx.is_none() {
                return TxFollowUp::None;
            }

            match status {
                PhyTxStatus::CcaFail => {
                    inner.stats.cca_fail += 1;
                    if inner.cca_retry >= inner.pib.max_csma_backoffs {
                        inner.tx_result = TxResult::CcaFail;
                        TxFollowUp::Event(EV_DATA_CNF)
                    } else {
                        inner.cca_retry += 1;
                        inner.current_be = (inner.current_be + 1).min(inner.pib.max_be);
                        TxFollowUp::Backoff
                    }
                }
                PhyTxStatus::Success => {
                    inner.stats.tx_count += 1;
                    inner.stats.tx_bytes += inner.tx_len as u32;
                    if inner.tx_requested_ack {
                        inner.waiting_ack = true;
                        TxFollowUp::AckWait(inner.pib.ack_wait_slots)
                    } else {
                        inner.stats.bc_tx_count += 1;
                        inner.tx_result = TxResult::Done;
                        TxFollowUp::Event(EV_DATA_CNF)
                    }
                }
                PhyTxStatus::Done => {
                    inner.stats.tx_count += 1;
                    inner.stats.tx_bytes += inner.tx_len as u32;
                    inner.cca_retry = inner.cca_retry.saturating_add(cca_retry);
                    inner.tx_retry = inner.tx_retry.saturating_add(retry);
                    inner.tx_result = TxResult::Done;
                    TxFollowUp::Event(EV_DATA_CNF)
                }
                PhyTxStatus::DonePending => {
                    inner.stats.tx_count += 1;
                    inner.cca_retry = inner.cca_retry.saturating_add(cca_retry);
                    inner.tx_retry = inner.tx_retry.saturating_add(retry);
                    inner.tx_result = TxResult::DonePending;
                    TxFollowUp::Event(EV_DATA_CNF)
                }
                PhyTxStatus::Fail => {
                    inner.stats.tx_fail += 1;
                    inner.cca_retry = inner.cca_retry.saturating_add(cca_retry);
                    inner.tx_retry = inner.tx_retry.saturating_add(retry);
                    inner.tx_result = TxResult::TxFail;
                    TxFollowUp::Event(EV_DATA_CNF)
                }
                PhyTxStatus::Timeout => {
                    inner.tx_result = TxResult::Timeout;
                    TxFollowUp::Event(EV_DATA_CNF)
                }
            }
        });

        match follow_up {
            TxFollowUp::None => {}
            TxFollowUp::Backoff => self.csma_backoff_start(),
            TxFollowUp::Event(ev) => self.post_event(ev),
            TxFollowUp::AckWait(slots) => {
                let timer = self.state.with(|inner| inner.ack_timer);
                let _ = self.timers.start(timer, slots);
            }
            TxFollowUp::ResumePreempted => self.rebuild_active(),
        }
    }

    /// Driver RX delivery; safe from interrupt context.  The frame is
    /// `data` (FCS stripped).  Filtered or rate-limited frames are
    /// dropped here; accepted ones queue for the MAC tasklet.
    pub fn phy_rx(&self, data: &[u8], lqi: u8, rssi_dbm: i8, timestamp: u32) {
        let accepted = self.state.with(|inner| {
            if !inner.mac_up && inner.scan.is_none() {
                return false;
            }
            // Ingress rate limiting: stop buffering when the heap is hot.
            if self.heap.allocated_bytes() >= inner.ingress_threshold {
                inner.stats.rx_drop += 1;
                return false;
            }
            let mhr = match fcf::parse_mhr(data, inner.pib.pan_id) {
                Some(mhr) => mhr,
                None => {
                    inner.stats.rx_drop += 1;
                    return false;
                }
            };
            if !self.rx_filter(inner, &mhr) {
                inner.stats.rx_drop += 1;
                return false;
            }

            let raw = match HeapBytes::copy_temporary_in(self.heap, data) {
                Some(raw) => raw,
                None => {
                    inner.stats.rx_drop += 1;
                    return false;
                }
            };
            let content_len = data.len() - mhr.mhr_len;
            let frame = PreParsedFrame {
                raw,
                mhr,
                regions: ie::IeRegions::default(),
                content_len,
                lqi,
                rssi_dbm,
                timestamp,
                device_index: None,
                next: None,
            };
            match HeapBox::new_temporary_in(self.heap, frame) {
                Some(boxed) => {
                    inner.rx_queue.push_back(boxed);
                    inner.stats.rx_count += 1;
                    true
                }
                None => {
                    inner.stats.rx_drop += 1;
                    false
                }
            }
        });
        if accepted {
            self.post_event(EV_DATA_IND);
        }
    }

    /// Address and state filtering, in the spirit of the ISR-side frame
    /// filter: cheap checks only.
    fn rx_filter(&self, inner: &MacInner, mhr: &fcf::ParsedMhr) -> bool {
        use types::{AddrMode, FrameType};

        if inner.pib.promiscuous_mode {
            return true;
        }
        match mhr.fcf.frame_type {
            FrameType::Ack => inner.waiting_ack || inner.mac_extension_enabled,
            FrameType::Beacon => {
                inner.scan.is_some() || inner.pib.accept_any_beacon || inner.waiting_data
            }
            _ => {
                if mhr.fcf.dst_pan_present()
                    && mhr.dst_pan != 0xFFFF
                    && mhr.dst_pan != inner.pib.pan_id
                {
                    return false;
                }
                match mhr.fcf.dst_addr_mode {
                    AddrMode::Short => {
                        let dst = u16::from_le_bytes([mhr.dst_addr[0], mhr.dst_addr[1]]);
                        dst == 0xFFFF || dst == inner.pib.short_address
                    }
                    AddrMode::Ext => mhr.dst_addr == inner.pib.mac64,
                    // No destination: PAN coordinator traffic.
                    AddrMode::None => inner.pan_coordinator,
                }
            }
        }
    }
}
