//! MLME management service: PIB access, reset/start, data polling,
//! the scan state machine and beacon handling.
//!
//! Scans own the radio while they run: each channel is tuned, dwelled
//! on for `aBaseSuperframeDuration * (2^duration + 1)` symbols (driven
//! by the MLME housekeeping slot timer), and the walk advances through
//! the channel mask until it is exhausted or the result table fills.
//! Completion halts the radio and delivers the confirm through the
//! event path.

use meshcore_mem::{HeapBox, HeapBytes};

use crate::buffer::{PreBuiltFrame, PreParsedFrame, TxPriority};
use crate::phy::{AddressKind, PhyState};
use crate::pib::{Pib, PibAttribute, PibValue, MAX_BEACON_PAYLOAD};
use crate::sap::{PanDescriptor, PollRequest, ScanConfirm, ScanRequest, ScanType, StartRequest};
use crate::security::{self, SecurityMaterial};
use crate::types::{
    channel_symbol_rate, AddrMode, ChannelList, FrameType, FrameVersion, MacCommand, MacStatus,
    BASE_SUPERFRAME_DURATION, FHSS_SYNCH_INFO_LENGTH, MLME_MAC_RES_SIZE_MAX,
};
use crate::{
    MacCore, MacInner, MlmeTimerRole, Outcall, Outcalls, ScanState, EV_MLME_TIMER,
    EV_SCAN_CONFIRM, MLME_TIMER_SLOTS,
};

/// ED sampling period: 96 slots of 50 µs = 4.8 ms.
const ED_SAMPLE_SLOTS: u16 = 96;

/// Beacon superframe prefix for a beaconless PAN: BO/SO 15.
const BEACONLESS_SF_SPEC: [u8; 2] = [0xFF, 0xCF];

impl MacCore {
    // =========================================================================
    // MLME-SET / MLME-GET
    // =========================================================================

    pub fn mlme_set(&self, attribute: PibAttribute, index: u8, value: &PibValue) -> MacStatus {
        self.state.with(|inner| {
            match (attribute, value) {
                (PibAttribute::ShortAddress, PibValue::U16(v)) => {
                    inner.pib.short_address = *v;
                    self.phy.address_write(AddressKind::Mac16, &v.to_le_bytes());
                }
                (PibAttribute::PanId, PibValue::U16(v)) => {
                    inner.pib.pan_id = *v;
                    self.phy.address_write(AddressKind::PanId, &v.to_le_bytes());
                }
                (PibAttribute::ExtendedAddress, PibValue::Ext(v)) => {
                    inner.pib.mac64 = *v;
                    self.phy.address_write(AddressKind::Mac64, v);
                }
                (PibAttribute::CurrentChannel, PibValue::U8(v)) => {
                    if inner.pib.current_channel != *v {
                        inner.pib.current_channel = *v;
                        if inner.radio_on {
                            self.phy.set_channel(*v);
                        }
                    }
                }
                (PibAttribute::MinBe, PibValue::U8(v)) => {
                    if *v > inner.pib.max_be {
                        return MacStatus::InvalidParameter;
                    }
                    inner.pib.min_be = *v;
                }
                (PibAttribute::MaxBe, PibValue::U8(v)) => {
                    if !(3..=8).contains(v) {
                        return MacStatus::InvalidParameter;
                    }
                    inner.pib.max_be = *v;
                }
                (PibAttribute::MaxCsmaBackoffs, PibValue::U8(v)) => {
                    if *v > 8 {
                        return MacStatus::InvalidParameter;
                    }
                    inner.pib.max_csma_backoffs = *v;
                }
                (PibAttribute::MaxFrameRetries, PibValue::U8(v)) => {
                    if *v > 7 {
                        return MacStatus::InvalidParameter;
                    }
                    inner.pib.max_frame_retries = *v;
                }
                (PibAttribute::FrameCounter, PibValue::U32(v)) => {
                    inner.sec.frame_counter = *v;
                }
                (PibAttribute::RxOnWhenIdle, PibValue::Bool(v)) => {
                    inner.pib.rx_on_when_idle = *v;
                    if *v {
                        self.radio_enable(inner);
                    } else {
                        self.radio_disable_check(inner);
                    }
                }
                (PibAttribute::SecurityEnabled, PibValue::Bool(v)) => {
                    inner.pib.security_enabled = *v;
                }
                (PibAttribute::GtsPermit, PibValue::Bool(v)) => {
                    inner.pib.gts_permit = *v;
                }
                (PibAttribute::PromiscuousMode, PibValue::Bool(v)) => {
                    inner.pib.promiscuous_mode = *v;
                }
                (PibAttribute::AcceptAnyBeacon, PibValue::Bool(v)) => {
                    inner.pib.accept_any_beacon = *v;
                    self.phy.accept_any_beacon(*v);
                }
                (PibAttribute::BroadcastDisabled, PibValue::Bool(v)) => {
                    inner.pib.broadcast_disabled = *v;
                }
                (PibAttribute::BeaconPayload, PibValue::BeaconPayload(v)) => {
                    inner.pib.beacon_payload = v.clone();
                }
                (PibAttribute::BeaconPayloadLength, PibValue::U8(v)) => {
                    let len = *v as usize;
                    if len > MAX_BEACON_PAYLOAD {
                        return MacStatus::InvalidParameter;
                    }
                    if len <= inner.pib.beacon_payload.len() {
                        inner.pib.beacon_payload.truncate(len);
                    } else {
                        while inner.pib.beacon_payload.len() < len {
                            let _ = inner.pib.beacon_payload.push(0);
                        }
                    }
                }
                (PibAttribute::DeviceTable, PibValue::Device(v)) => {
                    match inner.sec.devices.get_mut(index as usize) {
                        Some(slot) => *slot = Some(*v),
                        None => return MacStatus::InvalidIndex,
                    }
                }
                (PibAttribute::KeyTable, PibValue::Key(v)) => {
                    match inner.sec.keys.get_mut(index as usize) {
                        Some(slot) => *slot = Some(*v),
                        None => return MacStatus::InvalidIndex,
                    }
                }
                (PibAttribute::DefaultKeySource, PibValue::Ext(v)) => {
                    inner.sec.default_key_source = *v;
                }
                (PibAttribute::AutoRequestKeyIndex, PibValue::U8(v)) => {
                    inner.pib.auto_request.key_index = *v;
                }
                (PibAttribute::AutoRequestKeyIdMode, PibValue::U8(v)) => {
                    inner.pib.auto_request.key_id_mode = *v;
                }
                (PibAttribute::AutoRequestSecurityLevel, PibValue::U8(v)) => {
                    inner.pib.auto_request.level = *v;
                }
                (PibAttribute::AutoRequestKeySource, PibValue::Ext(v)) => {
                    inner.pib.auto_request.key_source = *v;
                }
                (PibAttribute::CoordShortAddress, PibValue::U16(v)) => {
                    inner.pib.coord_short_address = *v;
                }
                (PibAttribute::CoordExtendedAddress, PibValue::Ext(v)) => {
                    inner.pib.coord_ext_address = *v;
                }
                (PibAttribute::AckWaitDuration, PibValue::U16(v)) => {
                    if *v == 0 {
                        return MacStatus::InvalidParameter;
                    }
                    inner.pib.ack_wait_slots = *v;
                }
                _ => return MacStatus::InvalidParameter,
            }
            MacStatus::Success
        })
    }

    pub fn mlme_get(&self, attribute: PibAttribute, index: u8) -> Result<PibValue, MacStatus> {
        self.state.with(|inner| match attribute {
            PibAttribute::ShortAddress => Ok(PibValue::U16(inner.pib.short_address)),
            PibAttribute::PanId => Ok(PibValue::U16(inner.pib.pan_id)),
            PibAttribute::ExtendedAddress => Ok(PibValue::Ext(inner.pib.mac64)),
            PibAttribute::CurrentChannel => Ok(PibValue::U8(inner.pib.current_channel)),
            PibAttribute::MinBe => Ok(PibValue::U8(inner.pib.min_be)),
            PibAttribute::MaxBe => Ok(PibValue::U8(inner.pib.max_be)),
            PibAttribute::MaxCsmaBackoffs => Ok(PibValue::U8(inner.pib.max_csma_backoffs)),
            PibAttribute::MaxFrameRetries => Ok(PibValue::U8(inner.pib.max_frame_retries)),
            PibAttribute::FrameCounter => Ok(PibValue::U32(inner.sec.frame_counter)),
            PibAttribute::RxOnWhenIdle => Ok(PibValue::Bool(inner.pib.rx_on_when_idle)),
            PibAttribute::SecurityEnabled => Ok(PibValue::Bool(inner.pib.security_enabled)),
            PibAttribute::GtsPermit => Ok(PibValue::Bool(inner.pib.gts_permit)),
            PibAttribute::PromiscuousMode => Ok(PibValue::Bool(inner.pib.promiscuous_mode)),
            PibAttribute::AcceptAnyBeacon => Ok(PibValue::Bool(inner.pib.accept_any_beacon)),
            PibAttribute::BroadcastDisabled => Ok(PibValue::Bool(inner.pib.broadcast_disabled)),
            PibAttribute::BeaconPayload => {
                Ok(PibValue::BeaconPayload(inner.pib.beacon_payload.clone()))
            }
            PibAttribute::BeaconPayloadLength => {
                Ok(PibValue::U8(inner.pib.beacon_payload.len() as u8))
            }
            PibAttribute::DeviceTable => inner
                .sec
                .devices
                .get(index as usize)
                .copied()
                .flatten()
                .map(PibValue::Device)
                .ok_or(MacStatus::InvalidIndex),
            PibAttribute::KeyTable => inner
                .sec
                .keys
                .get(index as usize)
                .copied()
                .flatten()
                .map(PibValue::Key)
                .ok_or(MacStatus::InvalidIndex),
            PibAttribute::DefaultKeySource => Ok(PibValue::Ext(inner.sec.default_key_source)),
            PibAttribute::AutoRequestKeyIndex => {
                Ok(PibValue::U8(inner.pib.auto_request.key_index))
            }
            PibAttribute::AutoRequestKeyIdMode => {
                Ok(PibValue::U8(inner.pib.auto_request.key_id_mode))
            }
            PibAttribute::AutoRequestSecurityLevel => {
                Ok(PibValue::U8(inner.pib.auto_request.level))
            }
            PibAttribute::AutoRequestKeySource => {
                Ok(PibValue::Ext(inner.pib.auto_request.key_source))
            }
            PibAttribute::CoordShortAddress => Ok(PibValue::U16(inner.pib.coord_short_address)),
            PibAttribute::CoordExtendedAddress => Ok(PibValue::Ext(inner.pib.coord_ext_address)),
            PibAttribute::AckWaitDuration => Ok(PibValue::U16(inner.pib.ack_wait_slots)),
        })
    }

    // =========================================================================
    // MLME-RESET / MLME-START
    // =========================================================================

    /// Flush every queue and timer; optionally restore the default PIB.
    pub fn mlme_reset(&self, set_default_pib: bool) -> MacStatus {
        self.state.with(|inner| {
            let _ = self.timers.stop(inner.cca_timer);
            let _ = self.timers.stop(inner.ack_timer);
            let _ = self.timers.stop(inner.mlme_timer);
            inner.mlme_timer_role = MlmeTimerRole::Idle;
            inner.active_tx = None;
            while inner.tx_queue.pop().is_some() {}
            while inner.bc_queue.pop().is_some() {}
            while inner.indirect_queue.pop().is_some() {}
            while inner.rx_queue.pop_front().is_some() {}
            inner.scan = None;
            inner.scan_result = None;
            inner.waiting_ack = false;
            inner.waiting_data = false;
            inner.data_poll_req = false;
            inner.rx_data_at_poll = false;
            inner.ack_tx_active = false;
            inner.tx_process_active = false;
            inner.tx_result = crate::TxResult::Idle;
            if set_default_pib {
                inner.pib = Pib::new();
                inner.sec = SecurityMaterial::new();
            }
            if inner.radio_on {
                self.phy.state_control(PhyState::Down, 0);
                inner.radio_on = false;
            }
            inner.mac_up = false;
            MacStatus::Success
        })
    }

    /// Adopt PAN parameters and bring the interface up.
    pub fn mlme_start(&self, req: &StartRequest) -> MacStatus {
        self.state.with(|inner| {
            if inner.scan.is_some() {
                return MacStatus::ScanInProgress;
            }
            inner.pib.pan_id = req.pan_id;
            inner.pib.current_channel = req.logical_channel;
            inner.pib.channel_page = req.channel_page;
            inner.pib.rx_on_when_idle = req.rx_on_when_idle;
            inner.pan_coordinator = req.pan_coordinator;
            self.phy
                .address_write(AddressKind::PanId, &req.pan_id.to_le_bytes());
            self.phy.set_channel(req.logical_channel);
            inner.mac_up = true;
            if req.rx_on_when_idle {
                self.radio_enable(inner);
            }
            MacStatus::Success
        })
    }

    // =========================================================================
    // MLME-POLL
    // =========================================================================

    /// Send a Data Request command to the coordinator and wait for the
    /// pending data (or the no-data answer).
    pub fn mlme_poll(&self, req: &PollRequest) -> MacStatus {
        let frame = self.state.with(|inner| {
            if inner.data_poll_req {
                return Err(MacStatus::InvalidParameter);
            }
            if !inner.mac_up || inner.scan.is_some() {
                return Err(MacStatus::TrxOff);
            }
            let mut frame = PreBuiltFrame::new();
            frame.fcf.frame_type = FrameType::Cmd;
            frame.fcf.ack_requested = true;
            frame.fcf.intra_pan = true;
            frame.command_id = Some(MacCommand::DataReq);
            frame.dst_pan = req.coord_pan_id;
            frame.src_pan = req.coord_pan_id;
            frame.fcf.dst_addr_mode = req.coord_addr_mode;
            frame.dst_addr = req.coord_address;
            frame.priority = TxPriority::Med;

            frame.security = security::SecurityParams {
                level: req.key.level,
                key_id_mode: req.key.key_id_mode,
                key_index: req.key.key_index,
                key_source: req.key.key_source,
                frame_counter: 0,
            };
            frame.mic_len = security::mic_length(req.key.level) as u8;
            if req.key.level > 0 {
                frame.fcf.security_enabled = true;
                frame.fcf.frame_version = FrameVersion::V2006;
            }

            frame.fcf.src_addr_mode = if inner.pib.short_address_valid() {
                AddrMode::Short
            } else {
                AddrMode::Ext
            };
            match frame.fcf.src_addr_mode {
                AddrMode::Short => {
                    frame.src_addr[..2]
                        .copy_from_slice(&inner.pib.short_address.to_le_bytes());
                }
                _ => frame.src_addr = inner.pib.mac64,
            }

            inner.data_poll_req = true;
            inner.waiting_data = true;
            inner.rx_data_at_poll = false;
            self.radio_enable(inner);

            HeapBox::new_temporary_in(self.heap, frame).ok_or(MacStatus::TransactionOverflow)
        });
        match frame {
            Ok(frame) => {
                self.queue_write(frame);
                MacStatus::Success
            }
            Err(status) => {
                if status == MacStatus::TransactionOverflow {
                    self.state.with(|inner| {
                        inner.data_poll_req = false;
                        inner.waiting_data = false;
                    });
                }
                status
            }
        }
    }

    // =========================================================================
    // MLME-SCAN
    // =========================================================================

    pub fn mlme_scan(&self, req: &ScanRequest) -> MacStatus {
        let begin = self.state.with(|inner| {
            if inner.scan.is_some() {
                return Err(MacStatus::ScanInProgress);
            }
            let mut channels = req.channels;
            let first = match channels.take_next_channel() {
                Some(channel) => channel,
                None => return Err(MacStatus::InvalidParameter),
            };
            inner.scan = Some(ScanState {
                scan_type: req.scan_type,
                channels,
                duration: req.duration.min(14),
                current_channel: first,
                max_ed: 0,
                ed_values: heapless::Vec::new(),
                pans: heapless::Vec::new(),
                dwell_periods: 0,
            });
            Ok(first)
        });
        match begin {
            Ok(channel) => {
                self.scan_channel_begin(channel);
                MacStatus::Success
            }
            Err(status) => status,
        }
    }

    /// Tune to `channel` and start its dwell.  Active scans first send a
    /// Beacon Request; their dwell timer starts when it has gone out.
    fn scan_channel_begin(&self, channel: u8) {
        let beacon_req = self.state.with(|inner| {
            let scan_type = match inner.scan.as_ref() {
                Some(scan) => scan.scan_type,
                None => return None,
            };
            self.scan_dwell_init(inner, channel);
            match scan_type {
                ScanType::EnergyDetect => {
                    if inner.radio_on {
                        self.phy.state_control(PhyState::Down, 0);
                    }
                    self.phy.state_control(PhyState::RxEnergy, channel);
                    inner.radio_on = true;
                    self.scan_response_timer_start(inner);
                    None
                }
                ScanType::Active => {
                    self.radio_enable(inner);
                    self.phy.set_channel(channel);
                    Some(build_beacon_request(self.heap))
                }
                ScanType::Passive | ScanType::Orphan => {
                    self.radio_enable(inner);
                    self.phy.set_channel(channel);
                    self.scan_response_timer_start(inner);
                    None
                }
            }
        });
        if let Some(frame) = beacon_req {
            match frame {
                Some(frame) => self.queue_write(frame),
                None => {
                    // Could not allocate the Beacon Request; dwell anyway
                    // so the scan still completes.
                    self.state
                        .with(|inner| self.scan_response_timer_start(inner));
                }
            }
        }
    }

    /// Compute the per-channel dwell for the housekeeping timer.
    fn scan_dwell_init(&self, inner: &mut MacInner, channel: u8) {
        let page = inner.pib.channel_page;
        if let Some(scan) = inner.scan.as_mut() {
            scan.current_channel = channel;
            scan.max_ed = 0;
            let mut periods: u32 = 1u32 << scan.duration;
            periods += 1;
            if scan.scan_type == ScanType::EnergyDetect {
                // Superframe duration in 10 µs units, scaled to 4.8 ms
                // sampling periods.
                let symbol_rate = channel_symbol_rate(page, channel);
                let frame_duration = BASE_SUPERFRAME_DURATION * 100_000 / symbol_rate;
                periods = (periods * frame_duration / 480).max(1);
            }
            scan.dwell_periods = periods;
        }
    }

    /// Arm the MLME timer for the scan dwell of the current channel.
    pub(crate) fn scan_response_timer_start(&self, inner: &mut MacInner) {
        let (periods, period_slots) = match inner.scan.as_ref() {
            Some(scan) => (
                scan.dwell_periods,
                if scan.scan_type == ScanType::EnergyDetect {
                    ED_SAMPLE_SLOTS
                } else {
                    MLME_TIMER_SLOTS
                },
            ),
            None => return,
        };
        inner.mlme_timer_role = MlmeTimerRole::Scan;
        inner.mlme_tick_count = periods.max(1);
        let _ = self.timers.stop(inner.mlme_timer);
        let _ = self.timers.start(inner.mlme_timer, period_slots);
    }

    /// MLME housekeeping timer expiry; interrupt context.  ED scans
    /// sample here; the final period defers to the tasklet.
    pub(crate) fn mlme_timer_fire(&self, _slots: u16) {
        enum Next {
            None,
            Restart(u16),
            Event,
        }
        let next = self.state.with(|inner| match inner.mlme_timer_role {
            MlmeTimerRole::Idle => Next::None,
            MlmeTimerRole::Scan => {
                let mut period = MLME_TIMER_SLOTS;
                if let Some(scan) = inner.scan.as_mut() {
                    if scan.scan_type == ScanType::EnergyDetect {
                        let ed = self.phy.read_channel_energy();
                        if ed > scan.max_ed {
                            scan.max_ed = ed;
                        }
                        period = ED_SAMPLE_SLOTS;
                    }
                }
                if inner.mlme_tick_count > 1 {
                    inner.mlme_tick_count -= 1;
                    Next::Restart(period)
                } else {
                    inner.mlme_timer_role = MlmeTimerRole::Idle;
                    Next::Event
                }
            }
            MlmeTimerRole::DataWait => {
                if inner.mlme_tick_count > 1 {
                    inner.mlme_tick_count -= 1;
                    Next::Restart(MLME_TIMER_SLOTS)
                } else {
                    inner.mlme_timer_role = MlmeTimerRole::Idle;
                    Next::Event
                }
            }
        });
        match next {
            Next::None => {}
            Next::Restart(slots) => {
                let timer = self.state.with(|inner| inner.mlme_timer);
                let _ = self.timers.start(timer, slots);
            }
            Next::Event => self.post_event(EV_MLME_TIMER),
        }
    }

    /// Tasklet side of the housekeeping timer: advance the scan or time
    /// out a data poll.
    pub(crate) fn mlme_timer_event(&self) {
        enum Step {
            None,
            Channel(u8),
            Finish,
        }
        let mut calls = Outcalls::new();
        let step = self.state.with(|inner| {
            if inner.scan.is_some() {
                let full = {
                    let scan = match inner.scan.as_mut() {
                        Some(scan) => scan,
                        None => return Step::None,
                    };
                    if scan.scan_type == ScanType::EnergyDetect {
                        let ed = scan.max_ed;
                        let _ = scan.ed_values.push(ed);
                    }
                    scan.pans.len() >= MLME_MAC_RES_SIZE_MAX
                        || scan.ed_values.len() >= MLME_MAC_RES_SIZE_MAX
                };
                let next = if full {
                    None
                } else {
                    inner
                        .scan
                        .as_mut()
                        .and_then(|scan| scan.channels.take_next_channel())
                };
                match next {
                    Some(channel) => Step::Channel(channel),
                    None => Step::Finish,
                }
            } else if inner.waiting_data || inner.data_poll_req {
                // Data-poll response window elapsed.
                self.poll_complete(inner, MacStatus::NoData, &mut calls);
                Step::None
            } else {
                Step::None
            }
        });
        self.dispatch_outcalls(calls);
        match step {
            Step::None => {}
            Step::Channel(channel) => self.scan_channel_begin(channel),
            Step::Finish => self.scan_finish(),
        }
    }

    /// Wrap up the scan: build the confirm, halt the radio, deliver
    /// through the event path.
    fn scan_finish(&self) {
        let ready = self.state.with(|inner| {
            let scan = match inner.scan.take() {
                Some(scan) => scan,
                None => return false,
            };
            let full = scan.pans.len() >= MLME_MAC_RES_SIZE_MAX
                || (scan.scan_type == ScanType::EnergyDetect
                    && scan.ed_values.len() >= MLME_MAC_RES_SIZE_MAX);
            let status = if full {
                MacStatus::LimitReached
            } else if scan.scan_type == ScanType::Active && scan.pans.is_empty() {
                MacStatus::NoBeacon
            } else {
                MacStatus::Success
            };
            let confirm = ScanConfirm {
                status,
                scan_type: scan.scan_type,
                unscanned: ChannelList {
                    page: scan.channels.page,
                    mask: scan.channels.mask,
                },
                ed_values: scan.ed_values,
                pan_descriptors: scan.pans,
            };
            inner.scan_result = HeapBox::new_temporary_in(self.heap, confirm);

            // Scan owns the radio; halt it and let normal traffic
            // re-enable on demand.
            if inner.radio_on {
                self.phy.state_control(PhyState::Down, 0);
                inner.radio_on = false;
            }
            inner.scan_result.is_some()
        });
        if ready {
            self.post_event(EV_SCAN_CONFIRM);
        }
    }

    pub(crate) fn scan_confirm_event(&self) {
        let mut calls = Outcalls::new();
        self.state.with(|inner| {
            if let Some(result) = inner.scan_result.take() {
                let _ = calls.push(Outcall::ScanConfirm(result));
            }
        });
        self.dispatch_outcalls(calls);
        self.trig_tx();
    }

    // =========================================================================
    // Beacon processing
    // =========================================================================

    /// Received beacon: collect into a running scan (dedup by channel and
    /// PAN, higher LQI wins) and notify upward, with FHSS synch info
    /// stripped from the payload tail.
    pub(crate) fn rx_beacon(
        &self,
        inner: &mut MacInner,
        mut frame: HeapBox<PreParsedFrame>,
        calls: &mut Outcalls,
    ) {
        if frame.mhr.fcf.security_enabled && self.rx_security_beacon(inner, &mut frame).is_err() {
            inner.stats.rx_drop += 1;
            return;
        }
        let regions = match crate::ie::parse_ie_regions(frame.content(), frame.mhr.fcf.ie_present)
        {
            Some(regions) => regions,
            None => {
                inner.stats.rx_drop += 1;
                return;
            }
        };
        frame.regions = regions;

        // Beacon MAC payload: superframe spec, (empty) GTS and pending
        // address fields, then the beacon payload proper.
        let payload = frame.mac_payload();
        if payload.len() < 4 {
            inner.stats.rx_drop += 1;
            return;
        }
        let superframe_spec = [payload[0], payload[1]];
        let beacon_offset = 4usize;
        let mut beacon_len = payload.len() - beacon_offset;

        let mut synch_info = false;
        if inner.fhss.is_some() {
            if beacon_len > FHSS_SYNCH_INFO_LENGTH {
                beacon_len -= FHSS_SYNCH_INFO_LENGTH;
                synch_info = true;
            } else {
                // A single-channel beacon is meaningless mid-hop.
                return;
            }
        }

        let channel = inner
            .scan
            .as_ref()
            .map_or(inner.pib.current_channel, |s| s.current_channel);
        let descriptor = PanDescriptor {
            coord_addr_mode: frame.mhr.fcf.src_addr_mode,
            coord_address: frame.mhr.src_addr,
            coord_pan_id: frame.mhr.src_pan,
            logical_channel: channel,
            channel_page: inner.pib.channel_page,
            superframe_spec,
            gts_permit: inner.pib.gts_permit,
            link_quality: frame.lqi,
            timestamp: frame.timestamp,
        };

        let fhss_active = inner.fhss.is_some();
        if let Some(scan) = inner.scan.as_mut() {
            add_or_update_beacon(scan, &descriptor, fhss_active);
        }

        let _ = calls.push(Outcall::BeaconNotify {
            frame,
            descriptor,
            payload_offset: beacon_offset,
            payload_len: beacon_len,
            synch_info,
        });
    }

    fn rx_security_beacon(
        &self,
        inner: &mut MacInner,
        frame: &mut HeapBox<PreParsedFrame>,
    ) -> Result<(), MacStatus> {
        // Beacons share the data-frame security path; no open bytes.
        self.rx_security(inner, frame, 0)
    }

    /// Coordinator side of an active scan: answer Beacon Request with a
    /// beacon carrying the configured payload (plus FHSS synch info).
    pub(crate) fn beacon_request_rx(&self, inner: &mut MacInner) {
        if !inner.mac_up || !inner.pan_coordinator {
            return;
        }
        if let Some(frame) = build_beacon(self.heap, inner) {
            inner.tx_queue.push(frame);
        }
    }
}

/// Scan dedup: identical PAN (and channel, unless hopping) keeps the
/// higher-LQI sighting.
fn add_or_update_beacon(scan: &mut ScanState, descriptor: &PanDescriptor, fhss: bool) {
    for existing in scan.pans.iter_mut() {
        if (fhss || existing.logical_channel == descriptor.logical_channel)
            && existing.coord_pan_id == descriptor.coord_pan_id
        {
            if existing.link_quality < descriptor.link_quality {
                existing.coord_addr_mode = descriptor.coord_addr_mode;
                existing.coord_address = descriptor.coord_address;
                existing.link_quality = descriptor.link_quality;
            }
            return;
        }
    }
    let _ = scan.pans.push(*descriptor);
}

/// Broadcast Beacon Request command for active scans.
fn build_beacon_request(heap: &'static meshcore_mem::Heap) -> Option<HeapBox<PreBuiltFrame>> {
    let mut frame = PreBuiltFrame::new();
    frame.fcf.frame_type = FrameType::Cmd;
    frame.command_id = Some(MacCommand::BeaconReq);
    frame.fcf.dst_addr_mode = AddrMode::Short;
    frame.dst_addr = [0xFF, 0xFF, 0, 0, 0, 0, 0, 0];
    frame.dst_pan = 0xFFFF;
    frame.src_pan = 0xFFFF;
    frame.fcf.src_addr_mode = AddrMode::None;
    frame.priority = TxPriority::High;
    HeapBox::new_temporary_in(heap, frame)
}

/// Build the outgoing beacon frame.
fn build_beacon(
    heap: &'static meshcore_mem::Heap,
    inner: &mut MacInner,
) -> Option<HeapBox<PreBuiltFrame>> {
    let mut frame = PreBuiltFrame::new();
    frame.fcf.frame_type = FrameType::Beacon;
    frame.fcf.dst_addr_mode = AddrMode::None;
    frame.src_pan = inner.pib.pan_id;
    frame.fcf.src_addr_mode = if inner.pib.short_address_valid() {
        AddrMode::Short
    } else {
        AddrMode::Ext
    };
    match frame.fcf.src_addr_mode {
        AddrMode::Short => {
            frame.src_addr[..2].copy_from_slice(&inner.pib.short_address.to_le_bytes());
        }
        _ => frame.src_addr = inner.pib.mac64,
    }
    frame.priority = TxPriority::High;

    let synch_len = if inner.fhss.is_some() {
        FHSS_SYNCH_INFO_LENGTH
    } else {
        0
    };
    let body_len = 4 + inner.pib.beacon_payload.len() + synch_len;
    let mut payload = HeapBytes::new_temporary_in(heap, body_len as u16)?;
    {
        let bytes = payload.as_mut_slice();
        bytes[..2].copy_from_slice(&BEACONLESS_SF_SPEC);
        bytes[2] = 0; // no GTS fields
        bytes[3] = 0; // no pending addresses
        bytes[4..4 + inner.pib.beacon_payload.len()]
            .copy_from_slice(inner.pib.beacon_payload.as_slice());
        if synch_len > 0 {
            if let Some(hooks) = inner.fhss {
                let at = body_len - synch_len;
                hooks.write_synch_info(&mut bytes[at..]);
            }
        }
    }
    frame.payload = Some(payload);
    HeapBox::new_temporary_in(heap, frame)
}
