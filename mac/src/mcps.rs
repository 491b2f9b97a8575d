//! MCPS data service: request validation, frame construction, CSMA-CA
//! scheduling, acknowledgement handling, reception and confirms.
//!
//! The transmit path runs a frame through:
//!
//! 1. request validation and buffer construction (tasklet context),
//! 2. queueing (priority insert, FHSS gating, broadcast gate),
//! 3. activation: sequence/security/bytes assembled into the TX buffer,
//! 4. CSMA-CA: either driver-timed (CSMA extension, absolute TX time)
//!    or a slot-timer armed backoff followed by a CCA'd submission,
//! 5. completion via `phy_tx_done`, optional software ACK wait,
//!    retries, and exactly one confirm per request.
//!
//! Reception mirrors it: ISR-side filtering and buffering, tasklet-side
//! security processing, IE splitting and SAP dispatch, with enhanced-ACK
//! generation preempting a not-yet-started transmission.

use meshcore_mem::{HeapBox, HeapBytes};

use crate::buffer::{PreBuiltFrame, PreParsedFrame, TxPriority};
use crate::fcf::{self, MhrFields};
use crate::fhss::FhssFrameKind;
use crate::ie;
use crate::phy::{CsmaParams, PhyState};
use crate::sap::{DataConfirm, DataRequest, IeList, TxOptions};
use crate::security::{self, CcmStar};
use crate::types::{
    AddrMode, FrameType, FrameVersion, MacCommand, MacStatus, MAX_PHY_PACKET_SIZE,
    MAX_SAFE_PAYLOAD_SIZE, SLOT_TIME_US, UNIT_BACKOFF_PERIOD,
};
use crate::{
    MacCore, MacInner, MlmeTimerRole, Outcall, Outcalls, TxResult, EV_DATA_CNF_FAIL,
    MLME_TIMER_SLOTS,
};

/// Maximum driver-timed transmit horizon, microseconds.
const MAX_TX_DELAY_US: u32 = 65_000;

/// Enhanced ACKs go out this long after the frame they acknowledge.
const ENHANCED_ACK_DELAY_US: u32 = 300;

/// Data-poll response wait: MLME timer periods of 10 ms each.
const DATA_WAIT_PERIODS: u32 = 30;

impl MacCore {
    // =========================================================================
    // MCPS-DATA.request
    // =========================================================================

    pub fn mcps_data_request(&self, req: &DataRequest<'_>) {
        self.mcps_data_request_ext(req, &IeList::default());
    }

    /// Extended request carrying pre-encoded IE vectors.
    pub fn mcps_data_request_ext(&self, req: &DataRequest<'_>, ies: &IeList<'_>) {
        match self.data_request_build(req, ies) {
            Ok(frame) => {
                if frame.indirect {
                    self.indirect_queue_write(frame);
                } else {
                    self.queue_write(frame);
                }
            }
            Err(status) => {
                log::debug!("data request rejected: {:?}", status);
                self.state.with(|inner| {
                    inner.pending_fail = Some((req.msdu_handle, status));
                });
                self.post_event(EV_DATA_CNF_FAIL);
            }
        }
    }

    /// Validate and turn a request into an owned frame buffer.
    fn data_request_build(
        &self,
        req: &DataRequest<'_>,
        ies: &IeList<'_>,
    ) -> Result<HeapBox<PreBuiltFrame>, MacStatus> {
        self.state.with(|inner| {
            let asynch = req.options.contains(TxOptions::ASYNCH);
            if !inner.pib.security_enabled && req.key.level > 0 {
                return Err(MacStatus::UnsupportedSecurity);
            }
            let has_ies = !ies.header_ies.is_empty() || !ies.payload_ies.is_empty();
            if (has_ies || asynch) && !inner.mac_extension_enabled {
                return Err(MacStatus::InvalidParameter);
            }
            if asynch && req.options.contains(TxOptions::ACK_REQUESTED) {
                return Err(MacStatus::InvalidParameter);
            }
            let total = req.msdu.len() + ies.header_ies.len() + ies.payload_ies.len();
            if total
                > self.phy.mtu() as usize
                    - crate::types::DATA_PACKET_MIN_HEADER_LENGTH as usize
            {
                return Err(MacStatus::FrameTooLong);
            }

            let mut frame = PreBuiltFrame::new();
            if !inner.mac_up || inner.scan.is_some() {
                return Err(MacStatus::TrxOff);
            }

            frame.upper_layer_request = true;
            frame.asynch_request = asynch;
            frame.fcf.frame_type = FrameType::Data;
            frame.fcf.ack_requested = req.options.contains(TxOptions::ACK_REQUESTED);
            frame.fcf.frame_pending = req.options.contains(TxOptions::PENDING_BIT);
            frame.msdu_handle = req.msdu_handle;

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

            frame.fcf.dst_addr_mode = req.dst_addr_mode;
            frame.dst_addr = req.dst_addr;
            frame.dst_pan = req.dst_pan_id;
            frame.src_pan = inner.pib.pan_id;
            frame.fcf.src_addr_mode = req.src_addr_mode;

            if frame.fcf.src_addr_mode == AddrMode::None && !inner.mac_extension_enabled {
                if frame.fcf.dst_addr_mode == AddrMode::None {
                    return Err(MacStatus::InvalidAddress);
                }
                frame.fcf.src_addr_mode = if inner.pib.short_address_valid() {
                    AddrMode::Short
                } else {
                    AddrMode::Ext
                };
            }
            fill_src_address(inner, &mut frame);

            if inner.mac_extension_enabled {
                frame.fcf.frame_version = FrameVersion::V2015;
                if has_ies {
                    frame.fcf.ie_present = true;
                }
                frame.fcf.sequence_suppressed = req.options.contains(TxOptions::SEQ_SUPPRESSED);
                // PAN-ID compression per 802.15.4-2015 Table 7-2.
                let pan_id_suppressed = req.options.contains(TxOptions::PAN_ID_SUPPRESSED);
                frame.fcf.intra_pan = match (frame.fcf.src_addr_mode, frame.fcf.dst_addr_mode) {
                    (AddrMode::None, AddrMode::None) => !pan_id_suppressed,
                    (_, AddrMode::None) | (AddrMode::None, _) => pan_id_suppressed,
                    (AddrMode::Ext, AddrMode::Ext) => pan_id_suppressed,
                    _ => frame.dst_pan == frame.src_pan,
                };
            } else if frame.fcf.dst_addr_mode != AddrMode::None
                && frame.fcf.src_addr_mode != AddrMode::None
                && frame.dst_pan == frame.src_pan
            {
                frame.fcf.intra_pan = true;
            }

            if !req.msdu.is_empty() {
                frame.payload = Some(
                    HeapBytes::copy_temporary_in(self.heap, req.msdu)
                        .ok_or(MacStatus::TransactionOverflow)?,
                );
            }
            if !ies.header_ies.is_empty() {
                frame.header_ies = Some(
                    HeapBytes::copy_temporary_in(self.heap, ies.header_ies)
                        .ok_or(MacStatus::TransactionOverflow)?,
                );
            }
            if !ies.payload_ies.is_empty() {
                frame.payload_ies = Some(
                    HeapBytes::copy_temporary_in(self.heap, ies.payload_ies)
                        .ok_or(MacStatus::TransactionOverflow)?,
                );
            }
            frame.indirect = req.options.contains(TxOptions::INDIRECT);
            if frame.indirect {
                frame.indirect_ttl_ms = crate::types::MAC_INDIRECT_TIMEOUT_MS;
            }

            HeapBox::new_temporary_in(self.heap, frame).ok_or(MacStatus::TransactionOverflow)
        })
    }

    // =========================================================================
    // Queueing and activation
    // =========================================================================

    /// Hand a frame to the direct TX machinery: start it immediately when
    /// the radio is idle and the gates allow, otherwise queue it.
    pub(crate) fn queue_write(&self, frame: HeapBox<PreBuiltFrame>) {
        let start = self.state.with(|inner| {
            if inner.active_tx.is_none() && gates_allow(inner, &frame, self.phy) {
                inner.active_tx = Some(frame);
                true
            } else {
                let use_bc = match inner.fhss {
                    Some(hooks) if !frame.asynch_request => hooks
                        .use_broadcast_queue(!frame.ack_requested(), fhss_kind(&frame)),
                    _ => false,
                };
                if use_bc {
                    inner.bc_queue.push(frame);
                } else {
                    inner.tx_queue.push(frame);
                }
                let depth = (inner.tx_queue.len() + inner.bc_queue.len()) as u16;
                if depth > inner.stats.tx_queue_max {
                    inner.stats.tx_queue_max = depth;
                }
                false
            }
        });
        if start && !self.start_active_tx() {
            self.trig_tx();
        }
    }

    /// Build and launch the active frame.  On a precondition failure the
    /// frame is confirmed with its failure status; returns whether the
    /// transmission actually started.
    fn start_active_tx(&self) -> bool {
        let build = self.state.with(|inner| {
            inner.cca_retry = 0;
            inner.tx_retry = 0;
            inner.tx_result = TxResult::Idle;
            inner.current_be = inner.pib.min_be;
            inner.tx_requested_ack = false;
            let result = self.build_packet(inner, false);
            if result.is_ok() {
                inner.tx_requested_ack = inner
                    .active_tx
                    .as_ref()
                    .map_or(false, |f| f.ack_requested());
            }
            result
        });
        match build {
            Ok(()) => {
                let ack_active = self.state.with(|inner| inner.ack_tx_active);
                if !ack_active {
                    self.arm_cca();
                }
                true
            }
            Err(status) => {
                self.active_tx_precond_fail(status);
                false
            }
        }
    }

    fn active_tx_precond_fail(&self, status: MacStatus) {
        let mut calls = Outcalls::new();
        self.state.with(|inner| {
            if let Some(mut frame) = inner.active_tx.take() {
                frame.status = status;
                inner.tx_result = TxResult::PrecondFail;
                self.confirm_frame(inner, frame, None, &mut calls);
            }
        });
        self.dispatch_outcalls(calls);
    }

    /// Pull the next eligible frame from the queues and start it.
    pub(crate) fn trig_tx(&self) {
        loop {
            let started = self.state.with(|inner| {
                if inner.active_tx.is_some() || !inner.mac_up {
                    return false;
                }
                match queue_read(inner, self.phy) {
                    Some(frame) => {
                        inner.active_tx = Some(frame);
                        true
                    }
                    None => false,
                }
            });
            if !started {
                break;
            }
            if self.start_active_tx() {
                break;
            }
        }
    }

    // =========================================================================
    // Frame assembly
    // =========================================================================

    /// Assemble the active frame into the TX buffer: sequence number,
    /// IE terminators, security transformation.  `rebuild` keeps the
    /// sequence number and frame counter for a retry.
    pub(crate) fn build_packet(
        &self,
        inner: &mut MacInner,
        rebuild: bool,
    ) -> Result<(), MacStatus> {
        let mtu = self.phy.mtu() as usize;
        let mut frame = match inner.active_tx.take() {
            Some(frame) => frame,
            None => return Err(MacStatus::InvalidParameter),
        };
        let result = self.build_packet_into(inner, &mut frame, rebuild, mtu);
        inner.active_tx = Some(frame);
        result
    }

    fn build_packet_into(
        &self,
        inner: &mut MacInner,
        frame: &mut PreBuiltFrame,
        rebuild: bool,
        mtu: usize,
    ) -> Result<(), MacStatus> {
        if !rebuild && frame.fcf.has_sequence() {
            frame.dsn = match frame.fcf.frame_type {
                FrameType::Beacon => {
                    inner.beacon_sqn = inner.beacon_sqn.wrapping_add(1);
                    inner.beacon_sqn
                }
                _ => {
                    inner.sqn = inner.sqn.wrapping_add(1);
                    inner.sqn
                }
            };
        }

        if frame.fcf.security_enabled {
            if !rebuild {
                if inner.sec.frame_counter == u32::MAX {
                    return Err(MacStatus::CounterError);
                }
                frame.security.frame_counter = inner.sec.frame_counter;
            }
            if inner.sec.key_lookup(&frame.security).is_none() {
                return Err(MacStatus::UnavailableKey);
            }
        }

        // Classic PHYs need a 2006+ marker on long payloads.
        let mac_payload_length = frame.total_payload_length();
        if mac_payload_length > MAX_SAFE_PAYLOAD_SIZE as usize
            && self.phy.mtu() == MAX_PHY_PACKET_SIZE
            && frame.fcf.frame_version < FrameVersion::V2006
        {
            frame.fcf.frame_version = FrameVersion::V2006;
        }

        let cmd_extra = usize::from(frame.command_id.is_some());
        let written = {
            let buf = inner.tx_buf.as_mut().ok_or(MacStatus::TrxOff)?;
            write_frame(buf.as_mut_slice(), frame, mtu)?
        };
        frame.header_length_with_security = written.header_len as u16;
        inner.tx_len = written.total_len as u16;

        if frame.fcf.security_enabled {
            let open_len = written.header_len + cmd_extra;
            let key = inner
                .sec
                .key_lookup(&frame.security)
                .ok_or(MacStatus::UnavailableKey)?
                .key;
            let nonce = security::build_nonce(
                &inner.pib.mac64,
                frame.security.frame_counter,
                frame.security.level,
            );
            let buf = inner.tx_buf.as_mut().ok_or(MacStatus::TrxOff)?;
            let total = written.total_len;
            if !CcmStar::new(&key).encrypt_in_place(
                &nonce,
                frame.security.level,
                &mut buf.as_mut_slice()[..total],
                open_len,
            ) {
                return Err(MacStatus::SecurityFail);
            }
            if !rebuild {
                inner.sec.frame_counter += 1;
            }
        }
        Ok(())
    }

    // =========================================================================
    // CSMA-CA
    // =========================================================================

    /// Compute a fresh backoff and arm the transmission: driver-timed
    /// when the PHY supports the CSMA extension, otherwise via the CCA
    /// slot timer.
    pub(crate) fn arm_cca(&self) {
        enum Arm {
            Ext,
            Slots(u16),
            None,
        }
        let arm = self.state.with(|inner| {
            if inner.active_tx.is_none() {
                return Arm::None;
            }
            self.radio_enable(inner);
            inner.tx_process_active = true;
            inner.stats.cca_attempts += 1;

            let backoff_us = csma_backoff_us(inner);
            if self.phy.csma_extension_supported() {
                let mut tx_time = self
                    .phy
                    .read_timestamp()
                    .wrapping_add(backoff_us.min(MAX_TX_DELAY_US));
                // FHSS data frames: pull the deadline in and let the
                // driver run multiple CCA periods.
                let timing = inner.fhss_timing;
                let fhss_active = inner.fhss.is_some();
                if let Some(frame) = inner.active_tx.as_mut() {
                    if fhss_active && !frame.asynch_request && timing.csma_ca_periods > 1 {
                        let pull = timing.multi_cca_interval
                            * (timing.csma_ca_periods as u32 - 1);
                        if tx_time.wrapping_sub(pull) > self.phy.read_timestamp() {
                            frame.csma_periods_left = timing.csma_ca_periods - 1;
                            tx_time = tx_time.wrapping_sub(pull);
                        }
                    }
                    frame.tx_time = tx_time;
                }
                self.phy.set_csma_parameters(&CsmaParams {
                    backoff_time: tx_time,
                    cca_enabled: true,
                });
                Arm::Ext
            } else {
                if let Some(frame) = inner.active_tx.as_mut() {
                    frame.tx_time = backoff_us;
                }
                Arm::Slots(((backoff_us / SLOT_TIME_US).max(1)) as u16)
            }
        });
        match arm {
            Arm::Ext => self.submit_tx_buf(),
            Arm::Slots(slots) => {
                let timer = self.state.with(|inner| inner.cca_timer);
                let _ = self.timers.start(timer, slots);
            }
            Arm::None => {}
        }
    }

    /// CCA backoff expired: hand the frame to the driver.  Runs in
    /// interrupt context.
    pub(crate) fn cca_timer_fire(&self) {
        self.submit_tx_buf();
    }

    /// Move the assembled bytes to the driver, putting the buffer back
    /// for completion handling.
    fn submit_tx_buf(&self) {
        let taken = self.state.with(|inner| {
            if inner.ack_tx_active {
                inner.ack_buf.take().map(|b| (b, inner.ack_len, true))
            } else {
                inner.tx_buf.take().map(|b| (b, inner.tx_len, false))
            }
        });
        let (buf, len, is_ack) = match taken {
            Some(t) => t,
            None => return,
        };
        let result = self.phy.tx(&buf.as_slice()[..len as usize]);
        self.state.with(|inner| {
            if is_ack {
                inner.ack_buf = Some(buf);
            } else {
                inner.tx_buf = Some(buf);
            }
            if result == 0 {
                inner.radio_tx_active = true;
            }
        });
        if result != 0 {
            if is_ack {
                // ACK submission failed; resume the preempted frame.
                let resume = self.state.with(|inner| {
                    inner.ack_tx_active = false;
                    inner.tx_process_active = inner.active_tx.is_some();
                    inner.active_tx.is_some()
                });
                if resume {
                    self.arm_cca();
                }
            } else {
                self.arm_cca();
            }
        }
    }

    /// Re-assemble the active frame (same DSN and frame counter) and run
    /// a fresh backoff; retry and enhanced-ACK resume path.
    pub(crate) fn rebuild_active(&self) {
        let build = self.state.with(|inner| self.build_packet(inner, true));
        match build {
            Ok(()) => self.arm_cca(),
            Err(status) => self.active_tx_precond_fail(status),
        }
    }

    pub(crate) fn csma_backoff_start(&self) {
        self.arm_cca();
    }

    // =========================================================================
    // Completion and confirms
    // =========================================================================

    pub(crate) fn tx_done_event(&self) {
        let mut calls = Outcalls::new();
        self.state.with(|inner| {
            if let Some(frame) = inner.active_tx.take() {
                self.confirm_frame(inner, frame, None, &mut calls);
            }
        });
        self.dispatch_outcalls(calls);
        self.trig_tx();
    }

    pub(crate) fn tx_fail_event(&self) {
        let mut calls = Outcalls::new();
        self.state.with(|inner| {
            if let Some((handle, status)) = inner.pending_fail.take() {
                let _ = calls.push(Outcall::DataConfirm {
                    confirm: DataConfirm {
                        msdu_handle: handle,
                        status,
                        cca_retries: 0,
                        tx_retries: 0,
                        timestamp: 0,
                    },
                    ack: None,
                });
            }
        });
        self.dispatch_outcalls(calls);
    }

    pub(crate) fn ack_timeout_event(&self) {
        enum Next {
            None,
            Retry,
            Confirm,
        }
        let next = self.state.with(|inner| {
            if !inner.waiting_ack || inner.active_tx.is_none() {
                return Next::None;
            }
            inner.waiting_ack = false;
            if inner.tx_retry >= inner.pib.max_frame_retries {
                inner.tx_result = TxResult::TxFail;
                inner.stats.tx_fail += 1;
                Next::Confirm
            } else {
                inner.tx_retry += 1;
                inner.stats.retries += 1;
                Next::Retry
            }
        });
        match next {
            Next::None => {}
            Next::Retry => self.rebuild_active(),
            Next::Confirm => self.tx_done_event(),
        }
    }

    /// Map the TX result to a status and deliver exactly one confirm,
    /// honoring FHSS requeue policy and MAC-internal command handling.
    pub(crate) fn confirm_frame(
        &self,
        inner: &mut MacInner,
        mut frame: HeapBox<PreBuiltFrame>,
        ack: Option<HeapBox<PreParsedFrame>>,
        calls: &mut Outcalls,
    ) {
        let _ = self.timers.stop(inner.ack_timer);
        inner.tx_process_active = false;
        inner.waiting_ack = false;

        // FHSS may claim failed frames back for a later channel.
        if let Some(hooks) = inner.fhss {
            if !frame.asynch_request
                && matches!(inner.tx_result, TxResult::TxFail | TxResult::CcaFail)
                && hooks.data_tx_fail(frame.msdu_handle, fhss_kind(&frame))
            {
                if inner.tx_result == TxResult::TxFail {
                    frame.fhss_retry_count =
                        frame.fhss_retry_count.saturating_add(1 + inner.tx_retry);
                } else {
                    frame.fhss_retry_count = frame.fhss_retry_count.saturating_add(inner.tx_retry);
                }
                frame.fhss_cca_retry_count =
                    frame.fhss_cca_retry_count.saturating_add(inner.cca_retry);
                inner.tx_result = TxResult::Idle;
                inner.tx_queue.push(frame);
                return;
            }
        }

        let cca_retries = inner.cca_retry.saturating_add(frame.fhss_cca_retry_count);
        let tx_retries = inner.tx_retry.saturating_add(frame.fhss_retry_count);

        let status = match inner.tx_result {
            TxResult::CcaFail => MacStatus::BusyChannel,
            TxResult::TxFail => MacStatus::NoAck,
            TxResult::Done => {
                if frame.command_id == Some(MacCommand::DataReq) {
                    MacStatus::NoData
                } else {
                    MacStatus::Success
                }
            }
            TxResult::DonePending => MacStatus::Success,
            TxResult::Timeout => {
                // Lost driver: cycle the radio before reporting.
                log::debug!("driver timeout, cycling radio");
                self.phy.state_control(PhyState::Down, 0);
                self.phy
                    .state_control(PhyState::Up, inner.pib.current_channel);
                MacStatus::TransactionExpired
            }
            TxResult::Idle | TxResult::PrecondFail => frame.status,
        };
        inner.tx_result = TxResult::Idle;

        if frame.upper_layer_request {
            let timestamp = ack.as_ref().map_or(0, |a| a.timestamp);
            let _ = calls.push(Outcall::DataConfirm {
                confirm: DataConfirm {
                    msdu_handle: frame.msdu_handle,
                    status,
                    cca_retries,
                    tx_retries,
                    timestamp,
                },
                ack,
            });
        } else {
            self.internal_tx_confirm(inner, frame, status, calls);
        }
        self.radio_disable_check(inner);
    }

    /// MAC-generated frames (poll, beacon request, beacons) confirm
    /// internally.
    fn internal_tx_confirm(
        &self,
        inner: &mut MacInner,
        frame: HeapBox<PreBuiltFrame>,
        status: MacStatus,
        calls: &mut Outcalls,
    ) {
        match frame.command_id {
            Some(MacCommand::DataReq) => {
                if status == MacStatus::Success {
                    // ACK with pending bit: keep waiting for the data.
                    if !inner.rx_data_at_poll {
                        self.data_wait_timer_start(inner);
                    }
                    inner.active_tx = Some(frame);
                } else {
                    inner.waiting_data = false;
                    inner.data_poll_req = false;
                    inner.rx_data_at_poll = false;
                    let _ = calls.push(Outcall::PollConfirm(status));
                }
            }
            Some(MacCommand::BeaconReq) => {
                self.scan_response_timer_start(inner);
            }
            _ => {}
        }
    }

    /// Arm the MLME housekeeping timer for the data-poll response wait
    /// (roughly 300 ms).
    pub(crate) fn data_wait_timer_start(&self, inner: &mut MacInner) {
        inner.mlme_timer_role = MlmeTimerRole::DataWait;
        inner.mlme_tick_count = DATA_WAIT_PERIODS;
        let _ = self.timers.stop(inner.mlme_timer);
        let _ = self.timers.start(inner.mlme_timer, MLME_TIMER_SLOTS);
    }

    /// Radio off for sleepy devices once nothing needs the receiver.
    pub(crate) fn radio_disable_check(&self, inner: &mut MacInner) {
        if inner.pib.rx_on_when_idle || inner.waiting_data || inner.scan.is_some() {
            return;
        }
        if !inner.radio_tx_active && inner.radio_on {
            self.phy.state_control(PhyState::Down, 0);
            inner.radio_on = false;
        }
    }

    pub(crate) fn radio_enable(&self, inner: &mut MacInner) {
        if !inner.radio_on {
            self.phy
                .state_control(PhyState::Up, inner.pib.current_channel);
            inner.radio_on = true;
        }
    }

    // =========================================================================
    // MCPS-PURGE.request
    // =========================================================================

    pub fn mcps_purge_request(&self, msdu_handle: u8) -> MacStatus {
        let status = self.state.with(|inner| {
            let found = inner
                .tx_queue
                .remove_handle(msdu_handle)
                .or_else(|| inner.bc_queue.remove_handle(msdu_handle))
                .or_else(|| inner.indirect_queue.remove_handle(msdu_handle));
            if found.is_some() {
                MacStatus::Success
            } else {
                MacStatus::InvalidHandle
            }
        });
        let mut calls = Outcalls::new();
        let _ = calls.push(Outcall::PurgeConfirm {
            handle: msdu_handle,
            status,
        });
        self.dispatch_outcalls(calls);
        status
    }

    // =========================================================================
    // Reception
    // =========================================================================

    pub(crate) fn process_rx_queue(&self) {
        loop {
            let mut calls = Outcalls::new();
            let more = self.state.with(|inner| match inner.rx_queue.pop_front() {
                Some(frame) => {
                    self.process_rx_frame(inner, frame, &mut calls);
                    true
                }
                None => false,
            });
            let send_ack = self.state.with(|inner| {
                let ready = inner.enhanced_ack_ready;
                inner.enhanced_ack_ready = false;
                ready
            });
            if send_ack {
                self.send_enhanced_ack();
            }
            self.dispatch_outcalls(calls);
            if !more {
                break;
            }
        }
        self.trig_tx();
    }

    fn process_rx_frame(
        &self,
        inner: &mut MacInner,
        frame: HeapBox<PreParsedFrame>,
        calls: &mut Outcalls,
    ) {
        match frame.mhr.fcf.frame_type {
            FrameType::Ack => self.rx_ack(inner, frame, calls),
            FrameType::Beacon => self.rx_beacon(inner, frame, calls),
            FrameType::Data => self.rx_data(inner, frame, calls),
            FrameType::Cmd => self.rx_command(inner, frame, calls),
        }
    }

    fn rx_data(
        &self,
        inner: &mut MacInner,
        mut frame: HeapBox<PreParsedFrame>,
        calls: &mut Outcalls,
    ) {
        if frame.mhr.fcf.security_enabled {
            if let Err(status) = self.rx_security(inner, &mut frame, 0) {
                push_comm_status(calls, &frame, status);
                return;
            }
        }
        let regions = match ie::parse_ie_regions(frame.content(), frame.mhr.fcf.ie_present) {
            Some(regions) => regions,
            None => {
                inner.stats.rx_drop += 1;
                return;
            }
        };
        frame.regions = regions;

        self.maybe_build_enhanced_ack(inner, &frame);

        if inner.waiting_data {
            // Poll response arrived; an empty payload is the explicit
            // "no data" answer and is not indicated upward.
            let empty = frame.mac_payload().is_empty();
            self.poll_complete(inner, if empty {
                MacStatus::NoData
            } else {
                MacStatus::Success
            }, calls);
            if empty {
                return;
            }
        }

        let _ = calls.push(Outcall::DataIndication(frame));
    }

    fn rx_command(
        &self,
        inner: &mut MacInner,
        mut frame: HeapBox<PreParsedFrame>,
        calls: &mut Outcalls,
    ) {
        if frame.mhr.fcf.security_enabled {
            // The command identifier stays an open byte.
            if let Err(status) = self.rx_security(inner, &mut frame, 1) {
                push_comm_status(calls, &frame, status);
                return;
            }
        }
        let regions = match ie::parse_ie_regions(frame.content(), frame.mhr.fcf.ie_present) {
            Some(regions) => regions,
            None => {
                inner.stats.rx_drop += 1;
                return;
            }
        };
        frame.regions = regions;
        let payload = frame.mac_payload();
        if payload.is_empty() {
            inner.stats.rx_drop += 1;
            return;
        }
        match MacCommand::from_id(payload[0]) {
            MacCommand::DataReq => {
                self.maybe_build_enhanced_ack(inner, &frame);
                self.indirect_data_req_handle(inner, &frame);
            }
            MacCommand::BeaconReq => self.beacon_request_rx(inner),
            MacCommand::Other(id) => {
                log::debug!("unhandled MAC command 0x{:02x}", id);
            }
        }
    }

    fn rx_ack(
        &self,
        inner: &mut MacInner,
        mut frame: HeapBox<PreParsedFrame>,
        calls: &mut Outcalls,
    ) {
        if !inner.waiting_ack || inner.active_tx.is_none() {
            return;
        }
        let expected_dsn = inner.active_tx.as_ref().map(|f| f.dsn);
        if expected_dsn != Some(frame.mhr.seq) {
            return;
        }

        // Enhanced ACK content is optional; a failed decrypt still
        // accepts the acknowledgement, just without its payload.
        let mut content_ok = true;
        if frame.mhr.fcf.security_enabled {
            content_ok = self.rx_security(inner, &mut frame, 0).is_ok();
        }
        if content_ok {
            match ie::parse_ie_regions(frame.content(), frame.mhr.fcf.ie_present) {
                Some(regions) => frame.regions = regions,
                None => content_ok = false,
            }
        }

        let _ = self.timers.stop(inner.ack_timer);
        inner.waiting_ack = false;
        inner.ack_timestamp = frame.timestamp;
        inner.tx_result = if frame.mhr.fcf.frame_pending {
            TxResult::DonePending
        } else {
            TxResult::Done
        };
        if let Some(active) = inner.active_tx.take() {
            let ack = if content_ok { Some(frame) } else { None };
            self.confirm_frame(inner, active, ack, calls);
        }
    }

    /// Decrypt and verify a secured frame in place; resolves key and
    /// device material and enforces the replay counter.
    pub(crate) fn rx_security(
        &self,
        inner: &mut MacInner,
        frame: &mut HeapBox<PreParsedFrame>,
        open_extra: usize,
    ) -> Result<(), MacStatus> {
        let params = frame.mhr.security.ok_or(MacStatus::SecurityFail)?;
        if !inner.pib.security_enabled {
            return Err(if params.level > 0 {
                MacStatus::UnsupportedSecurity
            } else {
                MacStatus::UnsupportedLegacy
            });
        }
        if params.frame_counter == u32::MAX {
            return Err(MacStatus::CounterError);
        }
        let key = inner
            .sec
            .key_lookup(&params)
            .ok_or(MacStatus::UnavailableKey)?
            .key;

        let src_mode = frame.mhr.fcf.src_addr_mode;
        let device_index = inner
            .sec
            .device_lookup(src_mode, &frame.mhr.src_addr, frame.mhr.src_pan);
        let src_eui = match src_mode {
            AddrMode::Ext => frame.mhr.src_addr,
            _ => match device_index.and_then(|i| inner.sec.devices[i]) {
                Some(device) => device.ext_addr,
                None => return Err(MacStatus::UnavailableKey),
            },
        };
        if let Some(device) = device_index.and_then(|i| inner.sec.devices[i]) {
            if params.frame_counter < device.frame_counter && !device.exempt {
                return Err(MacStatus::CounterError);
            }
        }

        let open_len = frame.mhr.mhr_len + open_extra;
        let nonce = security::build_nonce(&src_eui, params.frame_counter, params.level);
        let total = frame.raw.len();
        let ok = CcmStar::new(&key).decrypt_in_place(
            &nonce,
            params.level,
            &mut frame.raw.as_mut_slice()[..total],
            open_len,
        );
        if !ok {
            return Err(MacStatus::SecurityFail);
        }
        frame.content_len = total - frame.mhr.mhr_len - security::mic_length(params.level);
        frame.device_index = device_index;
        if let Some(i) = device_index {
            if let Some(device) = inner.sec.devices[i].as_mut() {
                device.frame_counter = params.frame_counter.saturating_add(1);
            }
        }
        Ok(())
    }

    /// Complete an outstanding data poll: free the parked poll frame,
    /// reset the flags and confirm to the upper layer.
    pub(crate) fn poll_complete(
        &self,
        inner: &mut MacInner,
        status: MacStatus,
        calls: &mut Outcalls,
    ) {
        if !inner.waiting_data && !inner.data_poll_req {
            return;
        }
        inner.waiting_data = false;
        inner.data_poll_req = false;
        inner.rx_data_at_poll = false;
        if inner
            .active_tx
            .as_ref()
            .map_or(false, |f| f.command_id == Some(MacCommand::DataReq))
        {
            inner.active_tx = None;
        }
        if inner.mlme_timer_role == MlmeTimerRole::DataWait {
            inner.mlme_timer_role = MlmeTimerRole::Idle;
            let _ = self.timers.stop(inner.mlme_timer);
        }
        let _ = calls.push(Outcall::PollConfirm(status));
        self.radio_disable_check(inner);
    }

    // =========================================================================
    // Enhanced ACK
    // =========================================================================

    /// Build an enhanced ACK for a just-received 2015 frame into the ACK
    /// buffer; transmission is kicked off after the RX borrow drops.
    fn maybe_build_enhanced_ack(&self, inner: &mut MacInner, frame: &PreParsedFrame) {
        if !frame.mhr.fcf.ack_requested
            || frame.mhr.fcf.frame_version != FrameVersion::V2015
            || !inner.mac_extension_enabled
        {
            return;
        }

        let mut ack = PreBuiltFrame::new();
        let rx = &frame.mhr;
        ack.fcf.frame_type = FrameType::Ack;
        ack.fcf.frame_version = rx.fcf.frame_version;
        ack.fcf.sequence_suppressed = rx.fcf.sequence_suppressed;
        ack.fcf.intra_pan = rx.fcf.intra_pan;
        ack.dsn = rx.seq;
        // Mirror the addressing back at the sender.
        ack.fcf.dst_addr_mode = rx.fcf.src_addr_mode;
        ack.fcf.src_addr_mode = rx.fcf.dst_addr_mode;
        ack.dst_addr = rx.src_addr;
        ack.src_addr = rx.dst_addr;
        ack.dst_pan = rx.src_pan;
        ack.src_pan = rx.dst_pan;
        // Pending data for a polling child keeps the bit set.
        ack.fcf.frame_pending = has_indirect_for(inner, rx);

        if let Some(params) = rx.security {
            ack.fcf.security_enabled = true;
            ack.security = params;
            ack.security.frame_counter = inner.sec.frame_counter;
            ack.mic_len = security::mic_length(params.level) as u8;
        }
        let registered = &inner.enhanced_ack_payload;
        let header_ies = registered.header_ies.as_ref().map(|b| b.len()).unwrap_or(0);
        let payload_ies = registered
            .payload_ies
            .as_ref()
            .map(|b| b.len())
            .unwrap_or(0);
        if header_ies + payload_ies > 0 {
            ack.fcf.ie_present = true;
        }

        let built = build_ack_bytes(inner, &ack, self.phy.mtu() as usize);
        match built {
            Ok(len) => {
                inner.ack_len = len as u16;
                if ack.fcf.security_enabled {
                    inner.sec.frame_counter = inner.sec.frame_counter.saturating_add(1);
                }
                inner.enhanced_ack_ready = true;
                inner.ack_tx_active = true;
            }
            Err(status) => {
                log::debug!("enhanced ack build failed: {:?}", status);
            }
        }
    }

    /// Launch the built enhanced ACK, preempting a transmission whose
    /// CCA stage has not started.
    fn send_enhanced_ack(&self) {
        self.state.with(|inner| {
            if inner.active_tx.is_some() && !inner.radio_tx_active {
                // Abort the pending CCA; the frame stays for resumption.
                let _ = self.timers.stop(inner.cca_timer);
            }
            self.radio_enable(inner);
            inner.tx_process_active = true;
            self.phy.set_csma_parameters(&CsmaParams {
                backoff_time: self.phy.read_timestamp().wrapping_add(ENHANCED_ACK_DELAY_US),
                cca_enabled: false,
            });
        });
        self.submit_tx_buf();
    }
}

// =============================================================================
// Free helpers
// =============================================================================

pub(crate) fn fhss_kind(frame: &PreBuiltFrame) -> FhssFrameKind {
    match frame.fcf.frame_type {
        FrameType::Beacon => FhssFrameKind::Synch,
        FrameType::Cmd => FhssFrameKind::SynchRequest,
        _ => FhssFrameKind::Data,
    }
}

/// May this frame start transmitting right now?
fn gates_allow(inner: &MacInner, frame: &PreBuiltFrame, phy: &dyn crate::phy::Phy) -> bool {
    if inner.pib.broadcast_disabled && !frame.ack_requested() {
        return false;
    }
    if let Some(hooks) = inner.fhss {
        if !frame.asynch_request
            && !hooks.check_tx_conditions(
                !frame.ack_requested(),
                frame.msdu_handle,
                fhss_kind(frame),
                frame.total_payload_length() as u16,
                phy.header_length(),
                phy.tail_length(),
            )
        {
            return false;
        }
    }
    true
}

/// Dequeue the next eligible frame: broadcast queue first on the
/// broadcast channel, FHSS gating per frame, and the broadcast gate
/// applied to both queues.
fn queue_read(inner: &mut MacInner, phy: &dyn crate::phy::Phy) -> Option<HeapBox<PreBuiltFrame>> {
    let fhss = inner.fhss;
    let broadcast_disabled = inner.pib.broadcast_disabled;
    let phy_header = phy.header_length();
    let phy_tail = phy.tail_length();
    let bc_first = fhss.is_some() && inner.on_broadcast_channel;

    let eligible = |f: &PreBuiltFrame| {
        if broadcast_disabled && !f.ack_requested() {
            return false;
        }
        match fhss {
            Some(hooks) if !f.asynch_request => hooks.check_tx_conditions(
                !f.ack_requested(),
                f.msdu_handle,
                fhss_kind(f),
                f.total_payload_length() as u16,
                phy_header,
                phy_tail,
            ),
            _ => true,
        }
    };

    let order = if bc_first { [true, false] } else { [false, true] };
    for use_bc in order {
        if use_bc && fhss.is_none() {
            continue;
        }
        let queue = if use_bc {
            &mut inner.bc_queue
        } else {
            &mut inner.tx_queue
        };
        if let Some(frame) = queue.remove_first(&eligible) {
            return Some(frame);
        }
    }
    None
}

fn fill_src_address(inner: &MacInner, frame: &mut PreBuiltFrame) {
    match frame.fcf.src_addr_mode {
        AddrMode::Short => {
            frame.src_addr = [0; 8];
            frame.src_addr[..2].copy_from_slice(&inner.pib.short_address.to_le_bytes());
        }
        AddrMode::Ext => frame.src_addr = inner.pib.mac64,
        AddrMode::None => {}
    }
}

fn csma_backoff_us(inner: &mut MacInner) -> u32 {
    let window = (1u32 << inner.current_be) - 1;
    let backoffs = inner.rng.rand_range(0, window);
    let symbol_rate =
        crate::types::channel_symbol_rate(inner.pib.channel_page, inner.pib.current_channel);
    let unit_backoff_us = UNIT_BACKOFF_PERIOD * 1_000_000 / symbol_rate;
    backoffs * unit_backoff_us
}

fn push_comm_status(calls: &mut Outcalls, frame: &PreParsedFrame, status: MacStatus) {
    let mhr = &frame.mhr;
    let _ = calls.push(Outcall::CommStatus(crate::sap::CommStatusIndication {
        status,
        src_addr_mode: mhr.fcf.src_addr_mode,
        src_addr: mhr.src_addr,
        dst_addr_mode: mhr.fcf.dst_addr_mode,
        dst_addr: mhr.dst_addr,
        pan_id: mhr.src_pan,
        security: mhr.security.unwrap_or_default(),
    }));
}

/// Does the indirect queue hold anything for the sender of `rx`?
fn has_indirect_for(inner: &MacInner, rx: &fcf::ParsedMhr) -> bool {
    let mut found = false;
    inner.indirect_queue.for_each(|f| {
        if crate::indirect::frame_matches_requester(f, rx) {
            found = true;
        }
    });
    found
}

pub(crate) struct WrittenFrame {
    pub(crate) header_len: usize,
    pub(crate) total_len: usize,
}

/// Lay a frame out into `buf` from its parts: MHR, header IEs (+HT),
/// payload IEs (+PT), command id, payload, MIC space.
pub(crate) fn write_frame_parts(
    buf: &mut [u8],
    fields: &MhrFields<'_>,
    header_ies: &[u8],
    payload_ies: &[u8],
    command: Option<MacCommand>,
    payload: &[u8],
    mic_len: usize,
    mtu: usize,
) -> Result<WrittenFrame, MacStatus> {
    let mhr_len = fcf::write_mhr(buf, fields).ok_or(MacStatus::FrameTooLong)?;
    let has_payload = !payload.is_empty() || command.is_some();

    // Header IEs and their terminator belong to the MHR (they are
    // authenticated, never encrypted).
    let mut at = mhr_len;
    let n = ie::write_ie_region(
        buf.get_mut(at..).ok_or(MacStatus::FrameTooLong)?,
        header_ies,
        &[],
        !payload_ies.is_empty() || has_payload,
    )
    .ok_or(MacStatus::FrameTooLong)?;
    at += n;
    let header_len = at;

    if !payload_ies.is_empty() {
        let n = ie::write_ie_region(
            buf.get_mut(at..).ok_or(MacStatus::FrameTooLong)?,
            &[],
            payload_ies,
            has_payload,
        )
        .ok_or(MacStatus::FrameTooLong)?;
        at += n;
    }

    if let Some(command) = command {
        *buf.get_mut(at).ok_or(MacStatus::FrameTooLong)? = command.id();
        at += 1;
    }
    if !payload.is_empty() {
        let end = at + payload.len();
        buf.get_mut(at..end)
            .ok_or(MacStatus::FrameTooLong)?
            .copy_from_slice(payload);
        at = end;
    }
    let total = at + mic_len;
    if total > mtu - crate::types::FCS_LENGTH as usize || total > buf.len() {
        return Err(MacStatus::FrameTooLong);
    }
    // MIC space is zeroed; the security pass fills it.
    for b in buf[at..total].iter_mut() {
        *b = 0;
    }
    Ok(WrittenFrame {
        header_len,
        total_len: total,
    })
}

/// [`write_frame_parts`] driven from a pre-built frame.
pub(crate) fn write_frame(
    buf: &mut [u8],
    frame: &PreBuiltFrame,
    mtu: usize,
) -> Result<WrittenFrame, MacStatus> {
    let fields = MhrFields {
        fcf: frame.fcf,
        seq: frame.dsn,
        dst_pan: frame.dst_pan,
        src_pan: frame.src_pan,
        dst_addr: &frame.dst_addr,
        src_addr: &frame.src_addr,
        security: if frame.fcf.security_enabled {
            Some(&frame.security)
        } else {
            None
        },
    };
    let empty: &[u8] = &[];
    write_frame_parts(
        buf,
        &fields,
        frame.header_ies.as_ref().map_or(empty, |b| b.as_slice()),
        frame.payload_ies.as_ref().map_or(empty, |b| b.as_slice()),
        frame.command_id,
        frame.payload.as_ref().map_or(empty, |b| b.as_slice()),
        frame.mic_len as usize,
        mtu,
    )
}

/// Assemble an enhanced ACK into the ACK buffer; returns its length.
fn build_ack_bytes(
    inner: &mut MacInner,
    ack: &PreBuiltFrame,
    mtu: usize,
) -> Result<usize, MacStatus> {
    let ack_mtu = mtu.min(crate::types::ENHANCED_ACK_MAX_LENGTH as usize);
    let fields = MhrFields {
        fcf: ack.fcf,
        seq: ack.dsn,
        dst_pan: ack.dst_pan,
        src_pan: ack.src_pan,
        dst_addr: &ack.dst_addr,
        src_addr: &ack.src_addr,
        security: if ack.fcf.security_enabled {
            Some(&ack.security)
        } else {
            None
        },
    };

    let key = if ack.fcf.security_enabled {
        Some(
            inner
                .sec
                .key_lookup(&ack.security)
                .ok_or(MacStatus::UnavailableKey)?
                .key,
        )
    } else {
        None
    };

    let empty: &[u8] = &[];
    let registered = &inner.enhanced_ack_payload;
    let header_ies = registered.header_ies.as_ref().map_or(empty, |b| b.as_slice());
    let payload_ies = registered
        .payload_ies
        .as_ref()
        .map_or(empty, |b| b.as_slice());
    let payload = registered.payload.as_ref().map_or(empty, |b| b.as_slice());

    let mac64 = inner.pib.mac64;
    let buf = inner.ack_buf.as_mut().ok_or(MacStatus::TrxOff)?;
    let written = write_frame_parts(
        buf.as_mut_slice(),
        &fields,
        header_ies,
        payload_ies,
        None,
        payload,
        ack.mic_len as usize,
        ack_mtu,
    )?;

    if let Some(key) = key {
        let nonce =
            security::build_nonce(&mac64, ack.security.frame_counter, ack.security.level);
        if !CcmStar::new(&key).encrypt_in_place(
            &nonce,
            ack.security.level,
            &mut buf.as_mut_slice()[..written.total_len],
            written.header_len,
        ) {
            return Err(MacStatus::SecurityFail);
        }
    }
    Ok(written.total_len)
}
