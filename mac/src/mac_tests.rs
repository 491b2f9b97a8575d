//! MAC tests: the S4/S5/S6 scenarios from the protocol requirements,
//! PIB round trips, queue gating, ingress rate limiting, scanning and
//! enhanced ACK generation, all driven through a scripted mock PHY.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;

use meshcore_event::{
    Event, EventSystem, PlatformTimer, SlotTimerCompensation, SlotTimers, TaskletId,
};
use meshcore_lib::CriticalSection;
use meshcore_mem::Heap;

use crate::fcf::{self, FrameControl, MhrFields};
use crate::phy::{AddressKind, CsmaParams, Phy, PhyState, PhyTxStatus};
use crate::pib::{PibAttribute, PibValue};
use crate::sap::{
    AckPayload, DataConfirm, DataIndication, DataRequest, MacCallbacks, MlmeConfirm,
    MlmeIndication, ScanRequest, ScanType, SecuritySelection, StartRequest, TxOptions,
};
use crate::security::{self, CcmStar, KeyDescriptor};
use crate::types::{
    AddrMode, ChannelList, ChannelPage, FrameType, FrameVersion, MacStatus,
};
use crate::MacCore;

// =============================================================================
// Mock hardware
// =============================================================================

struct MockHw {
    armed: AtomicU16,
    remaining: AtomicU16,
}

impl PlatformTimer for MockHw {
    fn enable(&self) {}
    fn disable(&self) {}
    fn start(&self, slots: u16) {
        self.armed.store(slots, Ordering::SeqCst);
        self.remaining.store(slots, Ordering::SeqCst);
    }
    fn remaining_slots(&self) -> u16 {
        self.remaining.load(Ordering::SeqCst)
    }
}

struct MockPhy {
    frames: Mutex<Vec<Vec<u8>>>,
    tx_result: AtomicI8,
    timestamp: AtomicU32,
    energy: AtomicU8,
    csma_ext: bool,
    channel: AtomicU8,
    up: AtomicBool,
    last_csma: Mutex<Option<CsmaParams>>,
}

impl MockPhy {
    fn new(csma_ext: bool) -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            tx_result: AtomicI8::new(0),
            timestamp: AtomicU32::new(100_000),
            energy: AtomicU8::new(0),
            csma_ext,
            channel: AtomicU8::new(0),
            up: AtomicBool::new(false),
            last_csma: Mutex::new(None),
        }
    }

    fn tx_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    fn last_frame(&self) -> Vec<u8> {
        self.frames.lock().unwrap().last().cloned().expect("a transmitted frame")
    }
}

impl Phy for MockPhy {
    fn state_control(&self, state: PhyState, _channel: u8) -> i8 {
        self.up.store(
            matches!(state, PhyState::Up | PhyState::RxEnergy),
            Ordering::SeqCst,
        );
        0
    }
    fn address_write(&self, _kind: AddressKind, _address: &[u8]) {}
    fn tx(&self, buf: &[u8]) -> i8 {
        let result = self.tx_result.load(Ordering::SeqCst);
        if result == 0 {
            self.frames.lock().unwrap().push(buf.to_vec());
        }
        result
    }
    fn set_channel(&self, channel: u8) -> i8 {
        self.channel.store(channel, Ordering::SeqCst);
        0
    }
    fn set_csma_parameters(&self, params: &CsmaParams) {
        *self.last_csma.lock().unwrap() = Some(*params);
    }
    fn read_timestamp(&self) -> u32 {
        self.timestamp.load(Ordering::SeqCst)
    }
    fn read_channel_energy(&self) -> u8 {
        self.energy.load(Ordering::SeqCst)
    }
    fn mtu(&self) -> u16 {
        127
    }
    fn header_length(&self) -> u8 {
        0
    }
    fn tail_length(&self) -> u8 {
        0
    }
    fn csma_extension_supported(&self) -> bool {
        self.csma_ext
    }
}

// =============================================================================
// Recording upper layer
// =============================================================================

#[derive(Default)]
struct Recording {
    confirms: Mutex<Vec<DataConfirm>>,
    indications: Mutex<Vec<(Vec<u8>, [u8; 8], u8)>>,
    poll_confirms: Mutex<Vec<MacStatus>>,
    purge_confirms: Mutex<Vec<(u8, MacStatus)>>,
    scan_confirms: Mutex<Vec<(MacStatus, usize, Vec<u8>)>>,
    beacons: Mutex<Vec<(u16, Vec<u8>)>>,
    comm_status: Mutex<Vec<MacStatus>>,
}

impl MacCallbacks for Recording {
    fn data_confirm(&self, confirm: &DataConfirm, _ack: Option<&AckPayload<'_>>) {
        self.confirms.lock().unwrap().push(*confirm);
    }
    fn data_indication(&self, ind: &DataIndication<'_>) {
        self.indications
            .lock()
            .unwrap()
            .push((ind.msdu.to_vec(), ind.src_addr, ind.dsn));
    }
    fn purge_confirm(&self, msdu_handle: u8, status: MacStatus) {
        self.purge_confirms.lock().unwrap().push((msdu_handle, status));
    }
    fn mlme_confirm(&self, confirm: &MlmeConfirm<'_>) {
        match confirm {
            MlmeConfirm::Poll(status) => self.poll_confirms.lock().unwrap().push(*status),
            MlmeConfirm::Scan(scan) => self.scan_confirms.lock().unwrap().push((
                scan.status,
                scan.pan_descriptors.len(),
                scan.ed_values.iter().copied().collect(),
            )),
            MlmeConfirm::Start(_) => {}
        }
    }
    fn mlme_indication(&self, ind: &MlmeIndication<'_>) {
        match ind {
            MlmeIndication::BeaconNotify(beacon) => self
                .beacons
                .lock()
                .unwrap()
                .push((beacon.descriptor.coord_pan_id, beacon.payload.to_vec())),
            MlmeIndication::CommStatus(st) => {
                self.comm_status.lock().unwrap().push(st.status)
            }
        }
    }
}

// =============================================================================
// Bench
// =============================================================================

thread_local! {
    static BENCH_MAC: Cell<Option<&'static MacCore>> = const { Cell::new(None) };
}

fn mac_tasklet(event: &Event) {
    BENCH_MAC.with(|cell| {
        if let Some(mac) = cell.get() {
            mac.on_event(event);
        }
    });
}

struct Bench {
    events: &'static EventSystem,
    timers: &'static SlotTimers,
    hw: &'static MockHw,
    phy: &'static MockPhy,
    mac: &'static MacCore,
    cbs: &'static Recording,
    #[allow(dead_code)]
    tasklet: TaskletId,
}

fn bench(csma_ext: bool) -> Bench {
    let cs: &'static CriticalSection = Box::leak(Box::new(CriticalSection::new()));
    let heap: &'static Heap = Box::leak(Box::new(Heap::new(cs)));
    let region: &'static mut [usize] = Box::leak(vec![0usize; 16384].into_boxed_slice());
    unsafe { heap.init(region.as_mut_ptr() as *mut u8, 16384 * 8, None) }.expect("heap");

    let events: &'static EventSystem = Box::leak(Box::new(EventSystem::new(cs, heap)));
    let hw: &'static MockHw = Box::leak(Box::new(MockHw {
        armed: AtomicU16::new(0),
        remaining: AtomicU16::new(0),
    }));
    let timers: &'static SlotTimers = Box::leak(Box::new(SlotTimers::new(
        cs,
        hw,
        SlotTimerCompensation::default(),
    )));
    let phy: &'static MockPhy = Box::leak(Box::new(MockPhy::new(csma_ext)));
    let mac: &'static MacCore = Box::leak(Box::new(MacCore::new(cs, heap, events, timers, phy)));
    BENCH_MAC.with(|cell| cell.set(Some(mac)));

    let tasklet = events.handler_create(mac_tasklet, 0).expect("tasklet");
    events.run_until_idle();

    let cbs: &'static Recording = Box::leak(Box::new(Recording::default()));
    mac.init(tasklet, cbs, 0xC0FFEE).expect("mac init");

    mac.mlme_start(&StartRequest {
        pan_id: 0x1234,
        logical_channel: 11,
        channel_page: ChannelPage::Page0,
        pan_coordinator: true,
        rx_on_when_idle: true,
    });
    mac.mlme_set(PibAttribute::ShortAddress, 0, &PibValue::U16(0x0001));
    mac.mlme_set(
        PibAttribute::ExtendedAddress,
        0,
        &PibValue::Ext([0xAC, 0xDE, 0x48, 0, 0, 0, 0, 0x01]),
    );

    Bench {
        events,
        timers,
        hw,
        phy,
        mac,
        cbs,
        tasklet,
    }
}

fn short_addr_bytes(short: u16) -> [u8; 8] {
    let mut a = [0u8; 8];
    a[..2].copy_from_slice(&short.to_le_bytes());
    a
}

/// Fire the armed CCA backoff so the frame reaches the driver.
fn fire_cca(bench: &Bench) {
    assert!(bench.hw.armed.load(Ordering::SeqCst) > 0, "CCA timer armed");
    bench.timers.interrupt();
}

const KEY: [u8; 16] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
    0x0F,
];

// =============================================================================
// S6 — CSMA backoff exhaustion
// =============================================================================

#[test]
fn s6_csma_exhaustion_reports_busy_channel() {
    let bench = bench(false);
    bench
        .mac
        .mlme_set(PibAttribute::MinBe, 0, &PibValue::U8(3));
    bench
        .mac
        .mlme_set(PibAttribute::MaxBe, 0, &PibValue::U8(5));
    bench
        .mac
        .mlme_set(PibAttribute::MaxCsmaBackoffs, 0, &PibValue::U8(4));

    let req = DataRequest::to_short(0x1234, 0xBEEF, &[0x55], 9);
    bench.mac.mcps_data_request(&req);

    // Initial attempt plus four retries, all CCA-busy.
    for attempt in 0..5 {
        fire_cca(&bench);
        assert_eq!(bench.phy.tx_count(), attempt + 1, "one submission per CCA");
        bench.mac.phy_tx_done(PhyTxStatus::CcaFail, 0, 0);
        bench.events.run_until_idle();
    }

    let confirms = bench.cbs.confirms.lock().unwrap();
    assert_eq!(confirms.len(), 1, "exactly one confirm");
    let confirm = confirms[0];
    assert_eq!(confirm.msdu_handle, 9);
    assert_eq!(confirm.status, MacStatus::BusyChannel);
    assert_eq!(confirm.cca_retries, 4);
    assert_eq!(confirm.tx_retries, 0);
    assert_eq!(bench.phy.tx_count(), 5, "no further attempts");
}

// =============================================================================
// S4 — secured unicast with ACK
// =============================================================================

#[test]
fn s4_secured_frame_with_ack() {
    let bench = bench(false);
    bench
        .mac
        .mlme_set(PibAttribute::SecurityEnabled, 0, &PibValue::Bool(true));
    bench.mac.mlme_set(
        PibAttribute::KeyTable,
        0,
        &PibValue::Key(KeyDescriptor {
            key: KEY,
            lookup_index: 3,
            lookup_source: [0; 8],
        }),
    );

    let mut req = DataRequest::to_short(0x1234, 0xBEEF, &[0x01, 0x02, 0x03], 7);
    req.options |= TxOptions::ACK_REQUESTED;
    req.key = SecuritySelection {
        level: 6,
        key_id_mode: 1,
        key_index: 3,
        key_source: [0; 8],
    };
    bench.mac.mcps_data_request(&req);
    fire_cca(&bench);

    // Inspect the emission.
    let mut wire = bench.phy.last_frame();
    let mhr = fcf::parse_mhr(&wire, 0xFFFF).expect("parse emission");
    assert_eq!(mhr.fcf.frame_type, FrameType::Data);
    assert!(mhr.fcf.ack_requested);
    assert!(mhr.fcf.security_enabled);
    assert!(mhr.fcf.intra_pan, "same-PAN traffic compresses");
    assert_eq!(mhr.fcf.frame_version, FrameVersion::V2006);
    assert_eq!(mhr.dst_pan, 0x1234);
    assert_eq!(mhr.dst_addr[..2], 0xBEEFu16.to_le_bytes());
    assert_eq!(mhr.src_addr[..2], 0x0001u16.to_le_bytes());
    let aux = mhr.security.expect("aux header");
    assert_eq!(aux.level, 6);
    assert_eq!(aux.key_id_mode, 1);
    assert_eq!(aux.key_index, 3);
    assert_eq!(aux.frame_counter, 0, "first secured frame");
    // Encrypted payload plus 8-byte MIC.
    assert_eq!(wire.len(), mhr.mhr_len + 3 + 8);
    assert_ne!(&wire[mhr.mhr_len..mhr.mhr_len + 3], &[1, 2, 3]);

    // It decrypts with the configured key and nonce.
    let eui = [0xAC, 0xDE, 0x48, 0, 0, 0, 0, 0x01];
    let nonce = security::build_nonce(&eui, 0, 6);
    assert!(CcmStar::new(&KEY).decrypt_in_place(&nonce, 6, &mut wire, mhr.mhr_len));
    assert_eq!(&wire[mhr.mhr_len..mhr.mhr_len + 3], &[1, 2, 3]);

    // Counter moved on.
    assert_eq!(
        bench.mac.mlme_get(PibAttribute::FrameCounter, 0),
        Ok(PibValue::U32(1))
    );

    // TX done; the MAC waits for the ACK.
    bench.mac.phy_tx_done(PhyTxStatus::Success, 0, 0);
    bench.events.run_until_idle();
    assert!(bench.cbs.confirms.lock().unwrap().is_empty(), "ack pending");

    // Matching immediate ACK.
    let ack = [0x02, 0x00, mhr.seq];
    bench.mac.phy_rx(&ack, 200, -40, 123);
    bench.events.run_until_idle();

    let confirms = bench.cbs.confirms.lock().unwrap();
    assert_eq!(confirms.len(), 1);
    assert_eq!(confirms[0].status, MacStatus::Success);
    assert_eq!(confirms[0].cca_retries, 0);
    assert_eq!(confirms[0].tx_retries, 0);
}

#[test]
fn ack_timeout_retries_then_fails() {
    let bench = bench(false);
    bench
        .mac
        .mlme_set(PibAttribute::MaxFrameRetries, 0, &PibValue::U8(2));

    let mut req = DataRequest::to_short(0x1234, 0x0002, &[0x11], 3);
    req.options |= TxOptions::ACK_REQUESTED;
    bench.mac.mcps_data_request(&req);

    let mut first_seq = None;
    // Initial transmission plus two retries, no ACK ever.
    for attempt in 0..3 {
        fire_cca(&bench);
        assert_eq!(bench.phy.tx_count(), attempt + 1);
        let mhr = fcf::parse_mhr(&bench.phy.last_frame(), 0xFFFF).expect("parse");
        match first_seq {
            None => first_seq = Some(mhr.seq),
            Some(seq) => assert_eq!(mhr.seq, seq, "retry keeps the DSN"),
        }
        bench.mac.phy_tx_done(PhyTxStatus::Success, 0, 0);
        // ACK wait expires.
        bench.timers.interrupt();
        bench.events.run_until_idle();
    }

    let confirms = bench.cbs.confirms.lock().unwrap();
    assert_eq!(confirms.len(), 1);
    assert_eq!(confirms[0].status, MacStatus::NoAck);
    assert_eq!(confirms[0].tx_retries, 2);
}

// =============================================================================
// S5 — indirect data and polling
// =============================================================================

fn data_req_cmd_from(short: u16) -> Vec<u8> {
    let fcf = FrameControl {
        frame_type: FrameType::Cmd,
        intra_pan: true,
        dst_addr_mode: AddrMode::Short,
        src_addr_mode: AddrMode::Short,
        frame_version: FrameVersion::V2003,
        ..FrameControl::default()
    };
    let fields = MhrFields {
        fcf,
        seq: 0x44,
        dst_pan: 0x1234,
        src_pan: 0x1234,
        dst_addr: &short_addr_bytes(0x0001),
        src_addr: &short_addr_bytes(short),
        security: None,
    };
    let mut buf = [0u8; 40];
    let len = fcf::write_mhr(&mut buf, &fields).expect("write poll");
    let mut frame = buf[..len].to_vec();
    frame.push(0x04); // Data Request command id
    frame
}

#[test]
fn s5_indirect_frame_promoted_by_poll() {
    let bench = bench(false);

    let mut req = DataRequest::to_short(0x1234, 0x0042, &[0xAA], 21);
    req.options |= TxOptions::INDIRECT;
    bench.mac.mcps_data_request(&req);
    assert_eq!(bench.phy.tx_count(), 0, "parked, not transmitted");

    // Child polls.
    bench.mac.phy_rx(&data_req_cmd_from(0x0042), 180, -50, 0);
    bench.events.run_until_idle();

    fire_cca(&bench);
    let wire = bench.phy.last_frame();
    let mhr = fcf::parse_mhr(&wire, 0xFFFF).expect("parse promoted frame");
    assert_eq!(mhr.fcf.frame_type, FrameType::Data);
    assert!(!mhr.fcf.frame_pending, "single pending frame");
    assert_eq!(mhr.dst_addr[..2], 0x0042u16.to_le_bytes());
    assert_eq!(wire[mhr.mhr_len..], [0xAA]);

    bench.mac.phy_tx_done(PhyTxStatus::Success, 0, 0);
    bench.events.run_until_idle();
    let confirms = bench.cbs.confirms.lock().unwrap();
    assert_eq!(confirms.len(), 1);
    assert_eq!(confirms[0].msdu_handle, 21);
    assert_eq!(confirms[0].status, MacStatus::Success);
}

#[test]
fn s5_poll_without_pending_answers_no_data() {
    let bench = bench(false);
    bench.mac.phy_rx(&data_req_cmd_from(0x0042), 180, -50, 0);
    bench.events.run_until_idle();

    fire_cca(&bench);
    let wire = bench.phy.last_frame();
    let mhr = fcf::parse_mhr(&wire, 0xFFFF).expect("parse answer");
    assert_eq!(mhr.fcf.frame_type, FrameType::Data);
    assert_eq!(wire.len(), mhr.mhr_len, "zero-payload no-data answer");
    assert_eq!(mhr.dst_addr[..2], 0x0042u16.to_le_bytes());
}

#[test]
fn indirect_entries_expire_with_transaction_expired() {
    let bench = bench(false);
    let mut req = DataRequest::to_short(0x1234, 0x0042, &[0xAB], 30);
    req.options |= TxOptions::INDIRECT;
    bench.mac.mcps_data_request(&req);

    // Age past the 7 s TTL in 100 ms housekeeping ticks.
    for _ in 0..71 {
        bench.events.tick_update(10);
        bench.events.run_until_idle();
    }

    let confirms = bench.cbs.confirms.lock().unwrap();
    assert_eq!(confirms.len(), 1);
    assert_eq!(confirms[0].msdu_handle, 30);
    assert_eq!(confirms[0].status, MacStatus::TransactionExpired);
}

// =============================================================================
// PIB
// =============================================================================

#[test]
fn pib_set_get_round_trip_and_domains() {
    let bench = bench(false);
    let mac = bench.mac;

    let cases = [
        (PibAttribute::ShortAddress, PibValue::U16(0x0042)),
        (PibAttribute::PanId, PibValue::U16(0xABCD)),
        (PibAttribute::CurrentChannel, PibValue::U8(15)),
        (PibAttribute::MaxBe, PibValue::U8(7)),
        (PibAttribute::MinBe, PibValue::U8(4)),
        (PibAttribute::MaxCsmaBackoffs, PibValue::U8(5)),
        (PibAttribute::MaxFrameRetries, PibValue::U8(6)),
        (PibAttribute::FrameCounter, PibValue::U32(0xDEAD_BEEF)),
        (PibAttribute::RxOnWhenIdle, PibValue::Bool(false)),
        (PibAttribute::SecurityEnabled, PibValue::Bool(true)),
        (PibAttribute::PromiscuousMode, PibValue::Bool(true)),
        (PibAttribute::BroadcastDisabled, PibValue::Bool(true)),
        (PibAttribute::AckWaitDuration, PibValue::U16(200)),
    ];
    for (attr, value) in cases {
        assert_eq!(mac.mlme_set(attr, 0, &value), MacStatus::Success, "{:?}", attr);
        assert_eq!(mac.mlme_get(attr, 0), Ok(value), "{:?}", attr);
    }

    // Domain checks.
    assert_eq!(
        mac.mlme_set(PibAttribute::MaxBe, 0, &PibValue::U8(9)),
        MacStatus::InvalidParameter
    );
    assert_eq!(
        mac.mlme_set(PibAttribute::MaxBe, 0, &PibValue::U8(2)),
        MacStatus::InvalidParameter
    );
    assert_eq!(
        mac.mlme_set(PibAttribute::MinBe, 0, &PibValue::U8(8)),
        MacStatus::InvalidParameter,
        "minBE above maxBE"
    );
    assert_eq!(
        mac.mlme_set(PibAttribute::MaxCsmaBackoffs, 0, &PibValue::U8(9)),
        MacStatus::InvalidParameter
    );
    assert_eq!(
        mac.mlme_set(PibAttribute::MaxFrameRetries, 0, &PibValue::U8(8)),
        MacStatus::InvalidParameter
    );
    assert_eq!(
        mac.mlme_set(PibAttribute::ShortAddress, 0, &PibValue::Bool(true)),
        MacStatus::InvalidParameter,
        "type mismatch"
    );

    // Indexed tables.
    let device = crate::security::DeviceDescriptor {
        pan_id: 0x1234,
        short_addr: 0x0042,
        ext_addr: [9; 8],
        frame_counter: 5,
        exempt: false,
    };
    assert_eq!(
        mac.mlme_set(PibAttribute::DeviceTable, 2, &PibValue::Device(device)),
        MacStatus::Success
    );
    assert_eq!(
        mac.mlme_get(PibAttribute::DeviceTable, 2),
        Ok(PibValue::Device(device))
    );
    assert_eq!(
        mac.mlme_get(PibAttribute::DeviceTable, 200),
        Err(MacStatus::InvalidIndex)
    );
}

// =============================================================================
// Queue policy
// =============================================================================

#[test]
fn broadcast_gate_holds_unacked_frames() {
    let bench = bench(false);
    bench
        .mac
        .mlme_set(PibAttribute::BroadcastDisabled, 0, &PibValue::Bool(true));

    let bc = DataRequest::to_short(0x1234, 0xFFFF, &[0x01], 1);
    bench.mac.mcps_data_request(&bc);
    assert_eq!(bench.phy.tx_count(), 0, "broadcast held");

    let mut uni = DataRequest::to_short(0x1234, 0x0002, &[0x02], 2);
    uni.options |= TxOptions::ACK_REQUESTED;
    bench.mac.mcps_data_request(&uni);
    fire_cca(&bench);
    assert_eq!(bench.phy.tx_count(), 1, "unicast passes the gate");
    let mhr = fcf::parse_mhr(&bench.phy.last_frame(), 0xFFFF).expect("parse");
    assert!(mhr.fcf.ack_requested);

    // Re-enabling broadcast releases the held frame.
    bench.mac.phy_tx_done(PhyTxStatus::Done, 0, 0);
    bench.events.run_until_idle();
    bench
        .mac
        .mlme_set(PibAttribute::BroadcastDisabled, 0, &PibValue::Bool(false));
    bench.mac.set_on_broadcast_channel(false);
    bench.events.run_until_idle();
    fire_cca(&bench);
    assert_eq!(bench.phy.tx_count(), 2, "broadcast released");
}

#[test]
fn purge_removes_queued_and_indirect_frames() {
    let bench = bench(false);

    let mut parked = DataRequest::to_short(0x1234, 0x0042, &[0x01], 11);
    parked.options |= TxOptions::INDIRECT;
    bench.mac.mcps_data_request(&parked);

    assert_eq!(bench.mac.mcps_purge_request(11), MacStatus::Success);
    assert_eq!(bench.mac.mcps_purge_request(11), MacStatus::InvalidHandle);
    let purges = bench.cbs.purge_confirms.lock().unwrap();
    assert_eq!(
        purges.as_slice(),
        &[(11, MacStatus::Success), (11, MacStatus::InvalidHandle)]
    );

    // A purged indirect frame never answers a poll with data.
    drop(purges);
    bench.mac.phy_rx(&data_req_cmd_from(0x0042), 100, -60, 0);
    bench.events.run_until_idle();
    fire_cca(&bench);
    let wire = bench.phy.last_frame();
    let mhr = fcf::parse_mhr(&wire, 0xFFFF).expect("parse");
    assert_eq!(wire.len(), mhr.mhr_len, "no-data answer after purge");
}

#[test]
fn ingress_rate_limit_drops_frames() {
    let bench = bench(false);
    bench.mac.set_ingress_threshold(1);

    let before = bench.mac.stats();
    bench.mac.phy_rx(&data_req_cmd_from(0x0042), 100, -60, 0);
    bench.events.run_until_idle();
    let after = bench.mac.stats();
    assert_eq!(after.rx_drop, before.rx_drop + 1);
    assert_eq!(after.rx_count, before.rx_count);
    assert_eq!(bench.phy.tx_count(), 0);
}

// =============================================================================
// Scanning
// =============================================================================

#[test]
fn energy_scan_collects_per_channel_maxima() {
    let bench = bench(false);
    bench.phy.energy.store(55, Ordering::SeqCst);

    let mut channels = ChannelList::default();
    channels.mask[0] = (1 << 11) | (1 << 12);
    let status = bench.mac.mlme_scan(&ScanRequest {
        scan_type: ScanType::EnergyDetect,
        channels,
        duration: 0,
        key: SecuritySelection::default(),
    });
    assert_eq!(status, MacStatus::Success);
    assert_eq!(
        bench.mac.mlme_scan(&ScanRequest {
            scan_type: ScanType::EnergyDetect,
            channels,
            duration: 0,
            key: SecuritySelection::default(),
        }),
        MacStatus::ScanInProgress
    );

    // Drive the ED sampling timer until the scan confirm lands.
    for _ in 0..64 {
        if !bench.cbs.scan_confirms.lock().unwrap().is_empty() {
            break;
        }
        bench.timers.interrupt();
        bench.events.run_until_idle();
    }

    let confirms = bench.cbs.scan_confirms.lock().unwrap();
    assert_eq!(confirms.len(), 1, "scan completed");
    let (status, pans, eds) = &confirms[0];
    assert_eq!(*status, MacStatus::Success);
    assert_eq!(*pans, 0);
    assert_eq!(eds.as_slice(), &[55, 55], "one ED maximum per channel");
}

#[test]
fn passive_scan_collects_and_dedups_beacons() {
    let bench = bench(false);

    let mut channels = ChannelList::default();
    channels.mask[0] = 1 << 11;
    assert_eq!(
        bench.mac.mlme_scan(&ScanRequest {
            scan_type: ScanType::Passive,
            channels,
            duration: 0,
            key: SecuritySelection::default(),
        }),
        MacStatus::Success
    );

    // Beacon from PAN 0x5678, then a stronger sighting of the same PAN.
    for lqi in [50u8, 200] {
        let fcf = FrameControl {
            frame_type: FrameType::Beacon,
            src_addr_mode: AddrMode::Short,
            frame_version: FrameVersion::V2003,
            ..FrameControl::default()
        };
        let fields = MhrFields {
            fcf,
            seq: 1,
            dst_pan: 0,
            src_pan: 0x5678,
            dst_addr: &[0; 8],
            src_addr: &short_addr_bytes(0x00AA),
            security: None,
        };
        let mut buf = [0u8; 48];
        let len = fcf::write_mhr(&mut buf, &fields).expect("beacon mhr");
        let mut wire = buf[..len].to_vec();
        wire.extend_from_slice(&[0xFF, 0xCF, 0x00, 0x00]);
        wire.extend_from_slice(b"HI");
        bench.mac.phy_rx(&wire, lqi, -70, 7);
        bench.events.run_until_idle();
    }

    assert_eq!(bench.cbs.beacons.lock().unwrap().len(), 2, "both notified");
    assert_eq!(
        bench.cbs.beacons.lock().unwrap()[0].1.as_slice(),
        b"HI",
        "beacon payload delivered"
    );

    for _ in 0..8 {
        if !bench.cbs.scan_confirms.lock().unwrap().is_empty() {
            break;
        }
        bench.timers.interrupt();
        bench.events.run_until_idle();
    }
    let confirms = bench.cbs.scan_confirms.lock().unwrap();
    assert_eq!(confirms.len(), 1);
    assert_eq!(confirms[0].1, 1, "one unique PAN after dedup");
}

// =============================================================================
// Enhanced ACK
// =============================================================================

#[test]
fn v2015_frame_triggers_enhanced_ack() {
    let bench = bench(false);
    bench.mac.extension_enable(true);

    let fcf = FrameControl {
        frame_type: FrameType::Data,
        ack_requested: true,
        intra_pan: true,
        dst_addr_mode: AddrMode::Short,
        src_addr_mode: AddrMode::Short,
        frame_version: FrameVersion::V2015,
        ..FrameControl::default()
    };
    let fields = MhrFields {
        fcf,
        seq: 0x33,
        dst_pan: 0x1234,
        src_pan: 0x1234,
        dst_addr: &short_addr_bytes(0x0001),
        src_addr: &short_addr_bytes(0x0077),
        security: None,
    };
    let mut buf = [0u8; 48];
    let len = fcf::write_mhr(&mut buf, &fields).expect("mhr");
    let mut wire = buf[..len].to_vec();
    wire.extend_from_slice(&[0xDE, 0xAD]);

    bench.mac.phy_rx(&wire, 99, -55, 0);
    bench.events.run_until_idle();

    assert_eq!(bench.phy.tx_count(), 1, "enhanced ack transmitted");
    let ack = bench.phy.last_frame();
    let mhr = fcf::parse_mhr(&ack, 0xFFFF).expect("parse ack");
    assert_eq!(mhr.fcf.frame_type, FrameType::Ack);
    assert_eq!(mhr.fcf.frame_version, FrameVersion::V2015);
    assert_eq!(mhr.seq, 0x33, "mirrors the acknowledged DSN");
    assert_eq!(mhr.dst_addr[..2], 0x0077u16.to_le_bytes());
    let csma = bench.phy.last_csma.lock().unwrap().expect("csma params");
    assert!(!csma.cca_enabled, "ACKs skip CCA");

    // The data frame itself still reaches the upper layer.
    assert_eq!(bench.cbs.indications.lock().unwrap().len(), 1);
    assert_eq!(bench.cbs.indications.lock().unwrap()[0].0, vec![0xDE, 0xAD]);

    // ACK completion produces no confirm.
    bench.mac.phy_tx_done(PhyTxStatus::Success, 0, 0);
    bench.events.run_until_idle();
    assert!(bench.cbs.confirms.lock().unwrap().is_empty());
}

// =============================================================================
// Security failures on RX
// =============================================================================

#[test]
fn unknown_key_yields_comm_status_and_drop() {
    let bench = bench(false);
    bench
        .mac
        .mlme_set(PibAttribute::SecurityEnabled, 0, &PibValue::Bool(true));

    let fcf = FrameControl {
        frame_type: FrameType::Data,
        security_enabled: true,
        intra_pan: true,
        dst_addr_mode: AddrMode::Short,
        src_addr_mode: AddrMode::Short,
        frame_version: FrameVersion::V2006,
        ..FrameControl::default()
    };
    let sec = security::SecurityParams {
        level: 5,
        key_id_mode: 1,
        key_index: 9,
        key_source: [0; 8],
        frame_counter: 4,
    };
    let fields = MhrFields {
        fcf,
        seq: 2,
        dst_pan: 0x1234,
        src_pan: 0x1234,
        dst_addr: &short_addr_bytes(0x0001),
        src_addr: &short_addr_bytes(0x0042),
        security: Some(&sec),
    };
    let mut buf = [0u8; 64];
    let len = fcf::write_mhr(&mut buf, &fields).expect("mhr");
    let mut wire = buf[..len].to_vec();
    wire.extend_from_slice(&[1, 2, 3, 0, 0, 0, 0]); // payload + bogus MIC

    bench.mac.phy_rx(&wire, 10, -80, 0);
    bench.events.run_until_idle();

    assert!(bench.cbs.indications.lock().unwrap().is_empty(), "dropped");
    assert_eq!(
        bench.cbs.comm_status.lock().unwrap().as_slice(),
        &[MacStatus::UnavailableKey]
    );
}
