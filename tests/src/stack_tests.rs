//! Full-stack scenarios: a sleepy end device polling its parent, and
//! allocator mass conservation across complete MAC transactions.

use std::cell::Cell;
use std::sync::atomic::{AtomicI8, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;

use meshcore_event::{
    Event, EventSystem, PlatformTimer, SlotTimerCompensation, SlotTimers,
};
use meshcore_lib::CriticalSection;
use meshcore_mac::data_poll::{DataPollManager, HostMode};
use meshcore_mac::fcf::{self, FrameControl, MhrFields};
use meshcore_mac::phy::{AddressKind, CsmaParams, Phy, PhyState, PhyTxStatus};
use meshcore_mac::pib::{PibAttribute, PibValue};
use meshcore_mac::sap::{
    AckPayload, DataConfirm, DataIndication, DataRequest, MacCallbacks, MlmeConfirm,
    MlmeIndication, PollRequest, SecuritySelection, StartRequest,
};
use meshcore_mac::types::{AddrMode, ChannelPage, FrameType, FrameVersion, MacStatus};
use meshcore_mac::MacCore;
use meshcore_mem::Heap;

// =============================================================================
// Mock hardware
// =============================================================================

struct MockHw {
    armed: AtomicU16,
}

impl PlatformTimer for MockHw {
    fn enable(&self) {}
    fn disable(&self) {}
    fn start(&self, slots: u16) {
        self.armed.store(slots, Ordering::SeqCst);
    }
    fn remaining_slots(&self) -> u16 {
        self.armed.load(Ordering::SeqCst)
    }
}

struct MockPhy {
    frames: Mutex<Vec<Vec<u8>>>,
    result: AtomicI8,
    timestamp: AtomicU32,
    channel: AtomicU8,
}

impl Phy for MockPhy {
    fn state_control(&self, _state: PhyState, _channel: u8) -> i8 {
        0
    }
    fn address_write(&self, _kind: AddressKind, _address: &[u8]) {}
    fn tx(&self, buf: &[u8]) -> i8 {
        let r = self.result.load(Ordering::SeqCst);
        if r == 0 {
            self.frames.lock().unwrap().push(buf.to_vec());
        }
        r
    }
    fn set_channel(&self, channel: u8) -> i8 {
        self.channel.store(channel, Ordering::SeqCst);
        0
    }
    fn set_csma_parameters(&self, _params: &CsmaParams) {}
    fn read_timestamp(&self) -> u32 {
        self.timestamp.load(Ordering::SeqCst)
    }
    fn read_channel_energy(&self) -> u8 {
        0
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
        false
    }
}

// =============================================================================
// Upper layer recording + poll forwarding
// =============================================================================

#[derive(Default)]
struct Upper {
    confirms: Mutex<Vec<DataConfirm>>,
    indications: Mutex<Vec<Vec<u8>>>,
    poll_confirms: Mutex<Vec<MacStatus>>,
}

thread_local! {
    static POLL_MANAGER: Cell<Option<&'static DataPollManager>> = const { Cell::new(None) };
    static STACK_MAC: Cell<Option<&'static MacCore>> = const { Cell::new(None) };
}

impl MacCallbacks for Upper {
    fn data_confirm(&self, confirm: &DataConfirm, _ack: Option<&AckPayload<'_>>) {
        self.confirms.lock().unwrap().push(*confirm);
    }
    fn data_indication(&self, ind: &DataIndication<'_>) {
        self.indications.lock().unwrap().push(ind.msdu.to_vec());
    }
    fn purge_confirm(&self, _msdu_handle: u8, _status: MacStatus) {}
    fn mlme_confirm(&self, confirm: &MlmeConfirm<'_>) {
        if let MlmeConfirm::Poll(status) = confirm {
            self.poll_confirms.lock().unwrap().push(*status);
            // The poll machine reschedules off the confirm, exactly as
            // the network layer glue does.
            POLL_MANAGER.with(|cell| {
                if let Some(manager) = cell.get() {
                    manager.poll_confirm(*status);
                }
            });
        }
    }
    fn mlme_indication(&self, _indication: &MlmeIndication<'_>) {}
}

fn mac_tasklet(event: &Event) {
    STACK_MAC.with(|cell| {
        if let Some(mac) = cell.get() {
            mac.on_event(event);
        }
    });
}

fn poll_tasklet(event: &Event) {
    POLL_MANAGER.with(|cell| {
        if let Some(manager) = cell.get() {
            manager.on_event(event);
        }
    });
}

// =============================================================================
// Bench
// =============================================================================

struct Stack {
    heap: &'static Heap,
    events: &'static EventSystem,
    timers: &'static SlotTimers,
    hw: &'static MockHw,
    phy: &'static MockPhy,
    mac: &'static MacCore,
    upper: &'static Upper,
    poll: &'static DataPollManager,
}

fn stack(rx_on_idle: bool) -> Stack {
    let cs: &'static CriticalSection = Box::leak(Box::new(CriticalSection::new()));
    let heap: &'static Heap = Box::leak(Box::new(Heap::new(cs)));
    let region: &'static mut [usize] = Box::leak(vec![0usize; 16384].into_boxed_slice());
    unsafe { heap.init(region.as_mut_ptr() as *mut u8, 16384 * 8, None) }.expect("heap");

    let events: &'static EventSystem = Box::leak(Box::new(EventSystem::new(cs, heap)));
    let hw: &'static MockHw = Box::leak(Box::new(MockHw {
        armed: AtomicU16::new(0),
    }));
    let timers: &'static SlotTimers = Box::leak(Box::new(SlotTimers::new(
        cs,
        hw,
        SlotTimerCompensation::default(),
    )));
    let phy: &'static MockPhy = Box::leak(Box::new(MockPhy {
        frames: Mutex::new(Vec::new()),
        result: AtomicI8::new(0),
        timestamp: AtomicU32::new(0),
        channel: AtomicU8::new(0),
    }));
    let mac: &'static MacCore = Box::leak(Box::new(MacCore::new(cs, heap, events, timers, phy)));
    let poll: &'static DataPollManager = Box::leak(Box::new(DataPollManager::new(cs, events)));
    STACK_MAC.with(|cell| cell.set(Some(mac)));
    POLL_MANAGER.with(|cell| cell.set(Some(poll)));

    let mac_t = events.handler_create(mac_tasklet, 0).expect("mac tasklet");
    let poll_t = events.handler_create(poll_tasklet, 0).expect("poll tasklet");
    events.run_until_idle();

    let upper: &'static Upper = Box::leak(Box::new(Upper::default()));
    mac.init(mac_t, upper, 77).expect("mac init");
    mac.mlme_start(&StartRequest {
        pan_id: 0x2AAA,
        logical_channel: 11,
        channel_page: ChannelPage::Page0,
        pan_coordinator: false,
        rx_on_when_idle: rx_on_idle,
    });
    mac.mlme_set(PibAttribute::ShortAddress, 0, &PibValue::U16(0x0001));
    mac.mlme_set(
        PibAttribute::ExtendedAddress,
        0,
        &PibValue::Ext([2, 0, 0, 0, 0, 0, 0, 1]),
    );

    let parent = PollRequest {
        coord_addr_mode: AddrMode::Short,
        coord_pan_id: 0x2AAA,
        coord_address: {
            let mut a = [0u8; 8];
            a[..2].copy_from_slice(&0x0002u16.to_le_bytes());
            a
        },
        key: SecuritySelection::default(),
    };
    poll.init(poll_t, mac, None, parent, rx_on_idle);

    Stack {
        heap,
        events,
        timers,
        hw,
        phy,
        mac,
        upper,
        poll,
    }
}

fn fire_cca(stack: &Stack) {
    assert!(stack.hw.armed.load(Ordering::SeqCst) > 0, "CCA armed");
    stack.timers.interrupt();
}

fn run_ticks(stack: &Stack, ticks: u32) {
    for _ in 0..ticks {
        stack.events.tick_update(1);
        stack.events.run_until_idle();
    }
}

// =============================================================================
// Sleepy-device poll cycle
// =============================================================================

#[test]
fn sleepy_device_polls_and_reschedules() {
    let stack = stack(false);
    assert_eq!(stack.poll.host_mode(), HostMode::FastPoll);

    // The init path schedules the first poll 200 ms out (20 ticks,
    // legacy rounding: 21).
    run_ticks(&stack, 25);
    stack.events.run_until_idle();

    // The poll machine asked the MAC for a Data Request.
    fire_cca(&stack);
    assert_eq!(stack.phy.frames.lock().unwrap().len(), 1);
    let wire = stack.phy.frames.lock().unwrap()[0].clone();
    let mhr = fcf::parse_mhr(&wire, 0xFFFF).expect("parse poll");
    assert_eq!(mhr.fcf.frame_type, FrameType::Cmd);
    assert!(mhr.fcf.ack_requested);
    assert_eq!(wire[mhr.mhr_len], 0x04, "Data Request command");
    assert_eq!(mhr.dst_addr[..2], 0x0002u16.to_le_bytes());

    // Parent ACKs without pending data: poll confirm is NO_DATA and the
    // 300 ms fast cadence re-arms.
    stack.mac.phy_tx_done(PhyTxStatus::Done, 0, 0);
    stack.events.run_until_idle();
    assert_eq!(
        stack.upper.poll_confirms.lock().unwrap().as_slice(),
        &[MacStatus::NoData]
    );

    // Next cadence point produces the next poll.
    run_ticks(&stack, 35);
    fire_cca(&stack);
    assert_eq!(stack.phy.frames.lock().unwrap().len(), 2, "re-polled");
}

#[test]
fn poll_with_pending_data_delivers_and_confirms_success() {
    let stack = stack(false);

    run_ticks(&stack, 25);
    fire_cca(&stack);
    // Parent ACKs with the frame-pending bit: the device keeps its
    // receiver on and waits for the data frame.
    stack.mac.phy_tx_done(PhyTxStatus::DonePending, 0, 0);
    stack.events.run_until_idle();
    assert!(stack.upper.poll_confirms.lock().unwrap().is_empty());

    // The pending frame arrives.
    let fcf_word = FrameControl {
        frame_type: FrameType::Data,
        intra_pan: true,
        dst_addr_mode: AddrMode::Short,
        src_addr_mode: AddrMode::Short,
        frame_version: FrameVersion::V2003,
        ..FrameControl::default()
    };
    let mut dst = [0u8; 8];
    dst[..2].copy_from_slice(&0x0001u16.to_le_bytes());
    let mut src = [0u8; 8];
    src[..2].copy_from_slice(&0x0002u16.to_le_bytes());
    let fields = MhrFields {
        fcf: fcf_word,
        seq: 9,
        dst_pan: 0x2AAA,
        src_pan: 0x2AAA,
        dst_addr: &dst,
        src_addr: &src,
        security: None,
    };
    let mut buf = [0u8; 48];
    let len = fcf::write_mhr(&mut buf, &fields).expect("mhr");
    let mut wire = buf[..len].to_vec();
    wire.push(0x42);

    stack.mac.phy_rx(&wire, 150, -45, 5);
    stack.events.run_until_idle();

    assert_eq!(
        stack.upper.poll_confirms.lock().unwrap().as_slice(),
        &[MacStatus::Success]
    );
    assert_eq!(
        stack.upper.indications.lock().unwrap().as_slice(),
        &[vec![0x42]]
    );
}

#[test]
fn four_poll_failures_trigger_the_fail_callback() {
    use std::sync::atomic::AtomicU32 as Counter;
    static FAILS: Counter = Counter::new(0);
    fn on_fail() {
        FAILS.fetch_add(1, Ordering::SeqCst);
    }

    let stack = stack(false);
    let parent = PollRequest {
        coord_addr_mode: AddrMode::Short,
        coord_pan_id: 0x2AAA,
        coord_address: {
            let mut a = [0u8; 8];
            a[..2].copy_from_slice(&0x0002u16.to_le_bytes());
            a
        },
        key: SecuritySelection::default(),
    };
    // Reinstall with a fail callback.
    stack.poll.init(
        stack.events.tasklet_id_valid(1).then_some(1).expect("poll tasklet id"),
        stack.mac,
        Some(on_fail),
        parent,
        false,
    );
    FAILS.store(0, Ordering::SeqCst);

    for round in 0..4 {
        run_ticks(&stack, 250);
        fire_cca(&stack);
        // Channel always busy: every CCA attempt fails, the poll frame
        // eventually confirms BUSY_CHANNEL.
        for _ in 0..5 {
            stack.mac.phy_tx_done(PhyTxStatus::CcaFail, 0, 0);
            stack.events.run_until_idle();
            if stack.hw.armed.load(Ordering::SeqCst) > 0 {
                stack.timers.interrupt();
            }
        }
        stack.events.run_until_idle();
        assert_eq!(
            stack.upper.poll_confirms.lock().unwrap().len(),
            round + 1,
            "one confirm per poll round"
        );
    }

    assert_eq!(FAILS.load(Ordering::SeqCst), 1, "fail callback after 4 misses");
}

// =============================================================================
// Allocator mass conservation across MAC transactions
// =============================================================================

#[test]
fn complete_transactions_return_all_heap_storage() {
    let stack = stack(true);
    stack.events.run_until_idle();
    let baseline = stack.heap.allocated_bytes();

    for handle in 0..20u8 {
        let payload = [handle, 0xA5];
        let req = DataRequest::to_short(0x2AAA, 0x0042, &payload, handle);
        stack.mac.mcps_data_request(&req);
        fire_cca(&stack);
        stack.mac.phy_tx_done(PhyTxStatus::Success, 0, 0);
        stack.events.run_until_idle();
    }

    assert_eq!(stack.upper.confirms.lock().unwrap().len(), 20);
    assert!(
        stack
            .upper
            .confirms
            .lock()
            .unwrap()
            .iter()
            .all(|c| c.status == MacStatus::Success),
        "all transactions succeeded"
    );
    assert_eq!(
        stack.heap.allocated_bytes(),
        baseline,
        "every frame buffer returned to the heap"
    );
    assert!(stack.heap.integrity_check());
}
