//! Event loop tests: priority ordering, FIFO tie-break, storage
//! provenance, tasklet bookkeeping and cancellation.

use std::sync::atomic::{AtomicI8, AtomicU32, Ordering};
use std::sync::Mutex;
use std::sync::OnceLock;

use meshcore_lib::CriticalSection;
use meshcore_mem::Heap;

use crate::event::{Event, EventError, EventStorage, Priority};
use crate::eventloop::EventSystem;

// =============================================================================
// Helpers
// =============================================================================

/// Leak a critical section, heap (64 KiB region) and event system.
fn fresh_system() -> &'static EventSystem {
    let cs: &'static CriticalSection = Box::leak(Box::new(CriticalSection::new()));
    let heap: &'static Heap = Box::leak(Box::new(Heap::new(cs)));
    let region: &'static mut [usize] = Box::leak(vec![0usize; 8192].into_boxed_slice());
    unsafe { heap.init(region.as_mut_ptr() as *mut u8, 8192 * 8, None) }.expect("heap init");
    Box::leak(Box::new(EventSystem::new(cs, heap)))
}

/// Event system whose heap was never initialized; only the startup pool
/// can back events.
fn poolonly_system() -> &'static EventSystem {
    let cs: &'static CriticalSection = Box::leak(Box::new(CriticalSection::new()));
    let heap: &'static Heap = Box::leak(Box::new(Heap::new(cs)));
    Box::leak(Box::new(EventSystem::new(cs, heap)))
}

fn event_to(receiver: i8, event_id: u8, priority: Priority) -> Event {
    Event {
        receiver,
        sender: 0,
        event_type: 0,
        event_id,
        event_data: 0,
        data_ptr: 0,
        priority,
    }
}

// =============================================================================
// S2 — priority-ordered dispatch
// =============================================================================

static S2_ORDER: Mutex<Vec<u8>> = Mutex::new(Vec::new());

fn s2_handler(event: &Event) {
    S2_ORDER.lock().unwrap().push(event.event_id);
}

#[test]
fn priority_order_beats_send_order() {
    let sys = fresh_system();
    let t = sys.handler_create(s2_handler, 0xFF).expect("tasklet");
    sys.run_until_idle();
    S2_ORDER.lock().unwrap().clear();

    sys.send(&event_to(t, 1, Priority::Low)).unwrap();
    sys.send(&event_to(t, 2, Priority::High)).unwrap();
    sys.send(&event_to(t, 3, Priority::Med)).unwrap();

    assert!(sys.dispatch_one());
    assert!(sys.dispatch_one());
    assert!(sys.dispatch_one());
    assert!(!sys.dispatch_one());

    assert_eq!(*S2_ORDER.lock().unwrap(), vec![2, 3, 1]);
}

static FIFO_ORDER: Mutex<Vec<u8>> = Mutex::new(Vec::new());

fn fifo_handler(event: &Event) {
    FIFO_ORDER.lock().unwrap().push(event.event_id);
}

#[test]
fn equal_priority_is_fifo() {
    let sys = fresh_system();
    let t = sys.handler_create(fifo_handler, 0).expect("tasklet");
    sys.run_until_idle();
    FIFO_ORDER.lock().unwrap().clear();

    for id in 0..5 {
        sys.send(&event_to(t, id, Priority::Med)).unwrap();
    }
    sys.run_until_idle();
    assert_eq!(*FIFO_ORDER.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

// =============================================================================
// Tasklet bookkeeping
// =============================================================================

static INIT_TYPE: AtomicU32 = AtomicU32::new(0);

fn init_handler(event: &Event) {
    INIT_TYPE.store(event.event_type as u32 | 0x100, Ordering::SeqCst);
}

fn other_handler(_event: &Event) {}

#[test]
fn handler_create_queues_init_event_and_rejects_duplicates() {
    let sys = fresh_system();
    let t = sys.handler_create(init_handler, 0x42).expect("tasklet");
    assert_eq!(t, 0, "lowest free id");
    assert_eq!(
        sys.handler_create(init_handler, 0),
        Err(EventError::HandlerExists)
    );
    let t2 = sys.handler_create(other_handler, 0).expect("second tasklet");
    assert_eq!(t2, 1);

    sys.run_until_idle();
    assert_eq!(INIT_TYPE.load(Ordering::SeqCst), 0x142);
}

#[test]
fn send_to_unknown_receiver_fails() {
    let sys = fresh_system();
    assert_eq!(
        sys.send(&event_to(7, 0, Priority::Low)),
        Err(EventError::NoReceiver)
    );
}

// =============================================================================
// Storage provenance
// =============================================================================

static POOL_SEEN: AtomicU32 = AtomicU32::new(0);

fn pool_handler(_event: &Event) {
    POOL_SEEN.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn startup_pool_carries_events_without_heap() {
    let sys = poolonly_system();
    let t = sys.handler_create(pool_handler, 0).expect("tasklet");
    sys.run_until_idle();
    POOL_SEEN.store(0, Ordering::SeqCst);

    // The full pool fits ten sends; the eleventh has no storage because
    // the heap was never initialized.
    for i in 0..10 {
        sys.send(&event_to(t, i, Priority::Low))
            .unwrap_or_else(|e| panic!("send {} failed: {:?}", i, e));
    }
    assert_eq!(
        sys.send(&event_to(t, 10, Priority::Low)),
        Err(EventError::QueueAllocFail)
    );

    sys.run_until_idle();
    assert_eq!(POOL_SEEN.load(Ordering::SeqCst), 10);

    // Pool recycled; sending works again.
    sys.send(&event_to(t, 0, Priority::Low)).expect("recycled");
    sys.run_until_idle();
}

static DYN_SEEN: AtomicU32 = AtomicU32::new(0);

fn dyn_handler(_event: &Event) {
    DYN_SEEN.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn dynamic_events_return_their_heap_storage() {
    let sys = fresh_system();
    let t = sys.handler_create(dyn_handler, 0).expect("tasklet");
    sys.run_until_idle();

    let heap = heap_of(sys);
    let baseline = heap.allocated_bytes();
    // Overflow the pool so the tail of the burst is heap-backed.
    for i in 0..20 {
        sys.send(&event_to(t, i, Priority::Low)).expect("send");
    }
    assert!(heap.allocated_bytes() > baseline, "burst hit the heap");
    sys.run_until_idle();
    assert_eq!(heap.allocated_bytes(), baseline, "no leaked storage");
}

fn heap_of(sys: &'static EventSystem) -> &'static Heap {
    sys.heap()
}

static USER_SEEN: AtomicU32 = AtomicU32::new(0);

fn user_handler(event: &Event) {
    USER_SEEN.store(event.event_data, Ordering::SeqCst);
}

#[test]
fn user_allocated_send_never_allocates() {
    let sys = poolonly_system();
    let t = sys.handler_create(user_handler, 0).expect("tasklet");
    sys.run_until_idle();

    let mut event = event_to(t, 1, Priority::High);
    event.event_data = 0xBEEF;
    let storage: &'static mut EventStorage = Box::leak(Box::new(EventStorage::new_user(event)));
    sys.send_user_allocated(storage);
    sys.run_until_idle();
    assert_eq!(USER_SEEN.load(Ordering::SeqCst), 0xBEEF);
}

// =============================================================================
// Cancellation & introspection
// =============================================================================

static CANCEL_SEEN: AtomicU32 = AtomicU32::new(0);

fn cancel_handler(_event: &Event) {
    CANCEL_SEEN.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn cancel_queued_removes_the_event() {
    let sys = fresh_system();
    let t = sys.handler_create(cancel_handler, 0).expect("tasklet");
    sys.run_until_idle();
    CANCEL_SEEN.store(0, Ordering::SeqCst);

    sys.send(&event_to(t, 5, Priority::Low)).unwrap();
    assert!(sys.cancel_queued(t, 5));
    assert!(!sys.cancel_queued(t, 5), "already gone");
    sys.run_until_idle();
    assert_eq!(CANCEL_SEEN.load(Ordering::SeqCst), 0);
}

static CURRENT_SYS: OnceLock<&'static EventSystem> = OnceLock::new();
static OBSERVED_TASKLET: AtomicI8 = AtomicI8::new(-1);

fn current_handler(_event: &Event) {
    let sys = CURRENT_SYS.get().unwrap();
    OBSERVED_TASKLET.store(sys.current_tasklet(), Ordering::SeqCst);
}

#[test]
fn current_tasklet_tracks_the_running_handler() {
    let sys = fresh_system();
    CURRENT_SYS.set(sys).ok();
    let t = sys.handler_create(current_handler, 0).expect("tasklet");
    sys.run_until_idle();
    assert_eq!(OBSERVED_TASKLET.load(Ordering::SeqCst), t);
    assert_eq!(sys.current_tasklet(), 0, "idle again");
}
