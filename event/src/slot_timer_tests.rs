//! Slot timer tests: hold/active rebalancing, interrupt dispatch,
//! stop-path promotion and re-entrant callbacks.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Mutex;
use std::sync::OnceLock;

use meshcore_lib::CriticalSection;

use crate::slot_timer::{
    PlatformTimer, SlotTimerClient, SlotTimerCompensation, SlotTimerId, SlotTimers, TimerError,
};

// =============================================================================
// Mock hardware timer
// =============================================================================

/// Scripted one-shot: records what was armed, returns a settable
/// "remaining" count.
struct MockHw {
    armed: AtomicU16,
    remaining: AtomicU16,
    enabled: AtomicBool,
}

impl MockHw {
    const fn new() -> Self {
        Self {
            armed: AtomicU16::new(0),
            remaining: AtomicU16::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    fn set_remaining(&self, slots: u16) {
        self.remaining.store(slots, Ordering::SeqCst);
    }

    fn armed(&self) -> u16 {
        self.armed.load(Ordering::SeqCst)
    }
}

impl PlatformTimer for MockHw {
    fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }
    fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }
    fn start(&self, slots: u16) {
        self.armed.store(slots, Ordering::SeqCst);
        self.remaining.store(slots, Ordering::SeqCst);
    }
    fn remaining_slots(&self) -> u16 {
        self.remaining.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Recording client
// =============================================================================

struct Recorder {
    fired: Mutex<Vec<(SlotTimerId, u16)>>,
}

impl Recorder {
    fn new() -> Self {
        Self {
            fired: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Vec<(SlotTimerId, u16)> {
        std::mem::take(&mut *self.fired.lock().unwrap())
    }
}

impl SlotTimerClient for Recorder {
    fn timer_interrupt(&self, id: SlotTimerId, slots: u16) {
        self.fired.lock().unwrap().push((id, slots));
    }
}

fn fresh_timers(comp: SlotTimerCompensation) -> (&'static SlotTimers, &'static MockHw) {
    let cs: &'static CriticalSection = Box::leak(Box::new(CriticalSection::new()));
    let hw: &'static MockHw = Box::leak(Box::new(MockHw::new()));
    let timers: &'static SlotTimers = Box::leak(Box::new(SlotTimers::new(cs, hw, comp)));
    (timers, hw)
}

fn recorder() -> &'static Recorder {
    Box::leak(Box::new(Recorder::new()))
}

// =============================================================================
// Basic arming and dispatch
// =============================================================================

#[test]
fn single_timer_arms_and_fires() {
    let (timers, hw) = fresh_timers(SlotTimerCompensation::default());
    let rec = recorder();
    let id = timers.register(rec).expect("register");

    timers.start(id, 120).expect("start");
    assert_eq!(hw.armed(), 120);
    assert!(timers.hw_running());

    timers.interrupt();
    assert_eq!(rec.take(), vec![(id, 120)]);
    assert!(!timers.hw_running(), "nothing left to arm");
}

#[test]
fn zero_slots_is_coerced_to_one() {
    let (timers, hw) = fresh_timers(SlotTimerCompensation::default());
    let rec = recorder();
    let id = timers.register(rec).expect("register");
    timers.start(id, 0).expect("start");
    assert_eq!(hw.armed(), 1);
}

#[test]
fn unknown_id_is_rejected() {
    let (timers, _) = fresh_timers(SlotTimerCompensation::default());
    assert_eq!(timers.start(3, 10), Err(TimerError::InvalidId));
    assert_eq!(timers.stop(3), Err(TimerError::InvalidId));
}

// =============================================================================
// Hold/active rebalancing
// =============================================================================

#[test]
fn shorter_start_preempts_and_holds_the_rest() {
    let (timers, hw) = fresh_timers(SlotTimerCompensation::default());
    let rec = recorder();
    let a = timers.register(rec).expect("a");
    let b = timers.register(rec).expect("b");

    timers.start(a, 100).expect("start a");
    assert_eq!(hw.armed(), 100);

    // Nothing has elapsed; b wants to fire 60 slots earlier.
    hw.set_remaining(100);
    timers.start(b, 40).expect("start b");
    assert_eq!(hw.armed(), 40, "hardware re-armed for the shorter wait");

    timers.interrupt();
    assert_eq!(rec.take(), vec![(b, 40)]);
    assert_eq!(hw.armed(), 60, "a promoted with the residue");

    timers.interrupt();
    assert_eq!(rec.take(), vec![(a, 100)], "callback gets original slots");
}

#[test]
fn longer_start_parks_as_hold() {
    let (timers, hw) = fresh_timers(SlotTimerCompensation::default());
    let rec = recorder();
    let a = timers.register(rec).expect("a");
    let b = timers.register(rec).expect("b");

    timers.start(a, 50).expect("start a");
    hw.set_remaining(50);
    timers.start(b, 80).expect("start b");
    assert_eq!(hw.armed(), 50, "armed timeout untouched");

    timers.interrupt();
    assert_eq!(rec.take(), vec![(a, 50)]);
    assert_eq!(hw.armed(), 30, "b scheduled for the difference");

    timers.interrupt();
    assert_eq!(rec.take(), vec![(b, 80)]);
}

#[test]
fn equal_deadline_fires_together() {
    let (timers, hw) = fresh_timers(SlotTimerCompensation::default());
    let rec = recorder();
    let a = timers.register(rec).expect("a");
    let b = timers.register(rec).expect("b");

    timers.start(a, 64).expect("start a");
    hw.set_remaining(64);
    timers.start(b, 64).expect("start b");

    timers.interrupt();
    let mut fired = rec.take();
    fired.sort();
    assert_eq!(fired, vec![(a, 64), (b, 64)]);
}

// =============================================================================
// Stop-path promotion
// =============================================================================

#[test]
fn stopping_the_active_timer_promotes_the_hold() {
    let (timers, hw) = fresh_timers(SlotTimerCompensation::default());
    let rec = recorder();
    let a = timers.register(rec).expect("a");
    let b = timers.register(rec).expect("b");

    timers.start(a, 100).expect("start a");
    hw.set_remaining(100);
    timers.start(b, 150).expect("start b");
    // 30 slots elapse before a is cancelled.
    hw.set_remaining(70);
    timers.stop(a).expect("stop a");

    // b owed 50 beyond a's expiry; with 70 still armed it needs 120.
    assert_eq!(hw.armed(), 120);
    timers.interrupt();
    assert_eq!(rec.take(), vec![(b, 150)]);
}

#[test]
fn stop_is_idempotent_and_sleep_disables_hw() {
    let (timers, hw) = fresh_timers(SlotTimerCompensation::default());
    let rec = recorder();
    let a = timers.register(rec).expect("a");

    timers.start(a, 10).expect("start");
    assert!(timers.sleep(), "was running");
    assert!(!hw.enabled.load(Ordering::SeqCst));
    assert!(!timers.sleep(), "already stopped");

    assert_eq!(timers.stop(a), Ok(()));
    assert_eq!(timers.stop(a), Ok(()), "stop of stopped timer is a no-op");
}

// =============================================================================
// Re-entrant callback
// =============================================================================

static PERIODIC_TIMERS: OnceLock<&'static SlotTimers> = OnceLock::new();
static PERIODIC_COUNT: AtomicU32 = AtomicU32::new(0);

struct Periodic;

impl SlotTimerClient for Periodic {
    fn timer_interrupt(&self, id: SlotTimerId, slots: u16) {
        PERIODIC_COUNT.fetch_add(1, Ordering::SeqCst);
        // Restarting from the callback is the normal periodic pattern.
        PERIODIC_TIMERS.get().unwrap().start(id, slots).unwrap();
    }
}

#[test]
fn callback_may_restart_its_own_timer() {
    let (timers, hw) = fresh_timers(SlotTimerCompensation::default());
    PERIODIC_TIMERS.set(timers).ok();
    static CLIENT: Periodic = Periodic;
    let id = timers.register(&CLIENT).expect("register");

    timers.start(id, 200).expect("start");
    for _ in 0..3 {
        timers.interrupt();
    }
    assert_eq!(PERIODIC_COUNT.load(Ordering::SeqCst), 3);
    assert_eq!(hw.armed(), 200, "re-armed by the callback each time");
}
