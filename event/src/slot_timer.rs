//! High-resolution slot timers: any number of logical one-shot timers
//! multiplexed onto a single hardware timer counting 50 µs slots.
//!
//! Logical timers move through four states:
//!
//! - `Stop`: not scheduled.
//! - `Hold`: scheduled behind the currently armed timeout;
//!   `remaining_slots` is the extra wait beyond it.
//! - `Active`: fires at the next hardware interrupt.
//! - `RunInterrupt`: its callback is executing right now.
//!
//! Arming a shorter timeout than the hardware has remaining re-arms the
//! hardware and pushes every active timer back to `Hold` with the
//! difference; a longer one parks as `Hold`.  The hardware interrupt
//! promotes the shortest hold before invoking callbacks, so consecutive
//! expiries chain without idle gaps.
//!
//! Callbacks run in interrupt context, inside the critical section.  They
//! are collected under the state borrow and invoked after it is released
//! so a callback may freely start or stop timers.
//!
//! Platform compensation constants absorb the time spent in the interrupt
//! path on slow targets; they are injected at construction.

use heapless::Vec;
use meshcore_lib::{CriticalCell, CriticalSection};

/// Slot timer identifier assigned at registration, `0..=127`.
pub type SlotTimerId = i8;

/// Slot-timer errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerError {
    /// No timer registered under this id.
    InvalidId,
    /// Registration table is full.
    NoFreeSlot,
}

/// The single hardware one-shot underneath the multiplexer.
pub trait PlatformTimer: Sync {
    fn enable(&self);
    fn disable(&self);
    /// Arm the one-shot for `slots` 50 µs slots.
    fn start(&self, slots: u16);
    /// Slots left on the currently armed timeout.
    fn remaining_slots(&self) -> u16;
}

/// Receiver of slot-timer expiries.
///
/// `timer_interrupt` runs in interrupt context inside the critical
/// section; it must not block and should do its work by posting events.
pub trait SlotTimerClient: Sync {
    fn timer_interrupt(&self, id: SlotTimerId, slots: u16);
}

/// Platform latency compensation, in slots.
#[derive(Clone, Copy, Default)]
pub struct SlotTimerCompensation {
    /// Subtracted from promoted timers to absorb interrupt-path latency.
    pub compensation: u16,
    /// Fine adjustment applied on the re-arm path.
    pub tune: u16,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Stop,
    Hold,
    Active,
    RunInterrupt,
}

struct SlotEntry {
    id: SlotTimerId,
    state: SlotState,
    slots: u16,
    remaining: u16,
    client: &'static dyn SlotTimerClient,
}

const MAX_SLOT_TIMERS: usize = 16;

struct SlotInner {
    timers: Vec<SlotEntry, MAX_SLOT_TIMERS>,
    hw_running: bool,
}

// SAFETY: client references are 'static and Sync; the vec is serialized
// by the critical cell.
unsafe impl Send for SlotInner {}

/// The slot-timer multiplexer.
pub struct SlotTimers {
    platform: &'static dyn PlatformTimer,
    comp: SlotTimerCompensation,
    inner: CriticalCell<SlotInner>,
}

// SAFETY: the platform trait object is Sync by bound.
unsafe impl Sync for SlotTimers {}
unsafe impl Send for SlotTimers {}

impl SlotTimers {
    pub const fn new(
        cs: &'static CriticalSection,
        platform: &'static dyn PlatformTimer,
        comp: SlotTimerCompensation,
    ) -> Self {
        Self {
            platform,
            comp,
            inner: CriticalCell::new(
                cs,
                SlotInner {
                    timers: Vec::new(),
                    hw_running: false,
                },
            ),
        }
    }

    /// Register a logical timer; returns the lowest free id.
    pub fn register(&self, client: &'static dyn SlotTimerClient) -> Result<SlotTimerId, TimerError> {
        self.inner.with(|inner| {
            let mut id: SlotTimerId = -1;
            for candidate in 0..=i8::MAX {
                if !inner.timers.iter().any(|t| t.id == candidate) {
                    id = candidate;
                    break;
                }
            }
            if id < 0 {
                return Err(TimerError::NoFreeSlot);
            }
            inner
                .timers
                .push(SlotEntry {
                    id,
                    state: SlotState::Stop,
                    slots: 0,
                    remaining: 0,
                    client,
                })
                .map_err(|_| TimerError::NoFreeSlot)?;
            Ok(id)
        })
    }

    /// Drop a registration.  A running hardware timeout is left alone;
    /// the interrupt path simply no longer finds the timer.
    pub fn unregister(&self, id: SlotTimerId) -> Result<(), TimerError> {
        self.inner.with(|inner| {
            let idx = inner
                .timers
                .iter()
                .position(|t| t.id == id)
                .ok_or(TimerError::InvalidId)?;
            inner.timers.remove(idx);
            Ok(())
        })
    }

    /// Schedule timer `id` to fire in `slots` slots (zero is coerced to
    /// one).
    pub fn start(&self, id: SlotTimerId, slots: u16) -> Result<(), TimerError> {
        let comp = self.comp;
        self.inner.with(|inner| {
            let idx = inner
                .timers
                .iter()
                .position(|t| t.id == id)
                .ok_or(TimerError::InvalidId)?;

            if inner.hw_running {
                let hw_remaining = self.platform.remaining_slots();
                if hw_remaining > slots {
                    // Shorter than what is armed: re-arm and push every
                    // active timer back by the difference.
                    self.start_platform(inner, slots);
                    let delta = hw_remaining - slots;
                    let rearm_comp = comp.compensation.saturating_sub(comp.tune);
                    for t in inner.timers.iter_mut() {
                        if t.state == SlotState::Active {
                            t.state = SlotState::Hold;
                            t.remaining = 0;
                        }
                        if t.state == SlotState::Hold {
                            t.remaining += delta;
                            if t.remaining > rearm_comp {
                                t.remaining -= rearm_comp;
                            }
                        }
                    }
                    let t = &mut inner.timers[idx];
                    t.state = SlotState::Active;
                    t.slots = slots;
                    t.remaining = slots;
                } else if hw_remaining < slots {
                    let t = &mut inner.timers[idx];
                    t.state = SlotState::Hold;
                    t.slots = slots;
                    t.remaining = slots - hw_remaining;
                } else {
                    let t = &mut inner.timers[idx];
                    t.state = SlotState::Active;
                    t.slots = slots;
                    t.remaining = slots;
                }
            } else {
                let t = &mut inner.timers[idx];
                t.state = SlotState::Hold;
                t.slots = slots;
                t.remaining = slots;
                self.promote_next(inner);
            }
            Ok(())
        })
    }

    /// Cancel timer `id`.  When no active timer remains, the shortest
    /// hold inherits the hardware remainder and is promoted.
    pub fn stop(&self, id: SlotTimerId) -> Result<(), TimerError> {
        self.inner.with(|inner| {
            let idx = inner
                .timers
                .iter()
                .position(|t| t.id == id)
                .ok_or(TimerError::InvalidId)?;
            if inner.timers[idx].state == SlotState::Stop {
                return Ok(());
            }
            inner.timers[idx].state = SlotState::Stop;
            inner.timers[idx].remaining = 0;

            if inner.timers.iter().any(|t| t.state == SlotState::Active) {
                return Ok(());
            }
            // No active timer left: fold the armed remainder back into
            // the holds and promote the shortest.
            let hw_remaining = self.platform.remaining_slots();
            for t in inner.timers.iter_mut() {
                if t.state == SlotState::Hold {
                    t.remaining += hw_remaining;
                }
            }
            let mut first: Option<usize> = None;
            for (i, t) in inner.timers.iter().enumerate() {
                if t.state == SlotState::Hold {
                    match first {
                        Some(f) if inner.timers[f].remaining <= t.remaining => {}
                        _ => first = Some(i),
                    }
                }
            }
            if let Some(f) = first {
                let lead = inner.timers[f].remaining;
                inner.timers[f].state = SlotState::Active;
                self.start_platform(inner, lead);
                for t in inner.timers.iter_mut() {
                    if t.state == SlotState::Hold {
                        if t.remaining == lead {
                            t.state = SlotState::Active;
                        } else {
                            t.remaining -= lead;
                        }
                    }
                }
            }
            Ok(())
        })
    }

    /// Hardware expiry entry point; call from the platform timer ISR.
    ///
    /// Active timers are marked, the next hold is promoted and the
    /// hardware re-armed, then the marked callbacks run (still inside the
    /// critical section).
    pub fn interrupt(&self) {
        let cs = self.inner.section();
        let _guard = cs.lock();

        let mut fired: Vec<(SlotTimerId, u16, &'static dyn SlotTimerClient), MAX_SLOT_TIMERS> =
            Vec::new();
        self.inner.with(|inner| {
            inner.hw_running = false;
            for t in inner.timers.iter_mut() {
                if t.state == SlotState::Active {
                    t.state = SlotState::RunInterrupt;
                }
            }
            self.promote_next(inner);
            for t in inner.timers.iter_mut() {
                if t.state == SlotState::RunInterrupt {
                    t.state = SlotState::Stop;
                    let _ = fired.push((t.id, t.slots, t.client));
                }
            }
        });

        // Callbacks may re-enter start()/stop(); the state borrow is
        // released, the critical section is still held.
        for (id, slots, client) in fired {
            client.timer_interrupt(id, slots);
        }
    }

    /// Disable the hardware timer for low-power entry.  Returns false if
    /// it was not running.
    pub fn sleep(&self) -> bool {
        self.inner.with(|inner| {
            if inner.hw_running {
                self.platform.disable();
                inner.hw_running = false;
                true
            } else {
                false
            }
        })
    }

    /// True while the hardware one-shot is armed.
    pub fn hw_running(&self) -> bool {
        self.inner.with(|inner| inner.hw_running)
    }

    fn start_platform(&self, inner: &mut SlotInner, slots: u16) {
        let slots = if slots == 0 { 1 } else { slots };
        self.platform.start(slots);
        inner.hw_running = true;
    }

    /// Promote the shortest hold to active and arm the hardware,
    /// rebasing the other holds on it.
    fn promote_next(&self, inner: &mut SlotInner) {
        let mut first: Option<usize> = None;
        for (i, t) in inner.timers.iter().enumerate() {
            if t.state == SlotState::Hold {
                match first {
                    Some(f) if inner.timers[f].remaining <= t.remaining => {}
                    _ => first = Some(i),
                }
            }
        }
        let f = match first {
            Some(f) => f,
            None => return,
        };
        inner.timers[f].state = SlotState::Active;
        if inner.timers[f].remaining > self.comp.compensation {
            inner.timers[f].remaining -= self.comp.compensation;
        }
        let lead = inner.timers[f].remaining;
        self.start_platform(inner, lead);
        for t in inner.timers.iter_mut() {
            if t.state == SlotState::Hold {
                if t.remaining == lead {
                    t.state = SlotState::Active;
                } else {
                    t.remaining -= lead;
                    if t.remaining > self.comp.compensation {
                        t.remaining -= self.comp.compensation;
                    }
                }
            }
        }
    }
}
