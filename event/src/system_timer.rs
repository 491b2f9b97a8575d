//! System timers: the low-resolution tick plant feeding the event queue.
//!
//! Timer entries carry their event storage with them, so expiry delivers
//! an event without allocating.  The pending list is kept ascending by
//! launch tick under wrap-aware comparison; entries scheduled for the
//! same tick fire in request order.  Expired periodic entries re-arm when
//! their event finishes delivery, which bounds drift to one tick and
//! keeps the long-run rate exact.
//!
//! The legacy millisecond API preserves the historical rounding rule
//! (`ms > 2·tick → ms/tick + 1`, else 2 ticks) unchanged for
//! compatibility; tick-based requests are exact and preferred for new
//! code.

use core::ptr::NonNull;

use meshcore_lib::{ticks_before, ticks_before_or_at};
use meshcore_mem::HeapBox;

use crate::event::{
    Event, EventError, EventState, EventStorage, NodeRef, Priority, Provenance, TaskletId,
};
use crate::eventloop::{storage_ptr, CoreInner, EventSystem};

/// Tick rate of the system timer.  Must divide 1000 evenly so every tick
/// is a whole number of milliseconds.
pub const EVENT_TIMER_HZ: u32 = 100;

/// Milliseconds per tick.
pub const TICK_PERIOD_MS: u32 = 1000 / EVENT_TIMER_HZ;

const _: () = assert!(1000 % EVENT_TIMER_HZ == 0);

/// Pre-allocated timer entries available before the heap is usable.
pub(crate) const ST_STARTUP_POOL: usize = 6;

/// One system timer: schedule plus embedded event storage.
pub(crate) struct SysTimerEntry {
    pub(crate) launch_tick: u32,
    /// 0 = one-shot; otherwise the period in ticks.
    pub(crate) period_ticks: u32,
    pub(crate) storage: EventStorage,
    pub(crate) next: Option<TimerRef>,
}

impl SysTimerEntry {
    pub(crate) const fn idle() -> Self {
        Self {
            launch_tick: 0,
            period_ticks: 0,
            storage: EventStorage::idle(),
            next: None,
        }
    }
}

/// Link to a timer entry: pool entries by index, heap entries by pointer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerRef {
    Pool(u8),
    Raw(NonNull<SysTimerEntry>),
}

/// Resolve a timer link; valid only inside the critical cell borrow.
fn entry_ptr(inner: &mut CoreInner, timer: TimerRef) -> *mut SysTimerEntry {
    match timer {
        TimerRef::Pool(i) => &mut inner.timer_pool[i as usize],
        TimerRef::Raw(p) => p.as_ptr(),
    }
}

/// Queue link for the event embedded in a timer entry.
fn event_node(inner: &mut CoreInner, timer: TimerRef) -> NodeRef {
    match timer {
        TimerRef::Pool(i) => NodeRef::TimerPool(i),
        TimerRef::Raw(p) => {
            let storage = unsafe { &mut (*p.as_ptr()).storage };
            NodeRef::Raw(NonNull::from(storage))
        }
    }
}

impl CoreInner {
    /// Fetch a timer entry: recycled first, then the heap (persistent).
    fn timer_struct_get(&mut self, heap: &'static meshcore_mem::Heap) -> Option<TimerRef> {
        if let Some(t) = self.timer_free.pop() {
            return Some(t);
        }
        let entry = HeapBox::new_in(heap, SysTimerEntry::idle())?;
        Some(TimerRef::Raw(HeapBox::into_raw(entry)))
    }

    /// Ordered insert: before the first entry launching strictly later,
    /// so same-tick timers fire in request order.
    fn timer_list_insert(&mut self, timer: TimerRef) {
        unsafe {
            let at = (*entry_ptr(self, timer)).launch_tick;
            let mut prev: Option<TimerRef> = None;
            let mut cursor = self.timer_head;
            while let Some(c) = cursor {
                if ticks_before(at, (*entry_ptr(self, c)).launch_tick) {
                    break;
                }
                prev = Some(c);
                cursor = (*entry_ptr(self, c)).next;
            }
            (*entry_ptr(self, timer)).next = cursor;
            match prev {
                None => self.timer_head = Some(timer),
                Some(p) => (*entry_ptr(self, p)).next = Some(timer),
            }
        }
    }

    fn timer_list_remove(&mut self, timer: TimerRef) -> bool {
        unsafe {
            let mut prev: Option<TimerRef> = None;
            let mut cursor = self.timer_head;
            while let Some(c) = cursor {
                if c == timer {
                    let next = (*entry_ptr(self, c)).next;
                    match prev {
                        None => self.timer_head = next,
                        Some(p) => (*entry_ptr(self, p)).next = next,
                    }
                    (*entry_ptr(self, c)).next = None;
                    return true;
                }
                prev = Some(c);
                cursor = (*entry_ptr(self, c)).next;
            }
        }
        false
    }

    /// Called when a timer-owned event finishes delivery or is cancelled:
    /// one-shots return to the free pool, periodics advance and re-arm
    /// (immediately when already overdue).
    pub(crate) fn timer_event_free(&mut self, timer: TimerRef, heap: &'static meshcore_mem::Heap) {
        unsafe {
            let entry = entry_ptr(self, timer);
            if (*entry).period_ticks == 0 {
                if self.timer_free.push(timer).is_err() {
                    // Cache full; a heap-backed entry goes back to the heap.
                    if let TimerRef::Raw(p) = timer {
                        drop(HeapBox::from_raw(heap, p));
                    }
                }
                return;
            }
            (*entry).launch_tick = (*entry).launch_tick.wrapping_add((*entry).period_ticks);
            if ticks_before_or_at((*entry).launch_tick, self.sys_ticks) {
                let node = event_node(self, timer);
                self.queue_insert(node);
            } else {
                self.timer_list_insert(timer);
            }
        }
    }

    fn timer_request_at_internal(
        &mut self,
        event: &Event,
        at: u32,
        period: u32,
        heap: &'static meshcore_mem::Heap,
    ) -> Result<(), EventError> {
        // Timer events must be deliverable; queueing for a tasklet that
        // does not exist would leak the entry.
        if !self.tasklet_exists(event.receiver) {
            return Err(EventError::NoReceiver);
        }
        let timer = self
            .timer_struct_get(heap)
            .ok_or(EventError::QueueAllocFail)?;
        unsafe {
            let entry = entry_ptr(self, timer);
            (*entry).launch_tick = at;
            (*entry).period_ticks = period;
            (*entry).next = None;
            (*entry).storage.event = *event;
            (*entry).storage.state = EventState::Unqueued;
            (*entry).storage.next = None;
            (*entry).storage.provenance = match timer {
                TimerRef::Pool(i) => Provenance::TimerPool(i),
                TimerRef::Raw(p) => Provenance::TimerDyn(p),
            };
        }
        if ticks_before_or_at(at, self.sys_ticks) {
            let node = event_node(self, timer);
            self.queue_insert(node);
        } else {
            self.timer_list_insert(timer);
        }
        Ok(())
    }
}

impl EventSystem {
    /// Monotonic tick counter.
    pub fn ticks(&self) -> u32 {
        self.inner.with(|inner| inner.sys_ticks)
    }

    /// Advance the tick counter and deliver every due timer event.  The
    /// platform tick source calls this once per tick; after sleep it is
    /// called with the slept tick count to resynchronize.
    pub fn tick_update(&self, ticks: u32) {
        let delivered = self.inner.with(|inner| {
            inner.ensure_init();
            inner.sys_ticks = inner.sys_ticks.wrapping_add(ticks);
            let now = inner.sys_ticks;
            let mut delivered = 0u32;
            while let Some(head) = Self::pop_due(inner, now) {
                let node = event_node(inner, head);
                inner.queue_insert(node);
                delivered += 1;
            }
            delivered
        });
        if delivered > 0 {
            self.signal();
        }
    }

    fn pop_due(inner: &mut CoreInner, now: u32) -> Option<TimerRef> {
        let head = inner.timer_head?;
        unsafe {
            let entry = entry_ptr(inner, head);
            if ticks_before_or_at((*entry).launch_tick, now) {
                inner.timer_head = (*entry).next;
                (*entry).next = None;
                Some(head)
            } else {
                None
            }
        }
    }

    /// Resynchronize after a low-power sleep of `sleep_ms` milliseconds.
    pub fn timer_synch_after_sleep(&self, sleep_ms: u32) {
        self.tick_update(sleep_ms / TICK_PERIOD_MS + 1);
    }

    /// One-shot at an absolute tick; already-past ticks dispatch
    /// immediately.
    pub fn timer_request_at(&self, event: &Event, at: u32) -> Result<(), EventError> {
        let r = self.inner.with(|inner| {
            inner.ensure_init();
            inner.timer_request_at_internal(event, at, 0, self.heap)
        });
        if r.is_ok() {
            self.signal();
        }
        r
    }

    /// One-shot `delta` ticks from now.
    pub fn timer_request_in(&self, event: &Event, delta: i32) -> Result<(), EventError> {
        let r = self.inner.with(|inner| {
            inner.ensure_init();
            let at = inner.sys_ticks.wrapping_add(delta as u32);
            inner.timer_request_at_internal(event, at, 0, self.heap)
        });
        if r.is_ok() {
            self.signal();
        }
        r
    }

    /// Periodic every `period` ticks, first firing at `now + period`.
    pub fn timer_request_every(&self, event: &Event, period: i32) -> Result<(), EventError> {
        if period <= 0 {
            return Err(EventError::QueueAllocFail);
        }
        let r = self.inner.with(|inner| {
            inner.ensure_init();
            let at = inner.sys_ticks.wrapping_add(period as u32);
            inner.timer_request_at_internal(event, at, period as u32, self.heap)
        });
        if r.is_ok() {
            self.signal();
        }
        r
    }

    /// Legacy millisecond one-shot with the historical rounding rule,
    /// preserved verbatim for compatibility.  A request of `ms` at or
    /// under two tick periods becomes two ticks; anything longer becomes
    /// `ms / tick + 1` ticks.
    pub fn timer_request_legacy_ms(
        &self,
        event_id: u8,
        event_type: u8,
        tasklet_id: TaskletId,
        ms: u32,
    ) -> Result<(), EventError> {
        let event = Event {
            receiver: tasklet_id,
            sender: 0,
            event_type,
            event_id,
            event_data: 0,
            data_ptr: 0,
            priority: Priority::Med,
        };
        let ticks = if ms > 2 * TICK_PERIOD_MS {
            ms / TICK_PERIOD_MS + 1
        } else {
            2
        };
        let r = self.inner.with(|inner| {
            inner.ensure_init();
            let at = inner.sys_ticks.wrapping_add(ticks);
            inner.timer_request_at_internal(&event, at, 0, self.heap)
        });
        if r.is_ok() {
            self.signal();
        }
        r
    }

    /// Cancel by `(event_id, tasklet)`: pending timers first, then a
    /// timer event already sitting in the queue.
    pub fn timer_cancel(&self, event_id: u8, tasklet_id: TaskletId) -> bool {
        self.inner.with(|inner| {
            // Pending timer list.
            let mut cursor = inner.timer_head;
            while let Some(c) = cursor {
                unsafe {
                    let entry = entry_ptr(inner, c);
                    let event = &(*entry).storage.event;
                    if event.receiver == tasklet_id && event.event_id == event_id {
                        inner.timer_list_remove(c);
                        (*entry_ptr(inner, c)).period_ticks = 0;
                        inner.timer_event_free(c, self.heap);
                        return true;
                    }
                    cursor = (*entry).next;
                }
            }
            // Already queued as an event.
            if let Some(node) = inner.queue_find(tasklet_id, event_id) {
                unsafe {
                    let timer = match (*storage_ptr(inner, node)).provenance {
                        Provenance::TimerPool(i) => TimerRef::Pool(i),
                        Provenance::TimerDyn(p) => TimerRef::Raw(p),
                        _ => return false,
                    };
                    (*entry_ptr(inner, timer)).period_ticks = 0;
                }
                inner.queue_remove(node);
                inner.free_push(node, self.heap);
                return true;
            }
            false
        })
    }

    /// Ticks until the next pending timer: 0 when none, 1 when overdue.
    pub fn shortest_active_timer(&self) -> u32 {
        self.inner.with(|inner| {
            let head = match inner.timer_head {
                Some(h) => h,
                None => return 0,
            };
            unsafe {
                let launch = (*entry_ptr(inner, head)).launch_tick;
                if ticks_before_or_at(launch, inner.sys_ticks) {
                    1
                } else {
                    launch.wrapping_sub(inner.sys_ticks)
                }
            }
        })
    }

    /// Pending timer count; diagnostics only.
    pub fn pending_timers(&self) -> usize {
        self.inner.with(|inner| {
            let mut n = 0;
            let mut cursor = inner.timer_head;
            while let Some(c) = cursor {
                n += 1;
                cursor = unsafe { (*entry_ptr(inner, c)).next };
            }
            n
        })
    }
}

pub const fn ticks_to_ms(ticks: u32) -> u32 {
    ticks * TICK_PERIOD_MS
}

pub const fn ms_to_ticks(ms: u32) -> u32 {
    ms / TICK_PERIOD_MS
}
