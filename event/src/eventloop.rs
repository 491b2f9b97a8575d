//! Cooperative event loop: tasklets, the prioritized active queue, and the
//! scheduler seam.
//!
//! Tasklets are immortal named handlers; events are copied into backing
//! storage and delivered strictly in priority order, FIFO within a
//! priority.  Storage comes from four places (startup pool, heap, timer
//! entries, caller-owned) and is returned along the same path after the
//! handler runs, so a startup burst can proceed before the heap is usable
//! and timer ticks never allocate.
//!
//! # Queue representation
//!
//! The active queue is a singly-linked list threaded through the storages
//! themselves.  Pool-resident storages are addressed by index (their
//! memory lives inside [`CoreInner`]); heap and caller-owned storages by
//! pointer.  All raw-pointer handling stays in this module and in the
//! system-timer sibling, inside the critical cell borrow.
//!
//! # Scheduler contract
//!
//! [`EventSystem::run`] holds the scheduler mutex (via [`SchedulerHooks`])
//! while handlers execute and releases it inside `idle()`, so host threads
//! may acquire the same mutex to mutate stack state knowing no handler
//! runs concurrently.  `send()` signals the loop through a registered wake
//! hook, which is ISR-safe.

use core::mem;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use heapless::Vec;
use meshcore_lib::{CriticalCell, CriticalSection};
use meshcore_mem::{Heap, HeapBox};

use crate::event::{
    Event, EventError, EventState, EventStorage, NodeRef, Priority, Provenance, TaskletId,
};
use crate::system_timer::{SysTimerEntry, TimerRef, ST_STARTUP_POOL};

/// Pre-allocated event storages available before the heap is initialized.
pub(crate) const STARTUP_EVENT_POOL_SIZE: usize = 10;

/// Tasklet id space is 0..=127.
const MAX_TASKLETS: usize = 128;

/// Recycled dynamic timer entries kept around instead of freeing.
const TIMER_FREE_CACHE: usize = 16;

pub(crate) struct Tasklet {
    pub(crate) id: TaskletId,
    pub(crate) handler: fn(&Event),
}

pub(crate) struct CoreInner {
    initialized: bool,
    pub(crate) tasklets: Vec<Tasklet, MAX_TASKLETS>,
    pub(crate) startup_pool: [EventStorage; STARTUP_EVENT_POOL_SIZE],
    free_events: Vec<u8, STARTUP_EVENT_POOL_SIZE>,
    queue_head: Option<NodeRef>,
    current_tasklet: TaskletId,
    // The system-timer plant shares this state so one critical section
    // covers tick delivery and queue manipulation.
    pub(crate) timer_pool: [SysTimerEntry; ST_STARTUP_POOL],
    pub(crate) timer_free: Vec<TimerRef, TIMER_FREE_CACHE>,
    pub(crate) timer_head: Option<TimerRef>,
    pub(crate) sys_ticks: u32,
}

// SAFETY: the raw links reference pool slots inside this struct, heap
// blocks, or caller-provided static storage; access is serialized by the
// critical cell.
unsafe impl Send for CoreInner {}

/// Resolve a queue link to its storage.  Valid only inside the critical
/// cell borrow that produced `inner`.
pub(crate) fn storage_ptr(inner: &mut CoreInner, node: NodeRef) -> *mut EventStorage {
    match node {
        NodeRef::Pool(i) => &mut inner.startup_pool[i as usize],
        NodeRef::TimerPool(i) => &mut inner.timer_pool[i as usize].storage,
        NodeRef::Raw(p) => p.as_ptr(),
    }
}

impl CoreInner {
    pub(crate) fn ensure_init(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;
        for i in 0..STARTUP_EVENT_POOL_SIZE as u8 {
            let _ = self.free_events.push(i);
        }
        for i in 0..ST_STARTUP_POOL as u8 {
            let _ = self.timer_free.push(TimerRef::Pool(i));
        }
    }

    /// Fetch storage for a new event: startup pool first, then the heap.
    fn event_core_get(&mut self, heap: &'static Heap) -> Option<NodeRef> {
        if let Some(i) = self.free_events.pop() {
            let storage = &mut self.startup_pool[i as usize];
            storage.provenance = Provenance::StartupPool(i);
            storage.state = EventState::Unqueued;
            storage.next = None;
            storage.event.data_ptr = 0;
            storage.event.priority = Priority::Low;
            return Some(NodeRef::Pool(i));
        }
        let node = HeapBox::new_temporary_in(heap, EventStorage::idle())?;
        let mut ptr = HeapBox::into_raw(node);
        unsafe {
            let storage = ptr.as_mut();
            storage.provenance = Provenance::Dynamic;
            storage.event.data_ptr = 0;
            storage.event.priority = Priority::Low;
        }
        Some(NodeRef::Raw(ptr))
    }

    /// Insert into the active queue: before the first entry of lower
    /// priority, so equal priorities stay FIFO.
    pub(crate) fn queue_insert(&mut self, node: NodeRef) {
        unsafe {
            let priority = (*storage_ptr(self, node)).event.priority;
            let mut prev: Option<NodeRef> = None;
            let mut cursor = self.queue_head;
            while let Some(c) = cursor {
                if (*storage_ptr(self, c)).event.priority > priority {
                    break;
                }
                prev = Some(c);
                cursor = (*storage_ptr(self, c)).next;
            }
            (*storage_ptr(self, node)).next = cursor;
            match prev {
                None => self.queue_head = Some(node),
                Some(p) => (*storage_ptr(self, p)).next = Some(node),
            }
            (*storage_ptr(self, node)).state = EventState::Queued;
        }
    }

    fn queue_pop(&mut self) -> Option<NodeRef> {
        let head = self.queue_head?;
        unsafe {
            let storage = storage_ptr(self, head);
            self.queue_head = (*storage).next;
            (*storage).next = None;
            (*storage).state = EventState::Running;
        }
        Some(head)
    }

    pub(crate) fn queue_remove(&mut self, node: NodeRef) -> bool {
        unsafe {
            let mut prev: Option<NodeRef> = None;
            let mut cursor = self.queue_head;
            while let Some(c) = cursor {
                if c == node {
                    let next = (*storage_ptr(self, c)).next;
                    match prev {
                        None => self.queue_head = next,
                        Some(p) => (*storage_ptr(self, p)).next = next,
                    }
                    let storage = storage_ptr(self, c);
                    (*storage).next = None;
                    (*storage).state = EventState::Unqueued;
                    return true;
                }
                prev = Some(c);
                cursor = (*storage_ptr(self, c)).next;
            }
        }
        false
    }

    pub(crate) fn queue_find(&mut self, receiver: TaskletId, event_id: u8) -> Option<NodeRef> {
        unsafe {
            let mut cursor = self.queue_head;
            while let Some(c) = cursor {
                let event = &(*storage_ptr(self, c)).event;
                if event.receiver == receiver && event.event_id == event_id {
                    return Some(c);
                }
                cursor = (*storage_ptr(self, c)).next;
            }
        }
        None
    }

    /// Return storage after delivery or cancellation, per provenance.
    pub(crate) fn free_push(&mut self, node: NodeRef, heap: &'static Heap) {
        unsafe {
            let storage = storage_ptr(self, node);
            match (*storage).provenance {
                Provenance::StartupPool(i) => {
                    (*storage).state = EventState::Unqueued;
                    let _ = self.free_events.push(i);
                }
                Provenance::Dynamic => {
                    if let NodeRef::Raw(p) = node {
                        drop(HeapBox::from_raw(heap, p));
                    }
                }
                Provenance::TimerPool(i) => {
                    (*storage).state = EventState::Unqueued;
                    self.timer_event_free(TimerRef::Pool(i), heap);
                }
                Provenance::TimerDyn(entry) => {
                    (*storage).state = EventState::Unqueued;
                    self.timer_event_free(TimerRef::Raw(entry), heap);
                }
                Provenance::User => {}
            }
        }
    }

    pub(crate) fn tasklet_exists(&self, id: TaskletId) -> bool {
        self.tasklets.iter().any(|t| t.id == id)
    }
}

/// Hooks tying the event loop to the host scheduler.
///
/// `idle()` must release the scheduler mutex, block until a wake signal,
/// and re-acquire the mutex before returning.  On a single-threaded port
/// all of these may be no-ops; the contract is still satisfied because
/// nothing else can run.
pub trait SchedulerHooks {
    fn mutex_wait(&self);
    fn mutex_release(&self);
    fn mutex_am_owner(&self) -> bool;
    fn idle(&self);
}

/// Hooks for a bare single-threaded port: no mutex, idle spins.
pub struct SingleThreadHooks;

impl SchedulerHooks for SingleThreadHooks {
    fn mutex_wait(&self) {}
    fn mutex_release(&self) {}
    fn mutex_am_owner(&self) -> bool {
        true
    }
    fn idle(&self) {
        core::hint::spin_loop();
    }
}

/// The event system: tasklet registry, active queue, and system timers.
pub struct EventSystem {
    pub(crate) heap: &'static Heap,
    pub(crate) inner: CriticalCell<CoreInner>,
    signal_hook: AtomicPtr<()>,
    pending: AtomicBool,
}

impl EventSystem {
    pub const fn new(cs: &'static CriticalSection, heap: &'static Heap) -> Self {
        Self {
            heap,
            inner: CriticalCell::new(
                cs,
                CoreInner {
                    initialized: false,
                    tasklets: Vec::new(),
                    startup_pool: [const { EventStorage::idle() }; STARTUP_EVENT_POOL_SIZE],
                    free_events: Vec::new(),
                    queue_head: None,
                    current_tasklet: 0,
                    timer_pool: [const { SysTimerEntry::idle() }; ST_STARTUP_POOL],
                    timer_free: Vec::new(),
                    timer_head: None,
                    sys_ticks: 0,
                },
            ),
            signal_hook: AtomicPtr::new(core::ptr::null_mut()),
            pending: AtomicBool::new(false),
        }
    }

    /// Register a wake hook called whenever an event is queued; the hook
    /// must be callable from interrupt context.
    pub fn register_signal_hook(&self, hook: fn()) {
        self.signal_hook.store(hook as *mut (), Ordering::Release);
    }

    pub(crate) fn signal(&self) {
        self.pending.store(true, Ordering::Release);
        let raw = self.signal_hook.load(Ordering::Acquire);
        if !raw.is_null() {
            let hook: fn() = unsafe { mem::transmute(raw) };
            hook();
        }
    }

    /// Consume the pending-wake flag; hosts poll this from their idle
    /// loops when no signal hook is registered.
    pub fn take_signal(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    /// Create a tasklet and queue its init event of `init_event_type`.
    /// One tasklet per handler function.
    pub fn handler_create(
        &self,
        handler: fn(&Event),
        init_event_type: u8,
    ) -> Result<TaskletId, EventError> {
        let id = self.inner.with(|inner| {
            inner.ensure_init();
            if inner
                .tasklets
                .iter()
                .any(|t| t.handler as usize == handler as usize)
            {
                return Err(EventError::HandlerExists);
            }
            let mut id: TaskletId = -1;
            for candidate in 0..=i8::MAX {
                if !inner.tasklet_exists(candidate) {
                    id = candidate;
                    break;
                }
            }
            if id < 0 {
                return Err(EventError::HandlerAllocFail);
            }
            let node = inner
                .event_core_get(self.heap)
                .ok_or(EventError::HandlerAllocFail)?;
            if inner.tasklets.push(Tasklet { id, handler }).is_err() {
                inner.free_push(node, self.heap);
                return Err(EventError::HandlerAllocFail);
            }
            unsafe {
                (*storage_ptr(inner, node)).event = Event {
                    receiver: id,
                    sender: 0,
                    event_type: init_event_type,
                    event_id: 0,
                    event_data: 0,
                    data_ptr: 0,
                    priority: Priority::Low,
                };
            }
            inner.queue_insert(node);
            Ok(id)
        })?;
        self.signal();
        Ok(id)
    }

    /// Copy `event` into fresh storage and queue it.
    pub fn send(&self, event: &Event) -> Result<(), EventError> {
        self.inner.with(|inner| {
            inner.ensure_init();
            if !inner.tasklet_exists(event.receiver) {
                return Err(EventError::NoReceiver);
            }
            let node = inner
                .event_core_get(self.heap)
                .ok_or(EventError::QueueAllocFail)?;
            unsafe {
                (*storage_ptr(inner, node)).event = *event;
            }
            inner.queue_insert(node);
            Ok(())
        })?;
        self.signal();
        Ok(())
    }

    /// Queue caller-owned storage; never allocates and cannot fail.
    /// Delivery is mandatory: the receiver tasklet must exist.
    pub fn send_user_allocated(&self, storage: &'static mut EventStorage) {
        let ptr = NonNull::from(storage);
        self.inner.with(|inner| {
            inner.ensure_init();
            unsafe {
                (*ptr.as_ptr()).provenance = Provenance::User;
                (*ptr.as_ptr()).next = None;
            }
            inner.queue_insert(NodeRef::Raw(ptr));
        });
        self.signal();
    }

    /// Remove a queued event by `(receiver, event_id)` and release its
    /// storage.  Running events are untouched.  Timer-owned storage is
    /// neutralized so a periodic timer will not re-arm.
    pub fn cancel_queued(&self, receiver: TaskletId, event_id: u8) -> bool {
        self.inner.with(|inner| {
            let node = match inner.queue_find(receiver, event_id) {
                Some(node) => node,
                None => return false,
            };
            unsafe {
                match (*storage_ptr(inner, node)).provenance {
                    Provenance::TimerPool(i) => inner.timer_pool[i as usize].period_ticks = 0,
                    Provenance::TimerDyn(entry) => (*entry.as_ptr()).period_ticks = 0,
                    _ => {}
                }
            }
            inner.queue_remove(node);
            inner.free_push(node, self.heap);
            true
        })
    }

    /// Pop and deliver the highest-priority event.  Returns false when the
    /// queue was empty.
    pub fn dispatch_one(&self) -> bool {
        let work = self.inner.with(|inner| {
            inner.ensure_init();
            inner.current_tasklet = 0;
            let node = inner.queue_pop()?;
            let event = unsafe { (*storage_ptr(inner, node)).event };
            let handler = inner
                .tasklets
                .iter()
                .find(|t| t.id == event.receiver)
                .map(|t| t.handler);
            inner.current_tasklet = event.receiver;
            Some((node, event, handler))
        });

        let (node, event, handler) = match work {
            Some(w) => w,
            None => return false,
        };

        match handler {
            Some(handler) => handler(&event),
            // send() checks the receiver, so only a stale user-allocated
            // send can get here.
            None => log::error!("event for unknown tasklet {}", event.receiver),
        }

        self.inner.with(|inner| {
            inner.free_push(node, self.heap);
            inner.current_tasklet = 0;
        });
        true
    }

    /// Drain the queue.
    pub fn run_until_idle(&self) {
        while self.dispatch_one() {}
    }

    /// The scheduler loop: dispatch until empty, then idle via `hooks`.
    pub fn run(&self, hooks: &dyn SchedulerHooks) -> ! {
        hooks.mutex_wait();
        loop {
            if !self.dispatch_one() {
                hooks.idle();
            }
        }
    }

    /// Tasklet whose handler is currently executing; 0 when idle.
    pub fn current_tasklet(&self) -> TaskletId {
        self.inner.with(|inner| inner.current_tasklet)
    }

    /// True when a tasklet with this id exists.
    pub fn tasklet_id_valid(&self, id: TaskletId) -> bool {
        self.inner.with(|inner| inner.tasklet_exists(id))
    }

    /// Queued event count; diagnostics only.
    pub fn queued_events(&self) -> usize {
        self.inner.with(|inner| {
            let mut n = 0;
            let mut cursor = inner.queue_head;
            while let Some(c) = cursor {
                n += 1;
                cursor = unsafe { (*storage_ptr(inner, c)).next };
            }
            n
        })
    }
}

impl EventSystem {
    /// Const-constructed systems need a critical section reference at
    /// build time; expose it for subsystems layered on top.
    pub fn section(&self) -> &'static CriticalSection {
        self.inner.section()
    }

    /// The heap backing dynamic event storage.
    pub fn heap(&self) -> &'static Heap {
        self.heap
    }
}
