//! Event and tasklet types shared by the loop and the timer plant.

use core::ptr::NonNull;

use crate::system_timer::SysTimerEntry;

/// Tasklet identifier, `0..=127`.  Negative values are error returns.
pub type TaskletId = i8;

/// Event delivery priority.  The active queue is kept sorted so that a
/// smaller discriminant dispatches first; equal priorities stay FIFO.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High = 0,
    Med = 1,
    Low = 2,
    Idle = 3,
}

/// A delivered event.  `data_ptr` is an opaque token for the receiver
/// (zero when unused); the core never dereferences it.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub receiver: TaskletId,
    pub sender: TaskletId,
    pub event_type: u8,
    pub event_id: u8,
    pub event_data: u32,
    pub data_ptr: usize,
    pub priority: Priority,
}

impl Event {
    pub const fn new(receiver: TaskletId, event_type: u8) -> Self {
        Self {
            receiver,
            sender: 0,
            event_type,
            event_id: 0,
            event_data: 0,
            data_ptr: 0,
            priority: Priority::Low,
        }
    }
}

/// Queueing state of one event storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventState {
    Unqueued,
    Queued,
    Running,
}

/// Where an event storage came from; decides how it is returned after
/// delivery or cancellation.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Provenance {
    /// Index into the startup pool inside the event system.
    StartupPool(u8),
    /// Heap node owned by the queue; freed on completion.
    Dynamic,
    /// Embedded in the system-timer startup pool at this index.
    TimerPool(u8),
    /// Embedded in a heap-allocated timer entry; the entry pointer is
    /// recorded so no container arithmetic is needed to get back to it.
    TimerDyn(NonNull<SysTimerEntry>),
    /// Caller-owned storage; forgotten after delivery.
    User,
}

/// Link to a queued storage: pool entries go by index (their addresses
/// live inside the core state), heap and user entries by pointer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeRef {
    Pool(u8),
    TimerPool(u8),
    Raw(NonNull<EventStorage>),
}

/// Backing storage for one queued event.
pub struct EventStorage {
    pub(crate) event: Event,
    pub(crate) state: EventState,
    pub(crate) provenance: Provenance,
    pub(crate) next: Option<NodeRef>,
}

impl EventStorage {
    pub(crate) const fn idle() -> Self {
        Self {
            event: Event::new(0, 0),
            state: EventState::Unqueued,
            provenance: Provenance::User,
            next: None,
        }
    }

    /// Caller-owned storage for allocation-free sends.
    pub const fn new_user(event: Event) -> Self {
        Self {
            event,
            state: EventState::Unqueued,
            provenance: Provenance::User,
            next: None,
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn state(&self) -> EventState {
        self.state
    }
}

/// Event-system errors surfaced to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventError {
    /// A tasklet with this handler function already exists.
    HandlerExists,
    /// Tasklet bookkeeping could not be allocated.
    HandlerAllocFail,
    /// No free storage for the event.
    QueueAllocFail,
    /// The receiver tasklet does not exist.
    NoReceiver,
}
