#![cfg_attr(not(test), no_std)]

pub mod event;
pub mod eventloop;
pub mod slot_timer;
pub mod system_timer;

pub use event::{Event, EventError, EventState, EventStorage, Priority, TaskletId};
pub use eventloop::{EventSystem, SchedulerHooks, SingleThreadHooks};
pub use slot_timer::{PlatformTimer, SlotTimerClient, SlotTimerCompensation, SlotTimerId, SlotTimers, TimerError};
pub use system_timer::{EVENT_TIMER_HZ, TICK_PERIOD_MS};

#[cfg(test)]
mod eventloop_tests;
#[cfg(test)]
mod slot_timer_tests;
