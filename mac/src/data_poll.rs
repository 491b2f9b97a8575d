//! Data-poll state machine for sleepy end devices.
//!
//! With `macRxOnWhenIdle` off, the device keeps its receiver down and
//! polls its parent for pending traffic:
//!
//! - `FastPoll`: 300 ms cadence, used during attach and on explicit
//!   application request.
//! - `SlowPoll`: application-configured period (1 s to 864 001 s) with
//!   `timeout = max(32, 4 * period)` seconds; a nonzero protocol-poll
//!   counter temporarily forces the 300 ms cadence.
//! - `RxOnIdle`: polling disabled, receiver always on.
//!
//! A successful poll re-polls immediately (the parent signalled more
//! data); "no data" schedules the next cadence point; four consecutive
//! failures raise the poll-fail callback (typically a parent reattach)
//! after a 2 s retry spacing.

use meshcore_event::{Event, EventSystem, Priority, TaskletId};
use meshcore_lib::{CriticalCell, CriticalSection};

use crate::sap::PollRequest;
use crate::types::{AddrMode, MacStatus};

/// Event type the manager's tasklet receives for "poll now".
pub const POLL_EVENT: u8 = 1;

/// Fast-poll cadence, milliseconds.
pub const FAST_POLL_MS: u32 = 300;

/// Retry spacing after a failed poll, milliseconds.
const POLL_RETRY_MS: u32 = 2000;

/// Consecutive failures before the fail callback fires.
const POLL_FAIL_LIMIT: u8 = 4;

/// Longest permitted slow-poll period, seconds.
const SLOW_POLL_MAX_S: u32 = 864_001;

/// Host operating mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostMode {
    RxOnIdle,
    FastPoll,
    SlowPoll,
}

/// The MAC surface the poll machine drives.
pub trait PollPort: Sync {
    fn poll(&self, req: &PollRequest) -> MacStatus;
    fn set_rx_on_idle(&self, on: bool);
}

impl PollPort for crate::MacCore {
    fn poll(&self, req: &PollRequest) -> MacStatus {
        self.mlme_poll(req)
    }

    fn set_rx_on_idle(&self, on: bool) {
        self.mlme_set(
            crate::pib::PibAttribute::RxOnWhenIdle,
            0,
            &crate::pib::PibValue::Bool(on),
        );
    }
}

struct PollInner {
    tasklet: TaskletId,
    port: Option<&'static dyn PollPort>,
    fail_cb: Option<fn()>,
    host_mode: HostMode,
    slow_poll_rate_s: u32,
    timeout_s: u32,
    app_poll_ms: u32,
    protocol_poll: u8,
    poll_active: bool,
    poll_fail: u8,
    parent: PollRequest,
}

/// The sleepy-device poll scheduler.
pub struct DataPollManager {
    events: &'static EventSystem,
    inner: CriticalCell<PollInner>,
}

impl DataPollManager {
    pub const fn new(cs: &'static CriticalSection, events: &'static EventSystem) -> Self {
        Self {
            events,
            inner: CriticalCell::new(
                cs,
                PollInner {
                    tasklet: -1,
                    port: None,
                    fail_cb: None,
                    host_mode: HostMode::RxOnIdle,
                    slow_poll_rate_s: 0,
                    timeout_s: 0,
                    app_poll_ms: 0,
                    protocol_poll: 0,
                    poll_active: false,
                    poll_fail: 0,
                    parent: PollRequest {
                        coord_addr_mode: AddrMode::None,
                        coord_pan_id: 0xFFFF,
                        coord_address: [0; 8],
                        key: crate::sap::SecuritySelection {
                            level: 0,
                            key_id_mode: 0,
                            key_index: 0,
                            key_source: [0; 8],
                        },
                    },
                },
            ),
        }
    }

    /// Wire the manager: its tasklet, the MAC port, the parent address
    /// and the starting link mode.  Sleepy starts come up in fast-poll
    /// with a protocol poll outstanding.
    pub fn init(
        &self,
        tasklet: TaskletId,
        port: &'static dyn PollPort,
        fail_cb: Option<fn()>,
        parent: PollRequest,
        rx_on_idle: bool,
    ) {
        self.inner.with(|inner| {
            inner.tasklet = tasklet;
            inner.port = Some(port);
            inner.fail_cb = fail_cb;
            inner.parent = parent;
            inner.poll_active = false;
            inner.poll_fail = 0;
            if rx_on_idle {
                inner.host_mode = HostMode::RxOnIdle;
                inner.app_poll_ms = 0;
            } else {
                inner.host_mode = HostMode::FastPoll;
                inner.protocol_poll = 1;
                inner.slow_poll_rate_s = 3;
                inner.timeout_s = 32;
                inner.app_poll_ms = FAST_POLL_MS;
            }
        });
        if !rx_on_idle {
            self.poll_timer_trig(200);
        }
    }

    /// Update the parent used for subsequent polls.
    pub fn set_parent(&self, parent: PollRequest) {
        self.inner.with(|inner| inner.parent = parent);
    }

    /// Tasklet entry point; the host handler forwards poll events here.
    pub fn on_event(&self, event: &Event) {
        if event.event_type != POLL_EVENT {
            return;
        }
        let work = self.inner.with(|inner| {
            if inner.host_mode == HostMode::RxOnIdle {
                return None;
            }
            if inner.parent.coord_addr_mode == AddrMode::None {
                return None;
            }
            inner.poll_active = true;
            inner.port.map(|port| (port, inner.parent))
        });
        if let Some((port, parent)) = work {
            if port.poll(&parent) != MacStatus::Success {
                // Could not even queue the poll; treat as a failure.
                self.poll_confirm(MacStatus::TransactionOverflow);
            }
        }
    }

    /// MLME-POLL.confirm handler: schedule the next poll per status.
    pub fn poll_confirm(&self, status: MacStatus) {
        let (next_ms, fail_cb) = self.inner.with(|inner| {
            inner.poll_active = false;
            match status {
                MacStatus::Success => {
                    // Parent has more queued data; fetch it now.
                    inner.poll_fail = 0;
                    (1, None)
                }
                MacStatus::NoData => {
                    inner.poll_fail = 0;
                    let ms = if inner.protocol_poll == 0 {
                        inner.app_poll_ms
                    } else {
                        FAST_POLL_MS
                    };
                    (ms, None)
                }
                _ => {
                    inner.poll_fail += 1;
                    if inner.poll_fail >= POLL_FAIL_LIMIT {
                        inner.poll_fail = 0;
                        (0, inner.fail_cb)
                    } else {
                        (POLL_RETRY_MS, None)
                    }
                }
            }
        });
        if let Some(cb) = fail_cb {
            cb();
        }
        self.poll_timer_trig(next_ms);
    }

    /// Schedule the next poll in `ms` milliseconds; zero cancels.
    /// Sub-tick requests are dispatched as immediate events.
    pub fn poll_timer_trig(&self, ms: u32) {
        let (tasklet, polling) = self.inner.with(|inner| {
            (
                inner.tasklet,
                inner.host_mode != HostMode::RxOnIdle && inner.tasklet >= 0,
            )
        });
        if tasklet >= 0 {
            self.events.timer_cancel(POLL_EVENT, tasklet);
        }
        if ms == 0 || !polling {
            return;
        }
        if ms < 20 {
            let event = Event {
                receiver: tasklet,
                sender: tasklet,
                event_type: POLL_EVENT,
                event_id: POLL_EVENT,
                event_data: 0,
                data_ptr: 0,
                priority: Priority::Med,
            };
            if self.events.send(&event).is_err() {
                log::error!("poll event send failed");
            }
        } else if self
            .events
            .timer_request_legacy_ms(POLL_EVENT, POLL_EVENT, tasklet, ms)
            .is_err()
        {
            log::error!("poll timer start failed");
        }
    }

    /// Switch host mode.  Slow-poll carries the period in seconds.
    pub fn host_mode_set(&self, mode: HostMode, poll_time_s: u32) -> Result<(), MacStatus> {
        enum Link {
            None,
            Sleepy,
            Awake,
        }
        let (result, link, trig) = self.inner.with(|inner| match mode {
            HostMode::SlowPoll => {
                if poll_time_s == 0 || poll_time_s > SLOW_POLL_MAX_S {
                    return (Err(MacStatus::InvalidParameter), Link::None, false);
                }
                inner.timeout_s = (poll_time_s * 4).max(32);
                inner.slow_poll_rate_s = poll_time_s;
                inner.app_poll_ms = poll_time_s * 1000;
                let was_idle = inner.host_mode == HostMode::RxOnIdle;
                inner.host_mode = HostMode::SlowPoll;
                (Ok(()), if was_idle { Link::Sleepy } else { Link::None }, true)
            }
            HostMode::FastPoll => {
                inner.app_poll_ms = FAST_POLL_MS;
                inner.host_mode = HostMode::FastPoll;
                (Ok(()), Link::Sleepy, true)
            }
            HostMode::RxOnIdle => {
                if inner.host_mode == HostMode::RxOnIdle {
                    return (Ok(()), Link::None, false);
                }
                inner.host_mode = HostMode::RxOnIdle;
                inner.app_poll_ms = 0;
                (Ok(()), Link::Awake, false)
            }
        });
        let port = self.inner.with(|inner| inner.port);
        if let Some(port) = port {
            match link {
                Link::Sleepy => port.set_rx_on_idle(false),
                Link::Awake => port.set_rx_on_idle(true),
                Link::None => {}
            }
        }
        if trig && result.is_ok() {
            self.poll_timer_trig(1);
        }
        result
    }

    /// A protocol layer wants responsive polling for a while.
    pub fn protocol_poll_inc(&self) {
        let trig = self.inner.with(|inner| {
            let first = inner.protocol_poll == 0;
            inner.protocol_poll = inner.protocol_poll.saturating_add(1);
            first && inner.host_mode == HostMode::SlowPoll && !inner.poll_active
        });
        if trig {
            self.poll_timer_trig(1);
        }
    }

    /// Protocol-poll release; the last release re-arms the slow cadence.
    pub fn protocol_poll_dec(&self) {
        enum Then {
            None,
            Trig,
            Cancel,
        }
        let then = self.inner.with(|inner| {
            if inner.protocol_poll == 0 {
                return Then::None;
            }
            inner.protocol_poll -= 1;
            if inner.protocol_poll != 0 || inner.poll_active {
                return Then::None;
            }
            if inner.app_poll_ms != 0 {
                Then::Trig
            } else {
                Then::Cancel
            }
        });
        match then {
            Then::None => {}
            Then::Trig => self.poll_timer_trig(1),
            Then::Cancel => self.poll_timer_trig(0),
        }
    }

    /// Longest sleep the host may take right now, milliseconds; zero
    /// while a poll is in flight.
    pub fn max_sleep_period(&self) -> u32 {
        self.inner.with(|inner| {
            if inner.poll_active {
                0
            } else if inner.protocol_poll != 0 {
                FAST_POLL_MS
            } else {
                inner.app_poll_ms
            }
        })
    }

    pub fn host_mode(&self) -> HostMode {
        self.inner.with(|inner| inner.host_mode)
    }

    /// Configured slow-poll period, seconds.
    pub fn host_poll_time_max(&self) -> u32 {
        self.inner.with(|inner| inner.slow_poll_rate_s)
    }

    /// Link supervision timeout derived from the poll period, seconds.
    pub fn host_timeout(&self) -> u32 {
        self.inner.with(|inner| inner.timeout_s)
    }

    /// Stop all polling (interface going down).
    pub fn disable(&self) {
        self.inner.with(|inner| {
            inner.protocol_poll = 0;
            inner.poll_active = false;
        });
        self.poll_timer_trig(0);
    }
}
