//! Indirect (pending) data: frames parked for sleepy children until
//! they poll.
//!
//! Parked frames age on a 100 ms housekeeping tick and expire with
//! `TransactionExpired`.  A received Data Request command promotes the
//! oldest matching frame to direct transmission, with the frame-pending
//! bit signalling further queued traffic; a poll that finds nothing is
//! answered with an explicit zero-payload data frame so the child can
//! stop listening immediately.

use meshcore_event::{Event, Priority};
use meshcore_mem::HeapBox;

use crate::buffer::{PreBuiltFrame, PreParsedFrame};
use crate::fcf::ParsedMhr;
use crate::sap::DataConfirm;
use crate::types::{AddrMode, FrameType, MacStatus, MAC_INDIRECT_TICK_MS};
use crate::{MacCore, MacInner, Outcall, Outcalls, EV_INDIRECT_TICK};

impl MacCore {
    /// Park a frame for its destination and make sure the aging tick is
    /// running.
    pub(crate) fn indirect_queue_write(&self, frame: HeapBox<PreBuiltFrame>) {
        let start_tick = self.state.with(|inner| {
            inner.indirect_queue.push(frame);
            if inner.indirect_timer_running {
                false
            } else {
                inner.indirect_timer_running = true;
                true
            }
        });
        if start_tick {
            let tasklet = self.state.with(|inner| inner.tasklet);
            let event = Event {
                receiver: tasklet,
                sender: tasklet,
                event_type: EV_INDIRECT_TICK,
                event_id: EV_INDIRECT_TICK,
                event_data: 0,
                data_ptr: 0,
                priority: Priority::Med,
            };
            let period = (MAC_INDIRECT_TICK_MS / meshcore_event::TICK_PERIOD_MS) as i32;
            if self.events.timer_request_every(&event, period).is_err() {
                log::warn!("indirect aging timer unavailable");
                self.state.with(|inner| inner.indirect_timer_running = false);
            }
        }
    }

    /// 100 ms aging tick: expire overdue entries, stop the tick when the
    /// queue drains.
    pub(crate) fn indirect_tick_event(&self) {
        let mut calls = Outcalls::new();
        let stop_tick = self.state.with(|inner| {
            inner.indirect_queue.for_each_mut(|frame| {
                frame.indirect_ttl_ms = frame.indirect_ttl_ms.saturating_sub(MAC_INDIRECT_TICK_MS);
            });
            while let Some(frame) = inner.indirect_queue.remove_first(|f| f.indirect_ttl_ms == 0) {
                let _ = calls.push(Outcall::DataConfirm {
                    confirm: DataConfirm {
                        msdu_handle: frame.msdu_handle,
                        status: MacStatus::TransactionExpired,
                        cca_retries: 0,
                        tx_retries: 0,
                        timestamp: 0,
                    },
                    ack: None,
                });
                if calls.is_full() {
                    break;
                }
            }
            if inner.indirect_queue.is_empty() && inner.indirect_timer_running {
                inner.indirect_timer_running = false;
                true
            } else {
                false
            }
        });
        if stop_tick {
            let tasklet = self.state.with(|inner| inner.tasklet);
            self.events.timer_cancel(EV_INDIRECT_TICK, tasklet);
        }
        self.dispatch_outcalls(calls);
    }

    /// A child sent a Data Request: promote its oldest parked frame, or
    /// answer "no data" explicitly.
    pub(crate) fn indirect_data_req_handle(&self, inner: &mut MacInner, rx: &PreParsedFrame) {
        let promoted = inner
            .indirect_queue
            .remove_first(|f| frame_matches_requester(f, &rx.mhr));
        match promoted {
            Some(mut frame) => {
                // More parked traffic for this child keeps the pending
                // bit alive on the promoted frame.
                let mut more = false;
                inner.indirect_queue.for_each(|f| {
                    if frame_matches_requester(f, &rx.mhr) {
                        more = true;
                    }
                });
                frame.fcf.frame_pending = more;
                frame.indirect = false;
                inner.tx_queue.push(frame);
            }
            None => {
                if let Some(frame) = build_no_data_frame(self.heap, inner, &rx.mhr) {
                    inner.tx_queue.push(frame);
                }
            }
        }
    }
}

/// Does a parked frame belong to the device that sent `rx`?
pub(crate) fn frame_matches_requester(frame: &PreBuiltFrame, rx: &ParsedMhr) -> bool {
    if frame.fcf.dst_addr_mode != rx.fcf.src_addr_mode {
        return false;
    }
    match rx.fcf.src_addr_mode {
        AddrMode::Short => frame.dst_addr[..2] == rx.src_addr[..2],
        AddrMode::Ext => frame.dst_addr == rx.src_addr,
        AddrMode::None => false,
    }
}

/// Zero-payload data frame telling a polling child nothing is pending.
fn build_no_data_frame(
    heap: &'static meshcore_mem::Heap,
    inner: &MacInner,
    rx: &ParsedMhr,
) -> Option<HeapBox<PreBuiltFrame>> {
    let mut frame = PreBuiltFrame::new();
    frame.fcf.frame_type = FrameType::Data;
    frame.fcf.intra_pan = true;
    frame.fcf.dst_addr_mode = rx.fcf.src_addr_mode;
    frame.dst_addr = rx.src_addr;
    frame.dst_pan = rx.src_pan;
    frame.src_pan = inner.pib.pan_id;
    frame.fcf.src_addr_mode = if inner.pib.short_address_valid() {
        AddrMode::Short
    } else {
        AddrMode::Ext
    };
    match frame.fcf.src_addr_mode {
        AddrMode::Short => {
            frame.src_addr[..2].copy_from_slice(&inner.pib.short_address.to_le_bytes());
        }
        _ => frame.src_addr = inner.pib.mac64,
    }
    HeapBox::new_temporary_in(heap, frame)
}
