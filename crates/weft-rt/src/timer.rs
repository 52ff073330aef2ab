//! Hashed timer wheel.
//!
//! Timeouts hash into one of `S` slots of width `G` milliseconds; an item
//! due more than one wheel revolution away carries a remaining-revolutions
//! counter that is decremented each time its slot comes around. Locating,
//! inserting and expiring are O(1) amortized.
//!
//! [`TimerWheel::advance`] detaches the due items instead of firing them
//! in place, so the caller can run callbacks and resume coroutines without
//! holding any borrow of the wheel; handlers are then free to add timers
//! of their own, which land no earlier than the next tick. Repeating items
//! are handed back through [`TimerWheel::reinsert`].
//!
//! All times are milliseconds on a monotonic clock counted from an
//! arbitrary process epoch; see [`now_ms`].

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Weak;
use std::sync::OnceLock;
use std::time::Instant;

use log::{debug, warn};

use crate::coroutine::{CoState, Coroutine};

/// Milliseconds since an arbitrary, process-wide monotonic epoch.
pub fn now_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Marker for "infinite repetitions" in [`TimerWheel::add`].
pub const REPEAT_FOREVER: i64 = -1;

type TimerCallback = Box<dyn FnMut()>;

// ---------------------------------------------------------------------------
// TimeoutItem
// ---------------------------------------------------------------------------

/// One scheduled timeout.
///
/// Exactly one of the callback and the coroutine reference drives execution
/// when the item fires; the coroutine reference wins if both are present.
pub struct TimeoutItem {
    remaining_revolutions: i64,
    period_ms: u64,
    repeat: i64,
    registered_at: u64,
    callback: Option<TimerCallback>,
    co: Option<Weak<Coroutine>>,
}

impl TimeoutItem {
    /// Fire the item: resume the coroutine if one is attached, otherwise
    /// invoke the callback. Returns `true` if the item should be re-armed.
    ///
    /// A dead or terminated resume target is skipped and the item dropped,
    /// whatever its repeat count. Callback panics are caught and logged.
    pub fn fire(&mut self) -> bool {
        if let Some(weak) = &self.co {
            match weak.upgrade() {
                Some(co) if co.state() == CoState::Ready => co.resume(),
                _ => {
                    debug!("dropping timer whose resume target is gone");
                    return false;
                }
            }
        } else if let Some(callback) = self.callback.as_mut() {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                warn!("timer callback panicked");
            }
        }
        match self.repeat {
            REPEAT_FOREVER => true,
            n => {
                self.repeat = n - 1;
                self.repeat > 0
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TimerWheel
// ---------------------------------------------------------------------------

/// Hashed wheel of timeout items.
pub struct TimerWheel {
    slots: Vec<VecDeque<TimeoutItem>>,
    granularity_ms: u64,
    current_slot: usize,
    last_trigger: u64,
}

impl TimerWheel {
    /// A wheel of `slots` slots, each `granularity_ms` wide.
    pub fn new(slots: usize, granularity_ms: u64) -> TimerWheel {
        assert!(slots > 0 && granularity_ms > 0, "degenerate wheel geometry");
        TimerWheel {
            slots: (0..slots).map(|_| VecDeque::new()).collect(),
            granularity_ms,
            current_slot: 0,
            last_trigger: now_ms(),
        }
    }

    pub fn granularity_ms(&self) -> u64 {
        self.granularity_ms
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(VecDeque::is_empty)
    }

    /// Schedule a timeout `timeout_ms` from now. Sub-granularity delays
    /// round up to the next tick. `repeat` of [`REPEAT_FOREVER`] repeats
    /// forever; 0 is invalid and stores nothing.
    pub fn add(
        &mut self,
        timeout_ms: u64,
        callback: Option<TimerCallback>,
        co: Option<Weak<Coroutine>>,
        repeat: i64,
    ) {
        debug_assert!(
            repeat == REPEAT_FOREVER || repeat > 0,
            "timer repeat count must be -1 or positive"
        );
        if repeat == 0 || repeat < REPEAT_FOREVER {
            return;
        }
        let ticks = timeout_ms / self.granularity_ms;
        let item = TimeoutItem {
            remaining_revolutions: (ticks / self.slots.len() as u64) as i64,
            period_ms: timeout_ms,
            repeat,
            registered_at: now_ms(),
            callback,
            co,
        };
        let slot = (self.current_slot + ticks as usize) % self.slots.len();
        self.slots[slot].push_back(item);
    }

    /// Walk every tick elapsed since the last trigger and detach the items
    /// that came due, preserving insertion order within a tick. The caller
    /// fires them and hands repeating items back via [`reinsert`].
    ///
    /// [`reinsert`]: TimerWheel::reinsert
    pub fn advance(&mut self, now: u64) -> Vec<TimeoutItem> {
        let mut due = Vec::new();
        if now <= self.last_trigger {
            return due;
        }
        let ticks = (now - self.last_trigger) / self.granularity_ms;
        for _ in 0..ticks {
            let slot = self.current_slot;
            self.current_slot = (self.current_slot + 1) % self.slots.len();
            let len = self.slots[slot].len();
            for _ in 0..len {
                let mut item = self.slots[slot].pop_front()
                    .expect("slot length was just measured");
                item.remaining_revolutions -= 1;
                if item.remaining_revolutions < 0 {
                    due.push(item);
                } else {
                    self.slots[slot].push_back(item);
                }
            }
        }
        // keep the sub-tick remainder so repeated short advances do not drift
        self.last_trigger += ticks * self.granularity_ms;
        due
    }

    /// Re-arm a fired repeating item for its next period.
    pub fn reinsert(&mut self, mut item: TimeoutItem) {
        let ticks = item.period_ms / self.granularity_ms;
        item.remaining_revolutions = (ticks / self.slots.len() as u64) as i64;
        item.registered_at = now_ms();
        let slot = (self.current_slot + ticks as usize) % self.slots.len();
        self.slots[slot].push_back(item);
    }

    /// Milliseconds until the earliest stored item is due, floored at 1
    /// for overdue items. 0 means the wheel is empty.
    pub fn next_timeout(&self, now: u64) -> u64 {
        let mut min: Option<u64> = None;
        for slot in &self.slots {
            for item in slot {
                let elapsed = now.saturating_sub(item.registered_at);
                let remain = item.period_ms.saturating_sub(elapsed).max(1);
                min = Some(min.map_or(remain, |m| m.min(remain)));
            }
        }
        min.unwrap_or(0)
    }
}
