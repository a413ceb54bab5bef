//! Timer queue backed by a timerfd.
//!
//! Each loop owns one [`TimerQueue`]: an ordered set of timers exposed to
//! the poller as a single readable fd. The queue keeps the timerfd armed
//! for the earliest expiration; when it fires, every expired entry is
//! snapshotted out, run, and repeating entries are re-inserted. Timers are
//! registered once and woken explicitly, never busy-polled.

use crate::channel::Channel;
use crate::event_loop::{LoopInner, LoopShared};
use crate::time::Timestamp;

use log::{error, trace};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Allocates the next timer sequence number. Process-global, strictly
/// increasing, never reused.
pub(crate) fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1
}

/// Identifies a scheduled timer, for cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId {
    sequence: u64,
}

impl TimerId {
    pub(crate) fn new(sequence: u64) -> TimerId {
        TimerId { sequence }
    }

    /// The timer's sequence number; later-created timers compare greater.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

pub(crate) type TimerCallback = Box<dyn FnMut()>;

pub(crate) struct Timer {
    callback: TimerCallback,
    expiration: Timestamp,
    interval_seconds: f64,
    repeat: bool,
    sequence: u64,
}

impl Timer {
    pub(crate) fn new(
        callback: TimerCallback,
        when: Timestamp,
        interval_seconds: f64,
        sequence: u64,
    ) -> Timer {
        Timer {
            callback,
            expiration: when,
            interval_seconds,
            repeat: interval_seconds > 0.0,
            sequence,
        }
    }

    fn run(&mut self) {
        (self.callback)();
    }

    fn restart(&mut self, now: Timestamp) {
        self.expiration = if self.repeat {
            now.add_seconds(self.interval_seconds)
        } else {
            Timestamp::invalid()
        };
    }
}

/// Ordered timer set keyed by `(expiration, sequence)`, so simultaneous
/// expirations stay distinct and fire in creation order.
pub(crate) struct TimerQueue {
    timer_fd: RawFd,
    timer_channel: Rc<RefCell<Channel>>,
    timers: BTreeMap<(Timestamp, u64), Timer>,
    /// sequence -> expiration, for cancellation lookups.
    active: HashMap<u64, Timestamp>,
    calling_expired: bool,
    cancelled_while_firing: HashSet<u64>,
}

impl TimerQueue {
    pub(crate) fn new(owner: Weak<RefCell<LoopInner>>, owner_shared: Arc<LoopShared>) -> TimerQueue {
        let timer_fd = create_timer_fd();
        let timer_channel = Channel::with_owner(owner, owner_shared, timer_fd);
        TimerQueue {
            timer_fd,
            timer_channel,
            timers: BTreeMap::new(),
            active: HashMap::new(),
            calling_expired: false,
            cancelled_while_firing: HashSet::new(),
        }
    }

    pub(crate) fn channel(&self) -> Rc<RefCell<Channel>> {
        self.timer_channel.clone()
    }

    /// Inserts a timer, rearming the timerfd when the earliest expiration
    /// moved. Loop thread only.
    pub(crate) fn add_timer(&mut self, timer: Timer) -> TimerId {
        let id = TimerId::new(timer.sequence);
        let when = timer.expiration;
        if self.insert(timer) {
            reset_timer_fd(self.timer_fd, when);
        }
        id
    }

    /// Drops a pending timer. Cancelling the timer whose callback is
    /// currently running suppresses its re-insertion instead.
    pub(crate) fn cancel(&mut self, timer_id: TimerId) {
        let sequence = timer_id.sequence();
        if let Some(when) = self.active.remove(&sequence) {
            let removed = self.timers.remove(&(when, sequence));
            assert!(removed.is_some());
        } else if self.calling_expired {
            self.cancelled_while_firing.insert(sequence);
        }
    }

    fn insert(&mut self, timer: Timer) -> bool {
        let key = (timer.expiration, timer.sequence);
        let earliest_changed = match self.timers.keys().next() {
            Some(first) => key.0 < first.0,
            None => true,
        };
        self.active.insert(key.1, key.0);
        let previous = self.timers.insert(key, timer);
        assert!(previous.is_none(), "duplicate timer sequence");
        earliest_changed
    }

    fn extract_expired(&mut self, now: Timestamp) -> Vec<((Timestamp, u64), Timer)> {
        let sentinel = (now, u64::MAX);
        let remaining = self.timers.split_off(&sentinel);
        let expired_map = std::mem::replace(&mut self.timers, remaining);
        let expired: Vec<_> = expired_map.into_iter().collect();
        for ((_, sequence), _) in &expired {
            self.active.remove(sequence);
        }
        self.calling_expired = true;
        self.cancelled_while_firing.clear();
        expired
    }

    fn reset_expired(&mut self, expired: Vec<((Timestamp, u64), Timer)>, now: Timestamp) {
        for ((_, sequence), mut timer) in expired {
            if timer.repeat && !self.cancelled_while_firing.contains(&sequence) {
                timer.restart(now);
                self.insert(timer);
            }
        }
        self.calling_expired = false;
        if let Some((first, _)) = self.timers.keys().next() {
            reset_timer_fd(self.timer_fd, *first);
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.timer_fd);
        }
    }
}

/// Read callback of the timerfd channel: drain the fd, snapshot the
/// expired entries, run them with the loop internals unborrowed (so
/// callbacks may add or cancel timers), then re-insert repeats and rearm.
///
/// Re-insertion uses a fresh clock reading taken after the batch ran:
/// an interval shorter than its own callback's runtime produces
/// back-to-back but monotonically advancing firings, not a backlog.
pub(crate) fn handle_expired(owner: &Weak<RefCell<LoopInner>>) {
    let Some(owner) = owner.upgrade() else {
        return;
    };
    let mut expired = {
        let mut inner = owner.borrow_mut();
        let queue = inner.timer_queue_mut();
        let fired = read_timer_fd(queue.timer_fd);
        trace!("timerfd fired, counter {}", fired);
        let now = Timestamp::now();
        queue.extract_expired(now)
    };
    for (_, timer) in expired.iter_mut() {
        timer.run();
    }
    let now = Timestamp::now();
    owner.borrow_mut().timer_queue_mut().reset_expired(expired, now);
}

fn create_timer_fd() -> RawFd {
    let timer_fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    if timer_fd < 0 {
        let err = io::Error::last_os_error();
        error!("timerfd_create failed: {}", err);
        panic!("timerfd_create failed: {}", err);
    }
    timer_fd
}

fn read_timer_fd(timer_fd: RawFd) -> u64 {
    let mut how_many: u64 = 0;
    let n = unsafe {
        libc::read(
            timer_fd,
            &mut how_many as *mut u64 as *mut libc::c_void,
            8,
        )
    };
    if n != 8 {
        error!("timerfd read returned {} bytes instead of 8", n);
    }
    how_many
}

fn reset_timer_fd(timer_fd: RawFd, expiration: Timestamp) {
    let mut micro_seconds = expiration.micros() - Timestamp::now().micros();
    if micro_seconds < 100 {
        micro_seconds = 100;
    }
    let new_value = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: (micro_seconds / Timestamp::MICRO_SECONDS_PER_SECOND) as libc::time_t,
            tv_nsec: ((micro_seconds % Timestamp::MICRO_SECONDS_PER_SECOND) * 1000)
                as libc::c_long,
        },
    };
    let ret = unsafe { libc::timerfd_settime(timer_fd, 0, &new_value, std::ptr::null_mut()) };
    if ret != 0 {
        error!("timerfd_settime failed: {}", io::Error::last_os_error());
    }
}
