//! The event loop: a per-thread reactor.
//!
//! An [`EventLoop`] owns a poller, a timer queue and a wakeup eventfd, and
//! drives them from the one thread that constructed it. Each iteration
//! waits for readiness, dispatches the active channels in poller order,
//! then drains the pending-functor queues. Other threads reach the loop
//! through a [`LoopHandle`], whose tasks are funneled onto the loop thread
//! and woken in via the eventfd.
//!
//! Exactly one loop may exist per thread; construction registers the loop
//! in a thread-local marker and a second construction is fatal. Callbacks
//! run to completion: a long callback stalls its loop, and the cure is
//! more loops, not preemption.

pub mod thread;

use crate::channel::{self, Channel};
use crate::current_thread;
use crate::poller::{self, ChannelList, Poller};
use crate::time::Timestamp;
use crate::timer::{self, Timer, TimerId, TimerQueue};

use log::{error, trace};
use std::cell::RefCell;
use std::fmt;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// How long one poller wait may block while the loop is otherwise idle.
const POLL_TIMEOUT_MS: i32 = 10_000;

thread_local! {
    /// The loop constructed on this thread, if any.
    static CURRENT_LOOP: RefCell<Option<CurrentLoop>> = const { RefCell::new(None) };
}

struct CurrentLoop {
    inner: Rc<RefCell<LoopInner>>,
    shared: Arc<LoopShared>,
}

fn with_current_loop<R>(f: impl FnOnce(&CurrentLoop) -> R) -> Option<R> {
    CURRENT_LOOP.with(|current| current.borrow().as_ref().map(f))
}

/// The cross-thread face of a loop: everything here is safe to touch from
/// any thread.
pub(crate) struct LoopShared {
    tid: libc::pid_t,
    wakeup_fd: RawFd,
    quit: AtomicBool,
    calling_pending_functors: AtomicBool,
    pending_functors: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl LoopShared {
    pub(crate) fn is_in_loop_thread(&self) -> bool {
        current_thread::tid() == self.tid
    }

    fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd,
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!("wakeup write returned {} bytes instead of 8", n);
        }
    }

    fn drain_wakeup(&self) {
        let mut counter: u64 = 0;
        let n = unsafe {
            libc::read(
                self.wakeup_fd,
                &mut counter as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!("wakeup read returned {} bytes instead of 8", n);
        }
    }
}

impl Drop for LoopShared {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakeup_fd);
        }
    }
}

/// Loop state that only the owning thread touches.
pub(crate) struct LoopInner {
    poller: Box<dyn Poller>,
    timer_queue: TimerQueue,
    wakeup_channel: Rc<RefCell<Channel>>,
    active_channels: ChannelList,
    current_active_channel: Option<*const RefCell<Channel>>,
    local_pending_functors: Vec<Box<dyn FnOnce()>>,
    looping: bool,
    event_handling: bool,
    iteration: u64,
    poll_return_time: Timestamp,
}

impl LoopInner {
    pub(crate) fn update_channel(&mut self, channel: &mut Channel) {
        self.poller.update_channel(channel);
    }

    pub(crate) fn remove_channel(&mut self, channel: &mut Channel) {
        if self.event_handling {
            // Mid-dispatch removal is only safe for the channel being
            // dispatched right now; removing a sibling that is still in the
            // active list would dispatch a dangling entry.
            let target = channel.weak_self();
            let is_current = self
                .current_active_channel
                .map_or(false, |current| std::ptr::eq(current, target.as_ptr()));
            let still_queued = self
                .active_channels
                .iter()
                .any(|active| Rc::as_ptr(active) == target.as_ptr());
            assert!(
                is_current || !still_queued,
                "channel fd {} removed while queued for dispatch",
                channel.fd()
            );
        }
        self.poller.remove_channel(channel);
    }

    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.poller.has_channel(channel)
    }

    pub(crate) fn timer_queue_mut(&mut self) -> &mut TimerQueue {
        &mut self.timer_queue
    }
}

/// A single-threaded reactor. See the module docs for the execution model.
pub struct EventLoop {
    inner: Rc<RefCell<LoopInner>>,
    shared: Arc<LoopShared>,
}

impl EventLoop {
    /// Creates the loop for the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if this thread already has a loop, or if the wakeup eventfd
    /// or timerfd cannot be created.
    pub fn new() -> EventLoop {
        CURRENT_LOOP.with(|current| {
            assert!(
                current.borrow().is_none(),
                "another event loop already exists in thread {}",
                current_thread::tid()
            );
        });

        let wakeup_fd = create_event_fd();
        let shared = Arc::new(LoopShared {
            tid: current_thread::tid(),
            wakeup_fd,
            quit: AtomicBool::new(false),
            calling_pending_functors: AtomicBool::new(false),
            pending_functors: Mutex::new(Vec::new()),
        });

        let inner = Rc::new_cyclic(|weak: &Weak<RefCell<LoopInner>>| {
            RefCell::new(LoopInner {
                poller: poller::new_default_poller(),
                timer_queue: TimerQueue::new(weak.clone(), shared.clone()),
                wakeup_channel: Channel::with_owner(weak.clone(), shared.clone(), wakeup_fd),
                active_channels: Vec::new(),
                current_active_channel: None,
                local_pending_functors: Vec::new(),
                looping: false,
                event_handling: false,
                iteration: 0,
                poll_return_time: Timestamp::invalid(),
            })
        });

        CURRENT_LOOP.with(|current| {
            *current.borrow_mut() = Some(CurrentLoop {
                inner: inner.clone(),
                shared: shared.clone(),
            });
        });

        let wakeup_channel = inner.borrow().wakeup_channel.clone();
        {
            let shared = shared.clone();
            wakeup_channel
                .borrow_mut()
                .set_read_callback(move |_receive_time| shared.drain_wakeup());
        }
        wakeup_channel.borrow_mut().enable_reading();

        let timer_channel = inner.borrow().timer_queue.channel();
        {
            let owner = Rc::downgrade(&inner);
            timer_channel
                .borrow_mut()
                .set_read_callback(move |_receive_time| timer::handle_expired(&owner));
        }
        timer_channel.borrow_mut().enable_reading();

        trace!("event loop created in thread {}", shared.tid);
        EventLoop { inner, shared }
    }

    /// Runs the reactor until [`quit`](EventLoop::quit) is requested.
    ///
    /// Each iteration: wait for readiness (at most ten seconds), dispatch
    /// every active channel in poller order with the wait's return time,
    /// then drain the pending functors. Quit takes effect at the next
    /// iteration boundary.
    ///
    /// # Panics
    ///
    /// Panics when called off the owning thread or while already running.
    pub fn run(&mut self) {
        self.assert_in_loop_thread();
        {
            let mut inner = self.inner.borrow_mut();
            assert!(!inner.looping, "event loop already running");
            inner.looping = true;
        }
        trace!("event loop in thread {} starts looping", self.shared.tid);

        while !self.shared.quit.load(Ordering::SeqCst) {
            let (receive_time, active) = {
                let mut guard = self.inner.borrow_mut();
                let inner = &mut *guard;
                inner.active_channels.clear();
                let receive_time = inner
                    .poller
                    .poll(POLL_TIMEOUT_MS, &mut inner.active_channels);
                inner.poll_return_time = receive_time;
                inner.iteration += 1;
                inner.event_handling = true;
                (receive_time, inner.active_channels.clone())
            };

            for active_channel in &active {
                self.inner.borrow_mut().current_active_channel =
                    Some(Rc::as_ptr(active_channel));
                channel::handle_event(active_channel, receive_time);
            }

            {
                let mut inner = self.inner.borrow_mut();
                inner.current_active_channel = None;
                inner.event_handling = false;
            }

            self.do_pending_functors();
        }

        trace!("event loop in thread {} stops looping", self.shared.tid);
        self.inner.borrow_mut().looping = false;
    }

    /// Requests the loop to stop at the next iteration boundary. Sticky:
    /// a quit issued before [`run`](EventLoop::run) makes it return at
    /// once. Never interrupts a callback already running.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
    }

    /// Runs `task` immediately: the loop and its caller share a thread by
    /// construction. Cross-thread submission goes through [`LoopHandle`].
    pub fn run_in_loop(&self, task: impl FnOnce()) {
        self.assert_in_loop_thread();
        task();
    }

    /// Defers `task` to the drain step of the current (or next) iteration.
    /// Unlike the handle-side twin this accepts loop-local state captured
    /// in non-`Send` closures.
    pub fn queue_in_loop(&self, task: impl FnOnce() + 'static) {
        self.inner
            .borrow_mut()
            .local_pending_functors
            .push(Box::new(task));
        if self.shared.calling_pending_functors.load(Ordering::SeqCst) {
            // queued from inside the drain: force a fresh iteration so the
            // task cannot starve behind the poller wait
            self.shared.wakeup();
        }
    }

    /// Schedules `callback` at the absolute time `when`.
    pub fn run_at(&self, when: Timestamp, callback: impl FnMut() + 'static) -> TimerId {
        self.assert_in_loop_thread();
        self.inner
            .borrow_mut()
            .timer_queue_mut()
            .add_timer(Timer::new(Box::new(callback), when, 0.0, timer::next_sequence()))
    }

    /// Schedules `callback` once, `delay_seconds` from now.
    pub fn run_after(&self, delay_seconds: f64, callback: impl FnMut() + 'static) -> TimerId {
        self.run_at(Timestamp::now().add_seconds(delay_seconds), callback)
    }

    /// Schedules `callback` every `interval_seconds`, starting one
    /// interval from now.
    pub fn run_every(&self, interval_seconds: f64, callback: impl FnMut() + 'static) -> TimerId {
        self.assert_in_loop_thread();
        let when = Timestamp::now().add_seconds(interval_seconds);
        self.inner.borrow_mut().timer_queue_mut().add_timer(Timer::new(
            Box::new(callback),
            when,
            interval_seconds,
            timer::next_sequence(),
        ))
    }

    /// Cancels a timer. A repeating timer cancelled from its own callback
    /// fires no further.
    pub fn cancel(&self, timer_id: TimerId) {
        self.assert_in_loop_thread();
        self.inner.borrow_mut().timer_queue_mut().cancel(timer_id);
    }

    /// Pushes `channel`'s interest to the poller. The channel must belong
    /// to this loop.
    pub fn update_channel(&self, channel: &mut Channel) {
        assert!(
            channel.owned_by(&self.shared),
            "channel fd {} belongs to a different loop",
            channel.fd()
        );
        self.assert_in_loop_thread();
        self.inner.borrow_mut().update_channel(channel);
    }

    /// Deregisters `channel` from the poller. The channel must belong to
    /// this loop and carry no interest.
    pub fn remove_channel(&self, channel: &mut Channel) {
        assert!(
            channel.owned_by(&self.shared),
            "channel fd {} belongs to a different loop",
            channel.fd()
        );
        self.assert_in_loop_thread();
        self.inner.borrow_mut().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        assert!(
            channel.owned_by(&self.shared),
            "channel fd {} belongs to a different loop",
            channel.fd()
        );
        self.assert_in_loop_thread();
        self.inner.borrow().has_channel(channel)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// Fatal when the caller is not the owning thread: cross-thread misuse
    /// is the principal source of reactor corruption.
    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "event loop owned by thread {} used from thread {}",
            self.shared.tid,
            current_thread::tid()
        );
    }

    /// The clock reading taken when the poller last returned.
    pub fn poll_return_time(&self) -> Timestamp {
        self.inner.borrow().poll_return_time
    }

    /// Completed poller waits since the loop was created.
    pub fn iteration(&self) -> u64 {
        self.inner.borrow().iteration
    }

    /// Forces the poller to return promptly by writing the wakeup eventfd.
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    /// A cloneable, thread-safe handle onto this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    pub(crate) fn inner(&self) -> &Rc<RefCell<LoopInner>> {
        &self.inner
    }

    pub(crate) fn shared(&self) -> &Arc<LoopShared> {
        &self.shared
    }

    fn do_pending_functors(&mut self) {
        self.shared
            .calling_pending_functors
            .store(true, Ordering::SeqCst);
        // Swap both queues out before running anything: the lock is never
        // held across a task, and tasks may queue more tasks.
        let shared_batch: Vec<Box<dyn FnOnce() + Send>> = {
            let mut pending = self.shared.pending_functors.lock().unwrap();
            mem::take(&mut *pending)
        };
        let local_batch: Vec<Box<dyn FnOnce()>> =
            mem::take(&mut self.inner.borrow_mut().local_pending_functors);
        for functor in shared_batch {
            functor();
        }
        for functor in local_batch {
            functor();
        }
        self.shared
            .calling_pending_functors
            .store(false, Ordering::SeqCst);
    }
}

impl Default for EventLoop {
    fn default() -> EventLoop {
        EventLoop::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        assert!(
            !self.inner.borrow().looping,
            "event loop dropped while running"
        );
        let wakeup_channel = self.inner.borrow().wakeup_channel.clone();
        wakeup_channel.borrow_mut().disable_all();
        wakeup_channel.borrow_mut().remove();
        let timer_channel = self.inner.borrow().timer_queue.channel();
        timer_channel.borrow_mut().disable_all();
        timer_channel.borrow_mut().remove();
        CURRENT_LOOP.with(|current| {
            *current.borrow_mut() = None;
        });
        trace!("event loop in thread {} destroyed", self.shared.tid);
    }
}

/// Cloneable, thread-safe handle to an [`EventLoop`].
///
/// Two handles compare equal exactly when they refer to the same loop.
/// Tasks and timer callbacks submitted through a handle must be `Send`;
/// they run on the loop thread, immediately when the caller already is
/// that thread.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl PartialEq for LoopHandle {
    fn eq(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for LoopHandle {}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("LoopHandle")
            .field("loop", &Arc::as_ptr(&self.shared))
            .field("tid", &self.shared.tid)
            .finish()
    }
}

impl LoopHandle {
    /// The handle of the loop registered on the calling thread, if any.
    pub fn current() -> Option<LoopHandle> {
        CURRENT_LOOP.with(|current| {
            current.borrow().as_ref().map(|current| LoopHandle {
                shared: current.shared.clone(),
            })
        })
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.shared.is_in_loop_thread()
    }

    /// Runs `task` on the loop thread: immediately when called from it,
    /// otherwise queued plus wakeup. Submissions from one thread keep
    /// their order.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Always queues `task` for the loop's drain step, waking the loop
    /// when the caller is off-thread or the drain is already running.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.shared.pending_functors.lock().unwrap();
            pending.push(Box::new(task));
        }
        if !self.is_in_loop_thread()
            || self.shared.calling_pending_functors.load(Ordering::SeqCst)
        {
            self.shared.wakeup();
        }
    }

    /// Requests the loop to stop, waking it when called off-thread so the
    /// poller wait returns promptly.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.shared.wakeup();
        }
    }

    /// Schedules `callback` at the absolute time `when`.
    pub fn run_at(&self, when: Timestamp, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(when, 0.0, Box::new(callback))
    }

    /// Schedules `callback` once, `delay_seconds` from now.
    pub fn run_after(
        &self,
        delay_seconds: f64,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        self.schedule(Timestamp::now().add_seconds(delay_seconds), 0.0, Box::new(callback))
    }

    /// Schedules `callback` every `interval_seconds`.
    pub fn run_every(
        &self,
        interval_seconds: f64,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        self.schedule(
            Timestamp::now().add_seconds(interval_seconds),
            interval_seconds,
            Box::new(callback),
        )
    }

    /// Cancels a timer scheduled on this loop. Effective by the start of
    /// the next iteration; from the timer's own callback it suppresses
    /// the re-insertion of a repeat.
    pub fn cancel(&self, timer_id: TimerId) {
        self.run_in_loop(move || {
            let cancelled = with_current_loop(|current| {
                current.inner.borrow_mut().timer_queue_mut().cancel(timer_id);
            });
            if cancelled.is_none() {
                error!("timer cancel ran on a thread without a loop");
            }
        });
    }

    /// Forces the poller to return promptly.
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    // The TimerId is allocated here so the caller gets it synchronously;
    // the timer itself materializes on the loop thread, where the queue
    // lives.
    fn schedule(
        &self,
        when: Timestamp,
        interval_seconds: f64,
        callback: Box<dyn FnMut() + Send>,
    ) -> TimerId {
        let sequence = timer::next_sequence();
        self.run_in_loop(move || {
            let callback: Box<dyn FnMut()> = callback;
            let added = with_current_loop(|current| {
                current
                    .inner
                    .borrow_mut()
                    .timer_queue_mut()
                    .add_timer(Timer::new(callback, when, interval_seconds, sequence));
            });
            if added.is_none() {
                error!("timer {} scheduled on a thread without a loop", sequence);
            }
        });
        TimerId::new(sequence)
    }
}

fn create_event_fd() -> RawFd {
    let event_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if event_fd < 0 {
        let err = io::Error::last_os_error();
        error!("eventfd failed: {}", err);
        panic!("eventfd failed: {}", err);
    }
    event_fd
}
