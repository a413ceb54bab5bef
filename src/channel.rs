//! Per-fd event channel: an interest mask plus dispatch callbacks.
//!
//! A [`Channel`] binds one file descriptor to the loop that polls it. It
//! performs no I/O itself; it only remembers which readiness events the
//! owner cares about and which callbacks to run when the poller reports
//! them. The fd is borrowed: sockets, eventfds and timerfds are opened and
//! closed by whoever hands them in.
//!
//! Channels are loop-affine. They are created from the owning loop's
//! thread, every interest mutation must happen there, and the `Rc` handle
//! they live behind keeps them off other threads by construction.

use crate::event_loop::{EventLoop, LoopInner, LoopShared};
use crate::time::Timestamp;

use log::{trace, warn};
use std::any::Any;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Interest/readiness bits use the poll(2) encoding throughout the crate;
/// the epoll backend translates at its edge.
pub(crate) const NONE_EVENT: i32 = 0;
pub(crate) const READ_EVENT: i32 = (libc::POLLIN | libc::POLLPRI) as i32;
pub(crate) const WRITE_EVENT: i32 = libc::POLLOUT as i32;

pub type ReadEventCallback = Box<dyn FnMut(Timestamp)>;
pub type EventCallback = Box<dyn FnMut()>;

/// A selectable I/O channel.
///
/// The fd may be a socket, an eventfd, a timerfd or any other pollable
/// descriptor. The channel does not own it and never closes it.
pub struct Channel {
    owner: Weak<RefCell<LoopInner>>,
    owner_shared: Arc<LoopShared>,
    weak_self: Weak<RefCell<Channel>>,
    fd: RawFd,
    events: i32,
    revents: i32,
    /// Bookkeeping slot owned by the poller backend.
    index: i32,
    log_hup: bool,
    tie: Option<Weak<dyn Any>>,
    event_handling: bool,
    added_to_loop: bool,
    read_callback: Option<ReadEventCallback>,
    write_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
}

impl Channel {
    /// Creates a channel for `fd`, owned by `event_loop` for its whole life.
    pub fn new(event_loop: &EventLoop, fd: RawFd) -> Rc<RefCell<Channel>> {
        Channel::with_owner(
            Rc::downgrade(event_loop.inner()),
            event_loop.shared().clone(),
            fd,
        )
    }

    pub(crate) fn with_owner(
        owner: Weak<RefCell<LoopInner>>,
        owner_shared: Arc<LoopShared>,
        fd: RawFd,
    ) -> Rc<RefCell<Channel>> {
        Rc::new_cyclic(|weak_self| {
            RefCell::new(Channel {
                owner,
                owner_shared,
                weak_self: weak_self.clone(),
                fd,
                events: NONE_EVENT,
                revents: NONE_EVENT,
                index: -1,
                log_hup: true,
                tie: None,
                event_handling: false,
                added_to_loop: false,
                read_callback: None,
                write_callback: None,
                close_callback: None,
                error_callback: None,
            })
        })
    }

    pub fn set_read_callback(&mut self, callback: impl FnMut(Timestamp) + 'static) {
        self.read_callback = Some(Box::new(callback));
    }

    pub fn set_write_callback(&mut self, callback: impl FnMut() + 'static) {
        self.write_callback = Some(Box::new(callback));
    }

    pub fn set_close_callback(&mut self, callback: impl FnMut() + 'static) {
        self.close_callback = Some(Box::new(callback));
    }

    pub fn set_error_callback(&mut self, callback: impl FnMut() + 'static) {
        self.error_callback = Some(Box::new(callback));
    }

    /// Ties callback delivery to `anchor`: once the anchor is dropped, no
    /// further callback fires.
    ///
    /// The usual shape is a connection object that owns this channel and
    /// ties itself, so a connection torn down between poll and dispatch
    /// cannot be called back into.
    pub fn tie<T: 'static>(&mut self, anchor: &Rc<T>) {
        let anchor: Weak<dyn Any> = Rc::downgrade(anchor) as Weak<dyn Any>;
        self.tie = Some(anchor);
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> i32 {
        self.events
    }

    pub fn is_none_event(&self) -> bool {
        self.events == NONE_EVENT
    }

    pub fn is_reading(&self) -> bool {
        self.events & READ_EVENT != 0
    }

    pub fn is_writing(&self) -> bool {
        self.events & WRITE_EVENT != 0
    }

    pub fn enable_reading(&mut self) {
        self.events |= READ_EVENT;
        self.update();
    }

    pub fn disable_reading(&mut self) {
        self.events &= !READ_EVENT;
        self.update();
    }

    pub fn enable_writing(&mut self) {
        self.events |= WRITE_EVENT;
        self.update();
    }

    pub fn disable_writing(&mut self) {
        self.events &= !WRITE_EVENT;
        self.update();
    }

    pub fn disable_all(&mut self) {
        self.events = NONE_EVENT;
        self.update();
    }

    /// Suppresses the warning normally logged when the peer hangs up.
    pub fn dont_log_hup(&mut self) {
        self.log_hup = false;
    }

    /// Deregisters this channel from its loop. Interest must already be
    /// cleared; call [`Channel::disable_all`] first.
    pub fn remove(&mut self) {
        assert!(
            self.is_none_event(),
            "channel fd {} removed while interest is still set",
            self.fd
        );
        self.assert_in_owner_thread();
        self.added_to_loop = false;
        if let Some(owner) = self.owner.upgrade() {
            owner.borrow_mut().remove_channel(self);
        }
    }

    pub fn events_to_string(&self) -> String {
        events_to_string(self.fd, self.events)
    }

    pub fn revents_to_string(&self) -> String {
        events_to_string(self.fd, self.revents)
    }

    pub(crate) fn set_revents(&mut self, revents: i32) {
        self.revents = revents;
    }

    pub(crate) fn index(&self) -> i32 {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: i32) {
        self.index = index;
    }

    pub(crate) fn weak_self(&self) -> Weak<RefCell<Channel>> {
        self.weak_self.clone()
    }

    pub(crate) fn owned_by(&self, shared: &Arc<LoopShared>) -> bool {
        Arc::ptr_eq(&self.owner_shared, shared)
    }

    fn update(&mut self) {
        self.assert_in_owner_thread();
        self.added_to_loop = true;
        if let Some(owner) = self.owner.upgrade() {
            owner.borrow_mut().update_channel(self);
        }
    }

    fn assert_in_owner_thread(&self) {
        assert!(
            self.owner_shared.is_in_loop_thread(),
            "channel fd {} touched off its loop thread",
            self.fd
        );
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        assert!(
            !self.event_handling,
            "channel fd {} dropped while dispatching",
            self.fd
        );
        assert!(
            !self.added_to_loop,
            "channel fd {} dropped while registered with its loop",
            self.fd
        );
    }
}

/// Runs the channel's callbacks for the readiness bits the poller wrote.
///
/// Called only by the owning loop, after the active set for one iteration
/// is collected. When the channel is tied, the anchor is upgraded first
/// and held for the whole dispatch; a dead anchor delivers nothing.
pub(crate) fn handle_event(channel: &Rc<RefCell<Channel>>, receive_time: Timestamp) {
    let guard = {
        let this = channel.borrow();
        match &this.tie {
            Some(tie) => match tie.upgrade() {
                Some(anchor) => Some(anchor),
                // Anchor gone: whoever owned this channel is mid-teardown.
                None => return,
            },
            None => None,
        }
    };
    let _hold = guard;
    handle_event_with_guard(channel, receive_time);
}

fn handle_event_with_guard(channel: &Rc<RefCell<Channel>>, receive_time: Timestamp) {
    let (fd, revents, log_hup) = {
        let mut this = channel.borrow_mut();
        this.event_handling = true;
        (this.fd, this.revents, this.log_hup)
    };
    trace!("channel dispatch {}", events_to_string(fd, revents));

    // A hangup with pending readable data must drain through the read
    // callback first so EOF is observed there; only a bare hangup closes.
    if revents & libc::POLLHUP as i32 != 0 && revents & libc::POLLIN as i32 == 0 {
        if log_hup {
            warn!("fd = {} channel received POLLHUP", fd);
        }
        invoke(channel, Slot::Close);
    }

    if revents & libc::POLLNVAL as i32 != 0 {
        warn!("fd = {} channel received POLLNVAL", fd);
    }

    if revents & (libc::POLLERR | libc::POLLNVAL) as i32 != 0 {
        invoke(channel, Slot::Error);
    }

    if revents & (libc::POLLIN | libc::POLLPRI | libc::POLLRDHUP) as i32 != 0 {
        invoke_read(channel, receive_time);
    }

    if revents & libc::POLLOUT as i32 != 0 {
        invoke(channel, Slot::Write);
    }

    channel.borrow_mut().event_handling = false;
}

#[derive(Clone, Copy)]
enum Slot {
    Write,
    Close,
    Error,
}

// Callbacks are taken out of their slot for the call, so they can reach
// back into the channel (flip interest, re-register) without tripping the
// RefCell. The slot is restored afterwards unless the callback installed
// a replacement.
fn invoke(channel: &Rc<RefCell<Channel>>, slot: Slot) {
    let taken = {
        let mut this = channel.borrow_mut();
        match slot {
            Slot::Write => this.write_callback.take(),
            Slot::Close => this.close_callback.take(),
            Slot::Error => this.error_callback.take(),
        }
    };
    if let Some(mut callback) = taken {
        callback();
        let mut this = channel.borrow_mut();
        let slot = match slot {
            Slot::Write => &mut this.write_callback,
            Slot::Close => &mut this.close_callback,
            Slot::Error => &mut this.error_callback,
        };
        if slot.is_none() {
            *slot = Some(callback);
        }
    }
}

fn invoke_read(channel: &Rc<RefCell<Channel>>, receive_time: Timestamp) {
    let taken = channel.borrow_mut().read_callback.take();
    if let Some(mut callback) = taken {
        callback(receive_time);
        let mut this = channel.borrow_mut();
        if this.read_callback.is_none() {
            this.read_callback = Some(callback);
        }
    }
}

pub(crate) fn events_to_string(fd: RawFd, events: i32) -> String {
    let mut out = format!("{}: ", fd);
    let names: [(libc::c_short, &str); 7] = [
        (libc::POLLIN, "IN"),
        (libc::POLLPRI, "PRI"),
        (libc::POLLOUT, "OUT"),
        (libc::POLLHUP, "HUP"),
        (libc::POLLRDHUP, "RDHUP"),
        (libc::POLLERR, "ERR"),
        (libc::POLLNVAL, "NVAL"),
    ];
    for (bit, name) in names {
        if events & bit as i32 != 0 {
            out.push_str(name);
            out.push(' ');
        }
    }
    out
}
