//! Readiness demultiplexing backends.

mod epoll;
mod poll;

pub(crate) use epoll::EpollPoller;
pub(crate) use poll::PollPoller;

use crate::channel::Channel;
use crate::time::Timestamp;

use std::cell::RefCell;
use std::rc::Rc;

pub(crate) type ChannelList = Vec<Rc<RefCell<Channel>>>;

/// One demultiplexer per loop. All calls happen on the loop thread.
pub(crate) trait Poller {
    /// Blocks for up to `timeout_ms` (0 polls, negative waits forever),
    /// appends every ready channel to `active_channels` with its readiness
    /// mask written, and returns the clock reading taken right after the
    /// wait returned. An empty active set is an ordinary timeout.
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut ChannelList) -> Timestamp;

    /// Registers a new channel or pushes its current interest mask.
    /// Safe to call repeatedly with unchanged interest.
    fn update_channel(&mut self, channel: &mut Channel);

    /// Unconditionally forgets the channel. Interest must be zero.
    fn remove_channel(&mut self, channel: &mut Channel);

    fn has_channel(&self, channel: &Channel) -> bool;
}

/// Picks the backend for a new loop: epoll, unless `EVLOOP_USE_POLL` is
/// set in the environment.
pub(crate) fn new_default_poller() -> Box<dyn Poller> {
    if std::env::var_os("EVLOOP_USE_POLL").is_some() {
        Box::new(PollPoller::new())
    } else {
        Box::new(EpollPoller::new())
    }
}
