//! epoll backend.

use super::{ChannelList, Poller};
use crate::channel::Channel;
use crate::time::Timestamp;

use log::{error, trace};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Weak;

// Channel index values: this backend's registration state for a channel.
// A channel that drops to zero interest is detached from the epoll set but
// keeps its map entry, so re-enabling it is an ADD instead of a fresh
// registration.
const INDEX_NEW: i32 = -1;
const INDEX_ADDED: i32 = 1;
const INDEX_DETACHED: i32 = 2;

const INITIAL_EVENT_CAPACITY: usize = 16;

pub(crate) struct EpollPoller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Weak<RefCell<Channel>>>,
}

impl EpollPoller {
    pub(crate) fn new() -> EpollPoller {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            let err = io::Error::last_os_error();
            error!("epoll_create1 failed: {}", err);
            panic!("epoll_create1 failed: {}", err);
        }
        EpollPoller {
            epoll_fd,
            events: Vec::with_capacity(INITIAL_EVENT_CAPACITY),
            channels: HashMap::new(),
        }
    }

    fn control(&self, operation: libc::c_int, channel: &Channel) {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(channel.events()),
            u64: channel.fd() as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, operation, channel.fd(), &mut event) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if operation == libc::EPOLL_CTL_DEL {
                error!("epoll_ctl del fd {} failed: {}", channel.fd(), err);
            } else {
                error!("epoll_ctl op {} fd {} failed: {}", operation, channel.fd(), err);
                panic!("epoll_ctl failed on fd {}: {}", channel.fd(), err);
            }
        }
    }

    fn fill_active_channels(&self, ready: usize, active_channels: &mut ChannelList) {
        for event in self.events.iter().take(ready) {
            let fd = event.u64 as RawFd;
            let Some(channel) = self.channels.get(&fd).and_then(Weak::upgrade) else {
                continue;
            };
            channel.borrow_mut().set_revents(epoll_to_interest(event.events));
            active_channels.push(channel);
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut ChannelList) -> Timestamp {
        let capacity = self.events.capacity();
        self.events.resize(capacity, libc::epoll_event { events: 0, u64: 0 });
        let ready = loop {
            let ready = unsafe {
                libc::epoll_wait(
                    self.epoll_fd,
                    self.events.as_mut_ptr(),
                    self.events.len() as libc::c_int,
                    timeout_ms,
                )
            };
            if ready >= 0 {
                break ready as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("epoll backend wait failed: {}", err);
            break 0;
        };
        let now = Timestamp::now();
        if ready > 0 {
            trace!("{} events happened", ready);
            self.fill_active_channels(ready, active_channels);
            if ready == self.events.len() {
                // a full buffer means more may be pending: widen the next wait
                self.events.reserve(self.events.len());
            }
        } else {
            trace!("nothing happened");
        }
        now
    }

    fn update_channel(&mut self, channel: &mut Channel) {
        let index = channel.index();
        trace!("epoll backend update {} (state {})", channel.events_to_string(), index);
        if index == INDEX_NEW || index == INDEX_DETACHED {
            if index == INDEX_NEW {
                assert!(!self.channels.contains_key(&channel.fd()));
                self.channels.insert(channel.fd(), channel.weak_self());
            } else {
                assert!(self.channels.contains_key(&channel.fd()));
            }
            channel.set_index(INDEX_ADDED);
            self.control(libc::EPOLL_CTL_ADD, channel);
        } else {
            assert!(self.channels.contains_key(&channel.fd()));
            assert_eq!(index, INDEX_ADDED);
            if channel.is_none_event() {
                self.control(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(INDEX_DETACHED);
            } else {
                self.control(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    fn remove_channel(&mut self, channel: &mut Channel) {
        trace!("epoll backend remove fd {}", channel.fd());
        assert!(self.channels.contains_key(&channel.fd()));
        assert!(channel.is_none_event());
        let index = channel.index();
        assert!(index == INDEX_ADDED || index == INDEX_DETACHED);
        self.channels.remove(&channel.fd());
        if index == INDEX_ADDED {
            self.control(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(INDEX_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        match self.channels.get(&channel.fd()) {
            Some(weak) => weak.ptr_eq(&channel.weak_self()),
            None => false,
        }
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

fn interest_to_epoll(events: i32) -> u32 {
    let mut epoll_events = 0u32;
    if events & (libc::POLLIN | libc::POLLPRI) as i32 != 0 {
        epoll_events |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
    }
    if events & libc::POLLOUT as i32 != 0 {
        epoll_events |= libc::EPOLLOUT as u32;
    }
    epoll_events
}

fn epoll_to_interest(epoll_events: u32) -> i32 {
    let mut events = 0i32;
    if epoll_events & libc::EPOLLIN as u32 != 0 {
        events |= libc::POLLIN as i32;
    }
    if epoll_events & libc::EPOLLPRI as u32 != 0 {
        events |= libc::POLLPRI as i32;
    }
    if epoll_events & libc::EPOLLOUT as u32 != 0 {
        events |= libc::POLLOUT as i32;
    }
    if epoll_events & libc::EPOLLHUP as u32 != 0 {
        events |= libc::POLLHUP as i32;
    }
    if epoll_events & libc::EPOLLRDHUP as u32 != 0 {
        events |= libc::POLLRDHUP as i32;
    }
    if epoll_events & libc::EPOLLERR as u32 != 0 {
        events |= libc::POLLERR as i32;
    }
    events
}
