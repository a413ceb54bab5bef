//! poll(2) backend.

use super::{ChannelList, Poller};
use crate::channel::Channel;
use crate::time::Timestamp;

use log::{error, trace};
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Weak;

pub(crate) struct PollPoller {
    poll_fds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Weak<RefCell<Channel>>>,
}

impl PollPoller {
    pub(crate) fn new() -> PollPoller {
        PollPoller {
            poll_fds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    fn fill_active_channels(&self, ready: usize, active_channels: &mut ChannelList) {
        let mut left = ready;
        for poll_fd in &self.poll_fds {
            if left == 0 {
                break;
            }
            if poll_fd.revents == 0 {
                continue;
            }
            left -= 1;
            let Some(channel) = self.channels.get(&poll_fd.fd).and_then(Weak::upgrade) else {
                continue;
            };
            channel.borrow_mut().set_revents(poll_fd.revents as i32);
            active_channels.push(channel);
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut ChannelList) -> Timestamp {
        let ready = loop {
            let ready = unsafe {
                libc::poll(
                    self.poll_fds.as_mut_ptr(),
                    self.poll_fds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };
            if ready >= 0 {
                break ready;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("poll backend wait failed: {}", err);
            break 0;
        };
        let now = Timestamp::now();
        if ready > 0 {
            trace!("{} events happened", ready);
            self.fill_active_channels(ready as usize, active_channels);
        } else {
            trace!("nothing happened");
        }
        now
    }

    fn update_channel(&mut self, channel: &mut Channel) {
        trace!("poll backend update {}", channel.events_to_string());
        if channel.index() < 0 {
            // brand new channel: append a slot
            assert!(!self.channels.contains_key(&channel.fd()));
            self.poll_fds.push(libc::pollfd {
                fd: channel.fd(),
                events: channel.events() as libc::c_short,
                revents: 0,
            });
            channel.set_index(self.poll_fds.len() as i32 - 1);
            self.channels.insert(channel.fd(), channel.weak_self());
        } else {
            assert!(self.channels.contains_key(&channel.fd()));
            let index = channel.index() as usize;
            assert!(index < self.poll_fds.len());
            let poll_fd = &mut self.poll_fds[index];
            assert!(poll_fd.fd == channel.fd() || poll_fd.fd == -channel.fd() - 1);
            poll_fd.fd = channel.fd();
            poll_fd.events = channel.events() as libc::c_short;
            poll_fd.revents = 0;
            if channel.is_none_event() {
                // park the slot: a negative fd makes the kernel skip it
                poll_fd.fd = -channel.fd() - 1;
            }
        }
    }

    fn remove_channel(&mut self, channel: &mut Channel) {
        trace!("poll backend remove fd {}", channel.fd());
        assert!(self.channels.contains_key(&channel.fd()));
        assert!(channel.is_none_event());
        let index = channel.index() as usize;
        assert!(index < self.poll_fds.len());
        self.channels.remove(&channel.fd());
        self.poll_fds.swap_remove(index);
        if index < self.poll_fds.len() {
            // a slot moved into the hole: keep its channel's index in sync
            let mut moved_fd = self.poll_fds[index].fd;
            if moved_fd < 0 {
                moved_fd = -moved_fd - 1;
            }
            if let Some(moved) = self.channels.get(&moved_fd).and_then(Weak::upgrade) {
                moved.borrow_mut().set_index(index as i32);
            }
        }
        channel.set_index(-1);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        match self.channels.get(&channel.fd()) {
            Some(weak) => weak.ptr_eq(&channel.weak_self()),
            None => false,
        }
    }
}
