use std::collections::HashMap;
use std::os::unix::io::RawFd;

use crate::channel::Channel;
use crate::poller::Poller;
use crate::time::Timestamp;

/// Portable `poll(2)`-based backend. Available on every UNIX-like target;
/// used when the kernel interest-table backend is unavailable or forced
/// off via [`crate::poller::BACKEND_ENV_VAR`].
pub struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Channel>,
}

impl PollPoller {
    pub fn new() -> PollPoller {
        PollPoller {
            pollfds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    fn fill_active_channels(&self, mut num_events: i32, active_channels: &mut Vec<Channel>) {
        for pfd in &self.pollfds {
            if num_events <= 0 {
                break;
            }
            if pfd.revents > 0 {
                num_events -= 1;
                let channel = self
                    .channels
                    .get(&pfd.fd)
                    .expect("ready fd not in channel map");
                channel.set_revents(pfd.revents as i32);
                active_channels.push(channel.clone());
            }
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Channel>) -> Timestamp {
        let num_events = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let saved_errno = std::io::Error::last_os_error();
        let now = Timestamp::now();

        if num_events > 0 {
            log::trace!("{} events happened", num_events);
            self.fill_active_channels(num_events, active_channels);
        } else if num_events == 0 {
            log::trace!("nothing happened");
        } else if saved_errno.raw_os_error() != Some(libc::EINTR) {
            log::error!("PollPoller::poll() {}", saved_errno);
        }
        now
    }

    fn update_channel(&mut self, channel: &Channel) {
        log::trace!("fd = {} events = {}", channel.fd(), channel.events());

        if channel.index() < 0 {
            debug_assert!(!self.channels.contains_key(&channel.fd()));
            let pfd = libc::pollfd {
                fd: channel.fd(),
                events: channel.events() as i16,
                revents: 0,
            };
            self.pollfds.push(pfd);
            let idx = (self.pollfds.len() - 1) as i32;
            channel.set_index(idx);
            self.channels.insert(channel.fd(), channel.clone());
        } else {
            debug_assert!(self.channels.contains_key(&channel.fd()));
            let idx = channel.index() as usize;
            debug_assert!(idx < self.pollfds.len());
            let pfd = &mut self.pollfds[idx];
            debug_assert!(pfd.fd == channel.fd() || pfd.fd == -channel.fd() - 1);
            pfd.events = channel.events() as i16;
            pfd.revents = 0;
            if channel.is_none_event() {
                // keep the slot but make poll(2) ignore it
                pfd.fd = -channel.fd() - 1;
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        log::trace!("fd = {}", channel.fd());
        debug_assert!(self.channels.contains_key(&channel.fd()));
        debug_assert!(channel.is_none_event());

        let idx = channel.index() as usize;
        debug_assert!(idx < self.pollfds.len());
        self.channels.remove(&channel.fd());

        if idx == self.pollfds.len() - 1 {
            self.pollfds.pop();
        } else {
            let last = self.pollfds.len() - 1;
            self.pollfds.swap(idx, last);
            let moved_fd = self.pollfds[idx].fd;
            let moved_fd = if moved_fd < 0 { -moved_fd - 1 } else { moved_fd };
            if let Some(moved) = self.channels.get(&moved_fd) {
                moved.set_index(idx as i32);
            }
            self.pollfds.pop();
        }
        channel.set_index(-1);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .map(|c| c.ptr_eq(channel))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel as ChannelType, READ_EVENT};

    fn make_pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn register_then_poll_sees_readable_pipe() {
        let (read_fd, write_fd) = make_pipe();
        let l = crate::event_loop::EventLoop::new_for_test();
        let channel = ChannelType::new(&l, read_fd);
        let mut poller = PollPoller::new();

        channel.set_events_for_test(READ_EVENT);
        poller.update_channel(&channel);
        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }

        let mut active = Vec::new();
        poller.poll(1000, &mut active);
        assert_eq!(active.len(), 1);
        assert!(active[0].ptr_eq(&channel));

        channel.set_events_for_test(0);
        poller.update_channel(&channel);
        poller.remove_channel(&channel);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
