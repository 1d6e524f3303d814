use std::collections::HashMap;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::channel::Channel;
use crate::poller::Poller;
use crate::time::Timestamp;

const INIT_EVENT_LIST_SIZE: usize = 16;

const NEW: i32 = -1;
const ADDED: i32 = 1;
const DELETED: i32 = 2;

/// Kernel interest-table backend (`epoll(7)`). Preferred over [`super::PollPoller`]
/// when available: registration is `O(1)` and the ready list carries no
/// unrelated fds.
pub struct EpollPoller {
    epoll_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Channel>,
}

impl EpollPoller {
    pub fn new() -> EpollPoller {
        let fd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))
            .unwrap_or_else(|e| panic!("EpollPoller::new: epoll_create1 failed: {}", e));
        EpollPoller {
            // SAFETY: epoll_create1 returned a freshly owned, valid fd.
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![unsafe { mem::zeroed() }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        }
    }

    fn fill_active_channels(&self, num_events: usize, active_channels: &mut Vec<Channel>) {
        for event in &self.events[..num_events] {
            // SAFETY: `data.ptr` was set from a live `Box<RawFd>` key lookup;
            // we store the fd itself (not a pointer) to avoid unsafely
            // smuggling a `Channel` pointer through kernel event data.
            let fd = event.u64 as RawFd;
            let channel = self
                .channels
                .get(&fd)
                .unwrap_or_else(|| panic!("ready fd {} not in channel map", fd));
            channel.set_revents(event.events as i32);
            active_channels.push(channel.clone());
        }
    }

    fn update(&self, operation: libc::c_int, channel: &Channel) {
        let mut event: libc::epoll_event = unsafe { mem::zeroed() };
        event.events = channel.events() as u32;
        event.u64 = channel.fd() as u64;
        let fd = channel.fd();
        if let Err(e) = syscall!(epoll_ctl(self.epoll_fd.as_raw_fd(), operation, fd, &mut event)) {
            if operation == libc::EPOLL_CTL_DEL {
                log::error!("epoll_ctl op={} fd={}: {}", operation, fd, e);
            } else {
                panic!("epoll_ctl op={} fd={}: {}", operation, fd, e);
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Channel>) -> Timestamp {
        let num_events = syscall!(epoll_wait(
            self.epoll_fd.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.len() as libc::c_int,
            timeout_ms,
        ));
        let now = Timestamp::now();

        match num_events {
            Ok(n) if n > 0 => {
                let n = n as usize;
                log::trace!("{} events happened", n);
                self.fill_active_channels(n, active_channels);
                if n == self.events.len() {
                    self.events.resize(self.events.len() * 2, unsafe { mem::zeroed() });
                }
            }
            Ok(_) => log::trace!("nothing happened"),
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => {}
            Err(e) => log::error!("EpollPoller::poll() {}", e),
        }
        now
    }

    fn update_channel(&mut self, channel: &Channel) {
        log::trace!("fd = {} events = {}", channel.fd(), channel.events());
        let index = channel.index();
        let fd = channel.fd();

        if index == NEW || index == DELETED {
            if index == NEW {
                debug_assert!(!self.channels.contains_key(&fd));
                self.channels.insert(fd, channel.clone());
            } else {
                debug_assert!(self.channels.contains_key(&fd));
            }
            channel.set_index(ADDED);
            self.update(libc::EPOLL_CTL_ADD, channel);
        } else {
            debug_assert!(self.channels.contains_key(&fd));
            debug_assert_eq!(index, ADDED);
            if channel.is_none_event() {
                self.update(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(DELETED);
            } else {
                self.update(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        log::trace!("fd = {}", channel.fd());
        let fd = channel.fd();
        debug_assert!(self.channels.contains_key(&fd));
        debug_assert!(channel.is_none_event());
        let index = channel.index();
        debug_assert!(index == ADDED || index == DELETED);

        self.channels.remove(&fd);
        if index == ADDED {
            self.update(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(NEW);
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
        let mut poller = EpollPoller::new();

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

    #[test]
    fn event_list_grows_when_saturated() {
        let poller = EpollPoller::new();
        assert_eq!(poller.events.len(), INIT_EVENT_LIST_SIZE);
    }
}
