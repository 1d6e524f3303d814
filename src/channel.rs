use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::event_loop::EventLoop;
use crate::time::Timestamp;

/// No interest at all.
pub const NONE_EVENT: i32 = 0;
/// Readable, or urgent out-of-band data.
pub const READ_EVENT: i32 = libc::POLLIN | libc::POLLPRI;
/// Writable.
pub const WRITE_EVENT: i32 = libc::POLLOUT;

pub type ReadEventCallback = Box<dyn FnMut(Timestamp)>;
pub type EventCallback = Box<dyn FnMut()>;

struct Inner {
    loop_: Weak<RefCell<EventLoop>>,
    fd: RawFd,

    events: i32,
    revents: i32,
    index: i32,
    log_hup: bool,

    tie: Option<Weak<dyn Any>>,
    tied: bool,
    event_handling: bool,
    added_to_loop: bool,

    read_callback: Option<ReadEventCallback>,
    write_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug_assert!(!self.event_handling);
        debug_assert!(!self.added_to_loop);
    }
}

/// A selectable I/O handle: binds a file descriptor to a loop, declares
/// interest in readability/writability, and routes readiness back to
/// per-event callbacks.
///
/// A `Channel` never owns its file descriptor — the fd may be a socket, a
/// timer, an eventfd wakeup, or anything else pollable. Closing the fd is
/// always someone else's job. Cloning a `Channel` shares the same
/// underlying descriptor state (it is a cheap `Rc` handle), which is what
/// lets the owning loop and the channel's owner both hold a reference to
/// the same interest set.
#[derive(Clone)]
pub struct Channel(Rc<RefCell<Inner>>);

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("Channel")
            .field("fd", &inner.fd)
            .field("events", &inner.events)
            .field("revents", &inner.revents)
            .field("index", &inner.index)
            .finish()
    }
}

impl Channel {
    pub fn new(loop_: &Rc<RefCell<EventLoop>>, fd: RawFd) -> Channel {
        Channel(Rc::new(RefCell::new(Inner {
            loop_: Rc::downgrade(loop_),
            fd,
            events: NONE_EVENT,
            revents: 0,
            index: -1,
            log_hup: true,
            tie: None,
            tied: false,
            event_handling: false,
            added_to_loop: false,
        })))
    }

    /// Identity for use as a map key; two handles sharing the same
    /// descriptor state compare equal.
    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Sets the interest mask directly without notifying the loop. Only
    /// meant for exercising a [`crate::poller::Poller`] backend in
    /// isolation from a running event loop.
    #[cfg(test)]
    pub(crate) fn set_events_for_test(&self, events: i32) {
        self.0.borrow_mut().events = events;
    }

    pub fn fd(&self) -> RawFd {
        self.0.borrow().fd
    }

    pub fn events(&self) -> i32 {
        self.0.borrow().events
    }

    pub fn set_revents(&self, revents: i32) {
        self.0.borrow_mut().revents = revents;
    }

    pub fn is_none_event(&self) -> bool {
        self.0.borrow().events == NONE_EVENT
    }

    pub fn is_writing(&self) -> bool {
        self.0.borrow().events & WRITE_EVENT != 0
    }

    pub fn is_reading(&self) -> bool {
        self.0.borrow().events & READ_EVENT != 0
    }

    pub fn index(&self) -> i32 {
        self.0.borrow().index
    }

    pub fn set_index(&self, index: i32) {
        self.0.borrow_mut().index = index;
    }

    pub fn do_not_log_hup(&self) {
        self.0.borrow_mut().log_hup = false;
    }

    pub fn set_read_callback(&self, cb: ReadEventCallback) {
        self.0.borrow_mut().read_callback = Some(cb);
    }

    pub fn set_write_callback(&self, cb: EventCallback) {
        self.0.borrow_mut().write_callback = Some(cb);
    }

    pub fn set_close_callback(&self, cb: EventCallback) {
        self.0.borrow_mut().close_callback = Some(cb);
    }

    pub fn set_error_callback(&self, cb: EventCallback) {
        self.0.borrow_mut().error_callback = Some(cb);
    }

    /// Ties this channel's lifetime to `owner`: while the tie is live, any
    /// dispatch first upgrades the weak reference, keeping `owner` alive for
    /// the duration of the call chain even if a callback drops the last
    /// strong reference elsewhere.
    pub fn tie<T: Any>(&self, owner: &Rc<T>) {
        let mut inner = self.0.borrow_mut();
        inner.tie = Some(Rc::downgrade(owner) as Weak<dyn Any>);
        inner.tied = true;
    }

    pub fn enable_reading(&self) {
        self.0.borrow_mut().events |= READ_EVENT;
        self.update();
    }

    pub fn disable_reading(&self) {
        self.0.borrow_mut().events &= !READ_EVENT;
        self.update();
    }

    pub fn enable_writing(&self) {
        self.0.borrow_mut().events |= WRITE_EVENT;
        self.update();
    }

    pub fn disable_writing(&self) {
        self.0.borrow_mut().events &= !WRITE_EVENT;
        self.update();
    }

    pub fn disable_all(&self) {
        self.0.borrow_mut().events = NONE_EVENT;
        self.update();
    }

    fn update(&self) {
        let loop_ = {
            let mut inner = self.0.borrow_mut();
            inner.added_to_loop = true;
            inner.loop_.upgrade()
        };
        if let Some(loop_) = loop_ {
            EventLoop::update_channel(&loop_, self);
        }
    }

    /// Detaches this channel from its loop. Must only be called once all
    /// interest has been disabled (`is_none_event()`).
    pub fn remove(&self) {
        assert!(self.is_none_event());
        let loop_ = {
            let mut inner = self.0.borrow_mut();
            inner.added_to_loop = false;
            inner.loop_.upgrade()
        };
        if let Some(loop_) = loop_ {
            EventLoop::remove_channel(&loop_, self);
        }
    }

    pub fn owner_loop(&self) -> Option<Rc<RefCell<EventLoop>>> {
        self.0.borrow().loop_.upgrade()
    }

    /// Dispatches the last-seen readiness mask to the installed callbacks,
    /// honoring the tie if one was set.
    pub fn handle_event(&self, receive_time: Timestamp) {
        let tied = self.0.borrow().tied;
        if tied {
            let guard = self.0.borrow().tie.as_ref().and_then(Weak::upgrade);
            if guard.is_some() {
                self.handle_event_with_guard(receive_time);
            }
        } else {
            self.handle_event_with_guard(receive_time);
        }
    }

    fn handle_event_with_guard(&self, receive_time: Timestamp) {
        self.0.borrow_mut().event_handling = true;
        let revents = self.0.borrow().revents;
        log::trace!("{}", self.revents_to_string());

        if (revents & libc::POLLHUP != 0) && (revents & libc::POLLIN == 0) {
            let (log_hup, fd) = {
                let inner = self.0.borrow();
                (inner.log_hup, inner.fd)
            };
            if log_hup {
                log::warn!("Channel::handle_event() POLLHUP fd = {}", fd);
            }
            self.invoke_event_callback(
                |inner| inner.close_callback.take(),
                |inner, cb| inner.close_callback = Some(cb),
            );
        }

        if revents & libc::POLLNVAL != 0 {
            log::warn!("Channel::handle_event() POLLNVAL fd = {}", self.fd());
        }

        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            self.invoke_event_callback(
                |inner| inner.error_callback.take(),
                |inner, cb| inner.error_callback = Some(cb),
            );
        }

        if revents & (libc::POLLIN | libc::POLLPRI | libc::POLLRDHUP) != 0 {
            self.invoke_read_callback(receive_time);
        }

        if revents & libc::POLLOUT != 0 {
            self.invoke_event_callback(
                |inner| inner.write_callback.take(),
                |inner, cb| inner.write_callback = Some(cb),
            );
        }

        self.0.borrow_mut().event_handling = false;
    }

    /// Temporarily takes the callback out of the cell so invoking it never
    /// holds a borrow across user code, then restores it (the callback may
    /// legitimately fire again on a later event).
    fn invoke_event_callback(
        &self,
        take: impl FnOnce(&mut Inner) -> Option<EventCallback>,
        restore: impl FnOnce(&mut Inner, EventCallback),
    ) {
        let cb = take(&mut self.0.borrow_mut());
        if let Some(mut cb) = cb {
            cb();
            restore(&mut self.0.borrow_mut(), cb);
        }
    }

    fn invoke_read_callback(&self, receive_time: Timestamp) {
        let cb = self.0.borrow_mut().read_callback.take();
        if let Some(mut cb) = cb {
            cb(receive_time);
            self.0.borrow_mut().read_callback = Some(cb);
        }
    }

    pub fn events_to_string(&self) -> String {
        let inner = self.0.borrow();
        Self::flags_to_string(inner.fd, inner.events)
    }

    pub fn revents_to_string(&self) -> String {
        let inner = self.0.borrow();
        Self::flags_to_string(inner.fd, inner.revents)
    }

    fn flags_to_string(fd: RawFd, ev: i32) -> String {
        let mut out = format!("{}: ", fd);
        if ev & libc::POLLIN != 0 {
            out.push_str("IN ");
        }
        if ev & libc::POLLPRI != 0 {
            out.push_str("PRI ");
        }
        if ev & libc::POLLOUT != 0 {
            out.push_str("OUT ");
        }
        if ev & libc::POLLHUP != 0 {
            out.push_str("HUP ");
        }
        if ev & libc::POLLRDHUP != 0 {
            out.push_str("RDHUP ");
        }
        if ev & libc::POLLERR != 0 {
            out.push_str("ERR ");
        }
        if ev & libc::POLLNVAL != 0 {
            out.push_str("NVAL ");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_flags_toggle_independently() {
        assert_eq!(READ_EVENT, libc::POLLIN | libc::POLLPRI);
        assert_eq!(WRITE_EVENT, libc::POLLOUT);
    }

    #[test]
    fn flags_to_string_lists_set_bits() {
        let s = Channel::flags_to_string(7, libc::POLLIN | libc::POLLOUT);
        assert!(s.contains("IN"));
        assert!(s.contains("OUT"));
        assert!(!s.contains("ERR"));
    }
}
