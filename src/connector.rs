use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::channel::Channel;
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::inet_address::InetAddress;
use crate::socket::Socket;
use crate::sockets_ops;
use crate::timer::TimerId;

const MAX_RETRY_DELAY_MS: u32 = 30_000;
const INIT_RETRY_DELAY_MS: u32 = 500;

pub type NewConnectionCallback = Arc<dyn Fn(Socket) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Disconnected,
            1 => State::Connecting,
            _ => State::Connected,
        }
    }
}

static NEXT_CONNECTOR_ID: AtomicU64 = AtomicU64::new(1);

/// The loop-thread-confined half of a [`Connector`]: the channel watching
/// the in-progress connect, the current retry delay, and a handle to the
/// pending retry timer (so `stop` can actually cancel it, rather than the
/// best-effort the original left as a FIXME).
struct Core {
    channel: Option<Channel>,
    retry_delay_ms: u32,
    retry_timer: Option<TimerId>,
}

thread_local! {
    static CORES: RefCell<HashMap<u64, Rc<RefCell<Core>>>> = RefCell::new(HashMap::new());
}

struct Shared {
    id: u64,
    handle: EventLoopHandle,
    server_addr: InetAddress,
    connect: AtomicBool,
    state: AtomicU8,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
}

/// Repeatedly attempts to establish one outgoing TCP connection, with
/// exponential backoff between attempts (500ms up to 30s). `start`/`stop`
/// are safe to call from any thread; `restart` must run on the owning loop.
#[derive(Clone)]
pub struct Connector(Arc<Shared>);

impl Connector {
    pub fn new(handle: EventLoopHandle, server_addr: InetAddress) -> Connector {
        let id = NEXT_CONNECTOR_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared {
            id,
            handle,
            server_addr,
            connect: AtomicBool::new(false),
            state: AtomicU8::new(State::Disconnected as u8),
            new_connection_callback: Mutex::new(None),
        });
        Connector(shared)
    }

    pub fn server_address(&self) -> InetAddress {
        self.0.server_addr
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.0.new_connection_callback.lock().unwrap() = Some(cb);
    }

    fn state(&self) -> State {
        State::from_u8(self.0.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: State) {
        self.0.state.store(s as u8, Ordering::Release);
    }

    fn with_core(&self, f: impl FnOnce(&Rc<RefCell<Core>>)) {
        let id = self.0.id;
        let core = CORES.with(|c| {
            c.borrow_mut()
                .entry(id)
                .or_insert_with(|| {
                    Rc::new(RefCell::new(Core {
                        channel: None,
                        retry_delay_ms: INIT_RETRY_DELAY_MS,
                        retry_timer: None,
                    }))
                })
                .clone()
        });
        f(&core);
    }

    /// Safe to call from any thread.
    pub fn start(&self) {
        self.0.connect.store(true, Ordering::SeqCst);
        let this = self.clone();
        self.0.handle.run_in_loop(move || this.start_in_loop());
    }

    /// Resets state and connects again with the initial retry delay. Must
    /// be called on the owning loop.
    pub fn restart(&self) {
        debug_assert!(self.0.handle.is_in_loop_thread());
        self.set_state(State::Disconnected);
        self.with_core(|core| core.borrow_mut().retry_delay_ms = INIT_RETRY_DELAY_MS);
        self.0.connect.store(true, Ordering::SeqCst);
        self.start_in_loop();
    }

    /// Safe to call from any thread.
    pub fn stop(&self) {
        self.0.connect.store(false, Ordering::SeqCst);
        let this = self.clone();
        self.0.handle.queue_in_loop(move || this.stop_in_loop());
    }

    fn start_in_loop(&self) {
        debug_assert!(self.0.handle.is_in_loop_thread());
        debug_assert_eq!(self.state(), State::Disconnected);
        if self.0.connect.load(Ordering::SeqCst) {
            self.connect_in_loop();
        } else {
            log::debug!("Connector::start_in_loop do not connect");
        }
    }

    fn stop_in_loop(&self) {
        debug_assert!(self.0.handle.is_in_loop_thread());
        if self.state() == State::Connecting {
            self.set_state(State::Disconnected);
            let sockfd = self.remove_and_reset_channel();
            sockets_ops::close(sockfd);
        }
        self.with_core(|core| {
            if let Some(id) = core.borrow_mut().retry_timer.take() {
                let loop_rc = EventLoop::current();
                EventLoop::cancel(&loop_rc, id);
            }
        });
    }

    fn connect_in_loop(&self) {
        let fd = sockets_ops::create_nonblocking_or_die();
        let raw_fd = {
            use std::os::unix::io::AsRawFd;
            fd.as_raw_fd()
        };
        // From here the fd is managed manually (mirroring the connect(2)
        // error table below, each arm owning exactly one close), not via
        // `OwnedFd`'s drop.
        std::mem::forget(fd);

        let result = sockets_ops::connect(raw_fd, self.0.server_addr.as_sockaddr_in());
        let saved_errno = result.err().and_then(|e| e.raw_os_error()).unwrap_or(0);

        match saved_errno {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => {
                self.connecting(raw_fd);
            }
            libc::EAGAIN | libc::EADDRINUSE | libc::EADDRNOTAVAIL | libc::ECONNREFUSED | libc::ENETUNREACH => {
                self.retry(raw_fd, true);
            }
            libc::EACCES | libc::EPERM | libc::EAFNOSUPPORT | libc::EALREADY | libc::EBADF | libc::EFAULT
            | libc::ENOTSOCK => {
                log::error!("Connector::connect_in_loop - error {}", saved_errno);
                sockets_ops::close(raw_fd);
            }
            _ => {
                log::error!("Connector::connect_in_loop - unexpected error {}", saved_errno);
                sockets_ops::close(raw_fd);
            }
        }
    }

    fn connecting(&self, sockfd: i32) {
        self.set_state(State::Connecting);
        let loop_rc = EventLoop::current();
        let channel = Channel::new(&loop_rc, sockfd);

        {
            let this = self.clone();
            channel.set_write_callback(Box::new(move || this.handle_write()));
        }
        {
            let this = self.clone();
            channel.set_error_callback(Box::new(move || this.handle_error()));
        }
        channel.enable_writing();

        self.with_core(|core| core.borrow_mut().channel = Some(channel));
    }

    /// Disables and removes the channel, returning its fd for the caller to
    /// close or hand off. The channel itself is dropped on a later pass
    /// through the loop's pending-functor queue rather than immediately,
    /// since this runs from inside the channel's own event dispatch.
    fn remove_and_reset_channel(&self) -> i32 {
        let fd = self.with_core_ret(|core| {
            let mut c = core.borrow_mut();
            let channel = c.channel.take().expect("Connector: no channel to remove");
            channel.disable_all();
            channel.remove();
            channel.fd()
        });
        fd
    }

    fn with_core_ret<R>(&self, f: impl FnOnce(&Rc<RefCell<Core>>) -> R) -> R {
        let mut out = None;
        self.with_core(|core| out = Some(f(core)));
        out.unwrap()
    }

    fn handle_write(&self) {
        log::trace!("Connector::handle_write state = {:?}", self.state());
        if self.state() == State::Connecting {
            let sockfd = self.remove_and_reset_channel();
            let err = sockets_ops::get_socket_error(sockfd);
            if err != 0 {
                log::warn!(
                    "Connector::handle_write - SO_ERROR = {} ({})",
                    err,
                    io::Error::from_raw_os_error(err)
                );
                self.retry(sockfd, false);
            } else if sockets_ops::is_self_connect(sockfd) {
                log::warn!("Connector::handle_write - Self connect");
                self.retry(sockfd, false);
            } else {
                self.set_state(State::Connected);
                if self.0.connect.load(Ordering::SeqCst) {
                    let cb = self.0.new_connection_callback.lock().unwrap().clone();
                    if let Some(cb) = cb {
                        use std::os::unix::io::FromRawFd;
                        let socket = unsafe { Socket::new(std::os::unix::io::OwnedFd::from_raw_fd(sockfd)) };
                        cb(socket);
                    } else {
                        sockets_ops::close(sockfd);
                    }
                } else {
                    sockets_ops::close(sockfd);
                }
            }
        } else {
            debug_assert_eq!(self.state(), State::Disconnected);
        }
    }

    fn handle_error(&self) {
        log::error!("Connector::handle_error state = {:?}", self.state());
        if self.state() == State::Connecting {
            let sockfd = self.remove_and_reset_channel();
            let err = sockets_ops::get_socket_error(sockfd);
            log::trace!("SO_ERROR = {} ({})", err, io::Error::from_raw_os_error(err));
            self.retry(sockfd, false);
        }
    }

    /// Closes `sockfd` and, if still wanting to connect, schedules another
    /// attempt after the current backoff, doubling it (capped at 30s) for
    /// next time. `from_connect` is purely cosmetic (matches the log
    /// message the direct-connect-error path used in the original).
    fn retry(&self, sockfd: i32, _from_connect: bool) {
        sockets_ops::close(sockfd);
        self.set_state(State::Disconnected);

        if self.0.connect.load(Ordering::SeqCst) {
            let delay_ms = self.with_core_ret(|core| core.borrow().retry_delay_ms);
            log::info!(
                "Connector::retry - retry connecting to {} in {}ms",
                self.0.server_addr,
                delay_ms
            );
            let loop_rc = EventLoop::current();
            let this = self.clone();
            let timer_id = EventLoop::run_after(
                &loop_rc,
                delay_ms as f64 / 1000.0,
                Box::new(move || this.start_in_loop()),
            );
            self.with_core(|core| {
                let mut c = core.borrow_mut();
                c.retry_timer = Some(timer_id);
                c.retry_delay_ms = (c.retry_delay_ms * 2).min(MAX_RETRY_DELAY_MS);
            });
        } else {
            log::debug!("Connector::retry do not connect");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_connector_starts_disconnected() {
        let loop_rc = EventLoop::new_for_test();
        let handle = EventLoop::handle(&loop_rc);
        let addr = InetAddress::new(0, true);
        let connector = Connector::new(handle, addr);
        assert_eq!(connector.state(), State::Disconnected);
        assert_eq!(connector.server_address().port(), addr.port());
    }
}
