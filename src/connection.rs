use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::Buffer;
use crate::callbacks::{
    default_connection_callback_arc, default_message_callback_arc, CloseCallback,
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::inet_address::InetAddress;
use crate::socket::Socket;
use crate::time::Timestamp;

/// Default output-buffer size, in bytes, above which the high-water-mark
/// callback fires: 64 MiB, matching the original.
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

static NEXT_CONNECTION_ID: AtomicUsize = AtomicUsize::new(1);

/// The loop-thread-confined half of a connection: the socket, the channel,
/// and the two buffers. Never touched off the owning loop's thread, and
/// reached only through the per-thread registry keyed by [`Shared::id`].
struct Core {
    owner: Connection,
    socket: Socket,
    channel: Channel,
    input_buffer: Buffer,
    output_buffer: Buffer,
}

thread_local! {
    static CORES: RefCell<HashMap<u64, Rc<RefCell<Core>>>> = RefCell::new(HashMap::new());
}

struct Shared {
    id: u64,
    handle: EventLoopHandle,
    name: String,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    state: AtomicU8,
    reading: AtomicBool,
    high_water_mark: AtomicUsize,
    connection_callback: Mutex<ConnectionCallback>,
    message_callback: Mutex<MessageCallback>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_callback: Mutex<Option<HighWaterMarkCallback>>,
    close_callback: Mutex<Option<CloseCallback>>,
    context: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

/// A single established TCP connection.
///
/// Cheap to clone (an `Arc` bump) and safe to hand to any thread: the
/// methods that mutate wire state (`send`, `shutdown`, `force_close`, ...)
/// detect whether they're running on the owning loop and, if not, repost
/// themselves there via the loop's cross-thread queue before touching
/// anything. Callbacks set through `set_*_callback` are always invoked on
/// the owning loop.
#[derive(Clone)]
pub struct Connection(Arc<Shared>);

impl Connection {
    /// Builds a new connection around `socket` and registers its
    /// loop-confined half in the calling thread's registry. Must run on the
    /// thread that will own the connection (the thread with a live
    /// `EventLoop`); callers arriving from elsewhere hop there first via
    /// `EventLoopHandle::run_in_loop`.
    pub(crate) fn create(
        name: String,
        socket: Socket,
        local_addr: InetAddress,
        peer_addr: InetAddress,
    ) -> Connection {
        let loop_rc = EventLoop::current();
        let handle = EventLoop::handle(&loop_rc);
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed) as u64;
        let fd = socket.raw_fd();
        let channel = Channel::new(&loop_rc, fd);
        socket.set_tcp_no_delay(true);

        let shared = Arc::new(Shared {
            id,
            handle,
            name,
            local_addr,
            peer_addr,
            state: AtomicU8::new(State::Connecting as u8),
            reading: AtomicBool::new(false),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            connection_callback: Mutex::new(default_connection_callback_arc()),
            message_callback: Mutex::new(default_message_callback_arc()),
            write_complete_callback: Mutex::new(None),
            high_water_mark_callback: Mutex::new(None),
            close_callback: Mutex::new(None),
            context: Mutex::new(None),
        });
        let connection = Connection(shared);

        let core = Rc::new(RefCell::new(Core {
            owner: connection.clone(),
            socket,
            channel: channel.clone(),
            input_buffer: Buffer::new(),
            output_buffer: Buffer::new(),
        }));

        channel.set_read_callback(Box::new({
            let id = id;
            move |receive_time| Connection::with_core(id, |core| Core::handle_read(core, receive_time))
        }));
        channel.set_write_callback(Box::new({
            let id = id;
            move || Connection::with_core(id, Core::handle_write)
        }));
        channel.set_close_callback(Box::new({
            let id = id;
            move || Connection::with_core(id, Core::handle_close)
        }));
        channel.set_error_callback(Box::new({
            let id = id;
            move || Connection::with_core(id, Core::handle_error)
        }));

        CORES.with(|c| c.borrow_mut().insert(id, core));
        log::debug!("Connection::create [{}] fd = {}", connection.0.name, fd);
        connection
    }

    fn with_core(id: u64, f: impl FnOnce(&Rc<RefCell<Core>>)) {
        let core = CORES.with(|c| c.borrow().get(&id).cloned());
        if let Some(core) = core {
            f(&core);
        }
    }

    fn unregister(id: u64) {
        CORES.with(|c| c.borrow_mut().remove(&id));
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn local_addr(&self) -> InetAddress {
        self.0.local_addr
    }

    pub fn peer_addr(&self) -> InetAddress {
        self.0.peer_addr
    }

    fn state(&self) -> State {
        State::from_u8(self.0.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: State) {
        self.0.state.store(s as u8, Ordering::Release);
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.0.connection_callback.lock().unwrap() = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.0.message_callback.lock().unwrap() = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.0.write_complete_callback.lock().unwrap() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.0.high_water_mark.store(mark, Ordering::Relaxed);
        *self.0.high_water_mark_callback.lock().unwrap() = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.0.close_callback.lock().unwrap() = Some(cb);
    }

    /// Stashes arbitrary per-connection state (a parser, a session handle)
    /// for later retrieval by name-unaware code sharing this connection.
    pub fn set_context(&self, context: Box<dyn Any + Send + Sync>) {
        *self.0.context.lock().unwrap() = Some(context);
    }

    pub fn with_context<R>(&self, f: impl FnOnce(Option<&(dyn Any + Send + Sync)>) -> R) -> R {
        let guard = self.0.context.lock().unwrap();
        f(guard.as_deref())
    }

    /// Sends `data`. Safe to call from any thread: on the owning loop, the
    /// direct-write-then-buffer algorithm runs inline; off it, a copy of
    /// `data` is queued to run there.
    pub fn send(&self, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.0.handle.is_in_loop_thread() {
            Connection::with_core(self.0.id, |core| Core::send_in_loop(core, data));
        } else {
            let id = self.0.id;
            let owned = data.to_vec();
            self.0.handle.queue_in_loop(move || {
                Connection::with_core(id, |core| Core::send_in_loop(core, &owned));
            });
        }
    }

    /// Half-closes the write side once pending output drains. Safe to call
    /// from any thread.
    pub fn shutdown(&self) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let id = self.0.id;
            self.0.handle.run_in_loop(move || {
                Connection::with_core(id, Core::shutdown_in_loop);
            });
        }
    }

    /// Runs `connect_destroyed` on the owning loop, inline if already there.
    /// Used by a server/client tearing down every live connection on its own
    /// shutdown.
    pub(crate) fn run_connect_destroyed(&self) {
        let this = self.clone();
        self.0.handle.run_in_loop(move || this.connect_destroyed());
    }

    /// Posts `connect_destroyed` to run on a later pass through the owning
    /// loop's task queue. Used from inside the connection's own close
    /// callback, where calling `connect_destroyed` inline would tear down
    /// the channel while it's still mid-dispatch.
    pub(crate) fn queue_connect_destroyed(&self) {
        let this = self.clone();
        self.0.handle.queue_in_loop(move || this.connect_destroyed());
    }

    /// Tears the connection down immediately, as if the peer had closed it.
    /// Safe to call from any thread.
    pub fn force_close(&self) {
        let s = self.state();
        if s == State::Connected || s == State::Disconnecting {
            self.set_state(State::Disconnecting);
            let id = self.0.id;
            self.0.handle.queue_in_loop(move || {
                Connection::with_core(id, Core::force_close_in_loop);
            });
        }
    }

    /// Like [`Connection::force_close`], but after a delay. The scheduled
    /// timer holds only a weak reference, so a pending delayed close never
    /// by itself keeps a connection alive past every other owner dropping
    /// it.
    pub fn force_close_with_delay(&self, seconds: f64) {
        let s = self.state();
        if s == State::Connected || s == State::Disconnecting {
            self.set_state(State::Disconnecting);
            let weak = Arc::downgrade(&self.0);
            self.0.handle.run_in_loop(move || {
                let loop_rc = EventLoop::current();
                EventLoop::run_after(
                    &loop_rc,
                    seconds,
                    Box::new(move || {
                        if let Some(shared) = weak.upgrade() {
                            Connection(shared).force_close();
                        }
                    }),
                );
            });
        }
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        let id = self.0.id;
        self.0.handle.run_in_loop(move || {
            Connection::with_core(id, |core| core.borrow().socket.set_tcp_no_delay(on));
        });
    }

    pub fn start_read(&self) {
        let id = self.0.id;
        self.0.handle.run_in_loop(move || {
            Connection::with_core(id, Core::start_read_in_loop);
        });
    }

    pub fn stop_read(&self) {
        let id = self.0.id;
        self.0.handle.run_in_loop(move || {
            Connection::with_core(id, Core::stop_read_in_loop);
        });
    }

    pub fn is_reading(&self) -> bool {
        self.0.reading.load(Ordering::Acquire)
    }

    /// Wires the channel into the loop and invokes the connection callback.
    /// Called once, on the owning loop, right after `create`.
    pub(crate) fn connect_established(&self) {
        self.0.handle.assert_owner(&self.0.handle);
        assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);
        let id = self.0.id;
        Connection::with_core(id, |core| {
            core.borrow().channel.tie(core);
            core.borrow().channel.enable_reading();
        });
        self.0.reading.store(true, Ordering::Release);
        self.invoke_connection_callback();
    }

    /// Tears down the channel and invokes the connection callback one last
    /// time. Called once, on the owning loop, when the connection is
    /// removed from whatever owns it.
    pub(crate) fn connect_destroyed(&self) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            Connection::with_core(self.0.id, |core| core.borrow().channel.disable_all());
            self.invoke_connection_callback();
        }
        Connection::with_core(self.0.id, |core| core.borrow().channel.remove());
        Connection::unregister(self.0.id);
    }

    fn invoke_connection_callback(&self) {
        let cb = self.0.connection_callback.lock().unwrap().clone();
        cb(self);
    }
}

impl Core {
    fn fd(core: &Rc<RefCell<Core>>) -> std::os::unix::io::RawFd {
        core.borrow().channel.fd()
    }

    fn handle_read(core: &Rc<RefCell<Core>>, receive_time: Timestamp) {
        let fd = Core::fd(core);
        let result = core.borrow_mut().input_buffer.read_fd(fd);
        match result {
            Ok(0) => Core::handle_close(core),
            Ok(_n) => {
                let owner = core.borrow().owner.clone();
                let cb = owner.0.message_callback.lock().unwrap().clone();
                // Swap the buffer out so the callback can reenter (e.g. call
                // `send`) without tripping a double `RefCell` borrow.
                let mut buf = std::mem::take(&mut core.borrow_mut().input_buffer);
                cb(&owner, &mut buf, receive_time);
                core.borrow_mut().input_buffer = buf;
            }
            Err(e) => {
                log::error!("Connection::handle_read [{}] - {}", core.borrow().owner.name(), e);
                Core::handle_error(core);
            }
        }
    }

    fn handle_write(core: &Rc<RefCell<Core>>) {
        let is_writing = core.borrow().channel.is_writing();
        if !is_writing {
            log::trace!("Connection::handle_write not writing, ignoring");
            return;
        }
        let fd = Core::fd(core);
        let remaining = {
            let mut c = core.borrow_mut();
            let write_result = crate::sockets_ops::write(fd, c.output_buffer.peek());
            match write_result {
                Ok(n) => {
                    c.output_buffer.retrieve(n);
                    Some(c.output_buffer.readable_bytes())
                }
                Err(e) => {
                    log::error!("Connection::handle_write [{}] - {}", c.owner.name(), e);
                    None
                }
            }
        };

        match remaining {
            None => Core::handle_error(core),
            Some(0) => {
                core.borrow().channel.disable_writing();
                let owner = core.borrow().owner.clone();
                let state_disconnecting = owner.state() == State::Disconnecting;
                if let Some(cb) = owner.0.write_complete_callback.lock().unwrap().clone() {
                    cb(&owner);
                }
                if state_disconnecting {
                    Core::shutdown_in_loop(core);
                }
            }
            Some(_) => {}
        }
    }

    fn handle_close(core: &Rc<RefCell<Core>>) {
        let owner = core.borrow().owner.clone();
        log::trace!("Connection::handle_close [{}] state = {:?}", owner.name(), owner.state());
        debug_assert!(owner.state() == State::Connected || owner.state() == State::Disconnecting);
        owner.set_state(State::Disconnected);
        core.borrow().channel.disable_all();

        owner.invoke_connection_callback();
        if let Some(cb) = owner.0.close_callback.lock().unwrap().clone() {
            cb(&owner);
        }
    }

    fn handle_error(core: &Rc<RefCell<Core>>) {
        let fd = Core::fd(core);
        let err = crate::sockets_ops::get_socket_error(fd);
        log::error!(
            "Connection::handle_error [{}] - SO_ERROR = {} ({})",
            core.borrow().owner.name(),
            err,
            io::Error::from_raw_os_error(err)
        );
    }

    /// Direct-write-then-buffer algorithm: write as much as the kernel will
    /// take right now; if anything's left over (or the output buffer
    /// already had data queued), append the remainder and start watching
    /// for writability.
    fn send_in_loop(core: &Rc<RefCell<Core>>, data: &[u8]) {
        let owner = core.borrow().owner.clone();
        if owner.state() == State::Disconnected {
            log::warn!("Connection::send_in_loop [{}] disconnected, give up writing", owner.name());
            return;
        }

        let fd = Core::fd(core);
        let already_queued = core.borrow().output_buffer.readable_bytes() > 0;
        let mut remaining = data.len();
        let mut fault = false;

        if !already_queued && !core.borrow().channel.is_writing() {
            match crate::sockets_ops::write(fd, data) {
                Ok(n) => {
                    remaining -= n;
                    if remaining == 0 {
                        if let Some(cb) = owner.0.write_complete_callback.lock().unwrap().clone() {
                            let owner = owner.clone();
                            owner.0.handle.queue_in_loop(move || cb(&owner));
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    remaining = 0;
                    if e.raw_os_error() != Some(libc::EPIPE) && e.raw_os_error() != Some(libc::ECONNRESET) {
                        log::error!("Connection::send_in_loop [{}] - {}", owner.name(), e);
                    }
                    fault = true;
                }
            }
        }

        if !fault && remaining > 0 {
            let offset = data.len() - remaining;
            let (old_len, new_len, high_water_mark) = {
                let mut c = core.borrow_mut();
                let old_len = c.output_buffer.readable_bytes();
                c.output_buffer.append(&data[offset..]);
                (old_len, c.output_buffer.readable_bytes(), owner.0.high_water_mark.load(Ordering::Relaxed))
            };
            if old_len < high_water_mark && new_len >= high_water_mark {
                if let Some(cb) = owner.0.high_water_mark_callback.lock().unwrap().clone() {
                    cb(&owner, new_len);
                }
            }
            if !core.borrow().channel.is_writing() {
                core.borrow().channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(core: &Rc<RefCell<Core>>) {
        if !core.borrow().channel.is_writing() {
            core.borrow().socket.shutdown_write();
        }
    }

    fn force_close_in_loop(core: &Rc<RefCell<Core>>) {
        let owner = core.borrow().owner.clone();
        if owner.state() == State::Connected || owner.state() == State::Disconnecting {
            Core::handle_close(core);
        }
    }

    fn start_read_in_loop(core: &Rc<RefCell<Core>>) {
        let owner = core.borrow().owner.clone();
        if !owner.is_reading() {
            core.borrow().channel.enable_reading();
            owner.0.reading.store(true, Ordering::Release);
        }
    }

    fn stop_read_in_loop(core: &Rc<RefCell<Core>>) {
        let owner = core.borrow().owner.clone();
        if owner.is_reading() {
            core.borrow().channel.disable_reading();
            owner.0.reading.store(false, Ordering::Release);
        }
    }
}

impl EventLoopHandle {
    /// Debug-only self-check used by loop-thread-only entry points: panics
    /// with a clearer message than a stray `RefCell` borrow failure would.
    fn assert_owner(&self, _handle: &EventLoopHandle) {
        debug_assert!(self.is_in_loop_thread());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sockets_ops;
    use std::os::unix::io::FromRawFd;

    fn make_pair_sockets() -> (Socket, Socket) {
        let mut fds = [0i32; 2];
        unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0, fds.as_mut_ptr());
        }
        unsafe {
            (
                Socket::new(std::os::unix::io::OwnedFd::from_raw_fd(fds[0])),
                Socket::new(std::os::unix::io::OwnedFd::from_raw_fd(fds[1])),
            )
        }
    }

    #[test]
    fn connect_established_transitions_to_connected_and_fires_callback() {
        let _loop_rc = EventLoop::new_for_test();
        let (a, _b) = make_pair_sockets();
        let addr = InetAddress::new(0, true);
        let conn = Connection::create("test:conn#1".to_string(), a, addr, addr);
        assert!(!conn.connected());

        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        conn.set_connection_callback(Arc::new(move |_c| {
            f.store(true, Ordering::SeqCst);
        }));

        conn.connect_established();
        assert!(conn.connected());
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn send_on_unconnected_connection_is_a_no_op() {
        let _loop_rc = EventLoop::new_for_test();
        let (a, _b) = make_pair_sockets();
        let addr = InetAddress::new(0, true);
        let conn = Connection::create("test:conn#2".to_string(), a, addr, addr);
        conn.send(b"hello"); // not connected yet: dropped silently, must not panic
    }

    #[test]
    fn send_in_loop_writes_through_the_socket() {
        let _loop_rc = EventLoop::new_for_test();
        let (a, b) = make_pair_sockets();
        let addr = InetAddress::new(0, true);
        let conn = Connection::create("test:conn#3".to_string(), a, addr, addr);
        conn.connect_established();
        conn.send(b"ping");

        let mut buf = [0u8; 16];
        let n = sockets_ops::read(b.raw_fd(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }
}
