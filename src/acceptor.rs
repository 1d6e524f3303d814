use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::inet_address::InetAddress;
use crate::socket::Socket;
use crate::sockets_ops;

pub type NewConnectionCallback = Box<dyn FnMut(Socket, InetAddress)>;

const DEV_NULL: &[u8] = b"/dev/null\0";

struct Inner {
    loop_: Rc<RefCell<EventLoop>>,
    accept_socket: Socket,
    accept_channel: Channel,
    new_connection_callback: Option<NewConnectionCallback>,
    listening: bool,
    idle_fd: RawFd,
}

/// Listens for and accepts incoming connections on the loop it was built on.
/// Never shared across threads: a [`crate::tcp_server::TcpServer`] owns one
/// and only ever touches it from its own listen loop.
pub struct Acceptor(Rc<RefCell<Inner>>);

impl Acceptor {
    pub fn new(loop_rc: &Rc<RefCell<EventLoop>>, listen_addr: &InetAddress, reuse_port: bool) -> Acceptor {
        let socket = Socket::new(sockets_ops::create_nonblocking_or_die());
        socket.set_reuse_addr(true);
        socket.set_reuse_port(reuse_port);
        socket.bind_address(listen_addr);

        let channel = Channel::new(loop_rc, socket.raw_fd());
        let idle_fd = unsafe { libc::open(DEV_NULL.as_ptr() as *const libc::c_char, libc::O_RDONLY | libc::O_CLOEXEC) };
        if idle_fd < 0 {
            panic!("Acceptor::new: failed to open /dev/null as the idle fd");
        }

        let inner = Rc::new(RefCell::new(Inner {
            loop_: Rc::clone(loop_rc),
            accept_socket: socket,
            accept_channel: channel.clone(),
            new_connection_callback: None,
            listening: false,
            idle_fd,
        }));

        {
            let weak = Rc::downgrade(&inner);
            channel.set_read_callback(Box::new(move |_receive_time| {
                if let Some(inner) = weak.upgrade() {
                    Acceptor::handle_read(&inner);
                }
            }));
        }

        Acceptor(inner)
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        self.0.borrow_mut().new_connection_callback = Some(cb);
    }

    pub fn listening(&self) -> bool {
        self.0.borrow().listening
    }

    pub fn listen(&self) {
        let loop_rc = Rc::clone(&self.0.borrow().loop_);
        EventLoop::assert_in_loop_thread(&loop_rc);
        self.0.borrow_mut().listening = true;
        self.0.borrow().accept_socket.listen();
        self.0.borrow().accept_channel.enable_reading();
    }

    fn handle_read(inner: &Rc<RefCell<Inner>>) {
        let loop_rc = Rc::clone(&inner.borrow().loop_);
        EventLoop::assert_in_loop_thread(&loop_rc);

        match inner.borrow().accept_socket.accept() {
            Ok(Some((socket, peer_addr))) => {
                let mut i = inner.borrow_mut();
                if let Some(cb) = i.new_connection_callback.as_mut() {
                    cb(socket, peer_addr);
                }
                // else: socket drops here, closing the fd.
            }
            Ok(None) => {}
            Err(e) => {
                log::error!("Acceptor::handle_read accept failed: {}", e);
                // The special problem of accept()ing when you can't: we've
                // hit the per-process fd limit, so the listening socket
                // stays readable forever and spins the loop. Free up one fd,
                // use it to accept and immediately drop the connection, then
                // reopen it, following libev's documented workaround.
                if e.raw_os_error() == Some(libc::EMFILE) {
                    let mut i = inner.borrow_mut();
                    unsafe { libc::close(i.idle_fd) };
                    i.idle_fd = unsafe {
                        libc::accept(i.accept_socket.raw_fd(), std::ptr::null_mut(), std::ptr::null_mut())
                    };
                    unsafe { libc::close(i.idle_fd) };
                    i.idle_fd = unsafe { libc::open(DEV_NULL.as_ptr() as *const libc::c_char, libc::O_RDONLY | libc::O_CLOEXEC) };
                }
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.accept_channel.disable_all();
        self.accept_channel.remove();
        unsafe { libc::close(self.idle_fd) };
    }
}
