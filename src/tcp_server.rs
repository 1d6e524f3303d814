use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::acceptor::Acceptor;
use crate::callbacks::{
    default_connection_callback_arc, default_message_callback_arc, ConnectionCallback,
    MessageCallback, WriteCompleteCallback,
};
use crate::connection::Connection;
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::event_loop_thread_pool::EventLoopThreadPool;
use crate::inet_address::InetAddress;
use crate::socket::Socket;
use crate::sockets_ops;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOption {
    NoReusePort,
    ReusePort,
}

pub type ThreadInitCallback = Rc<dyn Fn(&Rc<RefCell<EventLoop>>)>;

static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static SERVERS: RefCell<HashMap<u64, Rc<RefCell<Inner>>>> = RefCell::new(HashMap::new());
}

struct Inner {
    loop_: Rc<RefCell<EventLoop>>,
    handle: EventLoopHandle,
    id: u64,
    hostport: String,
    name: String,
    acceptor: Option<Acceptor>,
    thread_pool: EventLoopThreadPool,
    connection_callback: ConnectionCallback,
    message_callback: MessageCallback,
    write_complete_callback: Option<WriteCompleteCallback>,
    thread_init_callback: Option<ThreadInitCallback>,
    started: AtomicBool,
    next_conn_id: u64,
    connections: HashMap<String, Connection>,
}

/// Accepts connections on one loop and hands each one to a loop picked
/// round-robin from a worker pool. Not shareable across threads: every
/// public method but the ones a callback posts back to itself must run on
/// the listen loop.
pub struct TcpServer(Rc<RefCell<Inner>>);

impl TcpServer {
    pub fn new(
        loop_rc: Rc<RefCell<EventLoop>>,
        listen_addr: InetAddress,
        name: String,
        option: ServerOption,
    ) -> TcpServer {
        let handle = EventLoop::handle(&loop_rc);
        let id = NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed);
        let hostport = listen_addr.to_ip_port();

        let inner = Rc::new(RefCell::new(Inner {
            loop_: Rc::clone(&loop_rc),
            handle,
            id,
            hostport,
            name,
            acceptor: None,
            thread_pool: EventLoopThreadPool::new(Rc::clone(&loop_rc)),
            connection_callback: default_connection_callback_arc(),
            message_callback: default_message_callback_arc(),
            write_complete_callback: None,
            thread_init_callback: None,
            started: AtomicBool::new(false),
            next_conn_id: 1,
            connections: HashMap::new(),
        }));

        let acceptor = Acceptor::new(&loop_rc, &listen_addr, option == ServerOption::ReusePort);
        {
            let weak = Rc::downgrade(&inner);
            acceptor.set_new_connection_callback(Box::new(move |socket, peer_addr| {
                if let Some(inner) = weak.upgrade() {
                    TcpServer::new_connection(&inner, socket, peer_addr);
                }
            }));
        }
        inner.borrow_mut().acceptor = Some(acceptor);

        SERVERS.with(|s| s.borrow_mut().insert(id, Rc::clone(&inner)));

        TcpServer(inner)
    }

    pub fn hostport(&self) -> String {
        self.0.borrow().hostport.clone()
    }

    pub fn name(&self) -> String {
        self.0.borrow().name.clone()
    }

    /// Must be called before [`TcpServer::start`]: 0 keeps every accepted
    /// connection on the listen loop, N spreads them round-robin over an
    /// N-thread pool.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.0.borrow_mut().thread_pool.set_thread_num(num_threads);
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        self.0.borrow_mut().thread_init_callback = Some(cb);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.0.borrow_mut().connection_callback = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.0.borrow_mut().message_callback = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.0.borrow_mut().write_complete_callback = Some(cb);
    }

    /// Boots the worker pool and arms the acceptor. Harmless to call more
    /// than once — only the first call does anything. Must run on the
    /// listen loop (worker-pool startup asserts this already).
    pub fn start(&self) {
        if self.0.borrow().started.swap(true, Ordering::SeqCst) {
            return;
        }

        let init_cb = self.0.borrow().thread_init_callback.clone();
        self.0.borrow_mut().thread_pool.start(init_cb);

        let i = self.0.borrow();
        assert!(!i.acceptor.as_ref().unwrap().listening());
        i.acceptor.as_ref().unwrap().listen();
    }

    fn new_connection(inner: &Rc<RefCell<Inner>>, socket: Socket, peer_addr: InetAddress) {
        let (io_handle, conn_name, server_name, listen_handle, server_id, local_addr, conn_cb, msg_cb, write_cb) = {
            let mut i = inner.borrow_mut();
            EventLoop::assert_in_loop_thread(&i.loop_);
            let io_handle = i.thread_pool.get_next_loop();
            let conn_id = i.next_conn_id;
            i.next_conn_id += 1;
            let conn_name = format!("{}:{}#{}", i.name, i.hostport, conn_id);
            let local_addr = InetAddress::from_sockaddr_in(sockets_ops::get_local_addr(socket.raw_fd()));
            (
                io_handle,
                conn_name,
                i.name.clone(),
                i.handle.clone(),
                i.id,
                local_addr,
                i.connection_callback.clone(),
                i.message_callback.clone(),
                i.write_complete_callback.clone(),
            )
        };

        log::info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            server_name,
            conn_name,
            peer_addr
        );

        socket.set_keep_alive(true);

        io_handle.run_in_loop(move || {
            let conn = Connection::create(conn_name.clone(), socket, local_addr, peer_addr);
            conn.set_connection_callback(conn_cb);
            conn.set_message_callback(msg_cb);
            if let Some(wc) = write_cb {
                conn.set_write_complete_callback(wc);
            }

            {
                let listen_handle = listen_handle.clone();
                let conn_name = conn_name.clone();
                conn.set_close_callback(Arc::new(move |c| {
                    let c = c.clone();
                    let conn_name = conn_name.clone();
                    listen_handle.run_in_loop(move || {
                        TcpServer::remove_connection_in_loop(server_id, &conn_name, &c);
                    });
                }));
            }

            {
                let listen_handle = listen_handle.clone();
                let conn_name = conn_name.clone();
                let conn = conn.clone();
                listen_handle.run_in_loop(move || {
                    TcpServer::insert_connection(server_id, conn_name, conn);
                });
            }

            conn.connect_established();
        });
    }

    fn insert_connection(server_id: u64, name: String, conn: Connection) {
        let inner = SERVERS.with(|s| s.borrow().get(&server_id).cloned());
        if let Some(inner) = inner {
            inner.borrow_mut().connections.insert(name, conn);
        }
    }

    fn remove_connection_in_loop(server_id: u64, name: &str, conn: &Connection) {
        let inner = SERVERS.with(|s| s.borrow().get(&server_id).cloned());
        if let Some(inner) = inner {
            let server_name = {
                let mut i = inner.borrow_mut();
                EventLoop::assert_in_loop_thread(&i.loop_);
                i.connections.remove(name);
                i.name.clone()
            };
            log::info!("TcpServer::remove_connection_in_loop [{}] - connection {}", server_name, name);
        }
        conn.queue_connect_destroyed();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        EventLoop::assert_in_loop_thread(&self.loop_);
        log::debug!("TcpServer::drop [{}] destructing", self.name);
        SERVERS.with(|s| {
            s.borrow_mut().remove(&self.id);
        });
        for (_, conn) in self.connections.drain() {
            conn.run_connect_destroyed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_server_is_not_started() {
        let loop_rc = EventLoop::new_for_test();
        let addr = InetAddress::new(0, true);
        let server = TcpServer::new(loop_rc, addr, "test".to_string(), ServerOption::NoReusePort);
        assert!(!server.0.borrow().started.load(Ordering::SeqCst));
    }

    #[test]
    fn hostport_and_name_are_reported() {
        let loop_rc = EventLoop::new_for_test();
        let addr = InetAddress::new(2007, true);
        let server = TcpServer::new(loop_rc, addr, "echo".to_string(), ServerOption::NoReusePort);
        assert_eq!(server.name(), "echo");
        assert_eq!(server.hostport(), "127.0.0.1:2007");
    }
}
