use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::callbacks::{
    default_connection_callback_arc, default_message_callback_arc, ConnectionCallback,
    MessageCallback, WriteCompleteCallback,
};
use crate::connection::Connection;
use crate::connector::Connector;
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::inet_address::InetAddress;
use crate::socket::Socket;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

struct Shared {
    loop_: Rc<RefCell<EventLoop>>,
    handle: EventLoopHandle,
    connector: Connector,
    name: String,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: std::sync::atomic::AtomicU64,
    connection: Mutex<Option<Connection>>,
    connection_callback: Mutex<ConnectionCallback>,
    message_callback: Mutex<MessageCallback>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
}

/// Establishes and maintains a single outgoing connection to `server_addr`,
/// reconnecting through [`Connector`]'s exponential backoff whenever
/// `retry` is enabled and the peer drops.
///
/// Mirrors [`crate::tcp_server::TcpServer`]'s callback-registration shape,
/// but holds exactly one live connection instead of a map.
#[derive(Clone)]
pub struct TcpClient(Arc<Shared>);

impl TcpClient {
    pub fn new(loop_rc: Rc<RefCell<EventLoop>>, server_addr: InetAddress, name: String) -> TcpClient {
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let handle = EventLoop::handle(&loop_rc);
        let connector = Connector::new(handle.clone(), server_addr);

        let shared = Arc::new(Shared {
            loop_: loop_rc,
            handle,
            connector: connector.clone(),
            name,
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            next_conn_id: std::sync::atomic::AtomicU64::new(id),
            connection: Mutex::new(None),
            connection_callback: Mutex::new(default_connection_callback_arc()),
            message_callback: Mutex::new(default_message_callback_arc()),
            write_complete_callback: Mutex::new(None),
        });
        let client = TcpClient(shared);

        {
            let client = client.clone();
            connector.set_new_connection_callback(Arc::new(move |socket| {
                client.new_connection(socket);
            }));
        }

        client
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Whether the connector retries after the current connection drops.
    /// Off by default, matching the original.
    pub fn enable_retry(&self) {
        self.0.retry.store(true, Ordering::SeqCst);
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

    /// Starts (or restarts) connecting. Safe to call from any thread.
    pub fn connect(&self) {
        log::info!("TcpClient::connect [{}] - connecting to {}", self.0.name, self.0.connector.server_address());
        self.0.connect.store(true, Ordering::SeqCst);
        self.0.connector.start();
    }

    /// Shuts down the current connection's write side, if any. Does not
    /// stop the connector from retrying afterward. Safe to call from any
    /// thread.
    pub fn disconnect(&self) {
        self.0.connect.store(false, Ordering::SeqCst);
        let conn = self.0.connection.lock().unwrap().clone();
        if let Some(conn) = conn {
            conn.shutdown();
        }
    }

    /// Stops the connector outright: no further connection attempts, no
    /// retries. Safe to call from any thread.
    pub fn stop(&self) {
        self.0.connect.store(false, Ordering::SeqCst);
        self.0.connector.stop();
    }

    /// The current connection, if one is established.
    pub fn connection(&self) -> Option<Connection> {
        self.0.connection.lock().unwrap().clone()
    }

    fn new_connection(&self, socket: Socket) {
        EventLoop::assert_in_loop_thread(&self.0.loop_);
        let peer_addr = self.0.connector.server_address();
        let local_addr = InetAddress::from_sockaddr_in(crate::sockets_ops::get_local_addr(socket.raw_fd()));
        let conn_id = self.0.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}:{}#{}", self.0.name, peer_addr.to_ip_port(), conn_id);

        socket.set_keep_alive(true);

        let conn = Connection::create(conn_name, socket, local_addr, peer_addr);
        conn.set_connection_callback(self.0.connection_callback.lock().unwrap().clone());
        conn.set_message_callback(self.0.message_callback.lock().unwrap().clone());
        if let Some(wc) = self.0.write_complete_callback.lock().unwrap().clone() {
            conn.set_write_complete_callback(wc);
        }

        {
            let this = self.clone();
            conn.set_close_callback(Arc::new(move |c| {
                this.remove_connection(c);
            }));
        }

        *self.0.connection.lock().unwrap() = Some(conn.clone());
        conn.connect_established();
    }

    fn remove_connection(&self, conn: &Connection) {
        EventLoop::assert_in_loop_thread(&self.0.loop_);
        *self.0.connection.lock().unwrap() = None;
        conn.queue_connect_destroyed();

        if self.0.retry.load(Ordering::SeqCst) && self.0.connect.load(Ordering::SeqCst) {
            log::info!(
                "TcpClient::remove_connection [{}] - reconnecting to {}",
                self.0.name,
                self.0.connector.server_address()
            );
            self.0.connector.restart();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_has_no_connection_yet() {
        let loop_rc = EventLoop::new_for_test();
        let addr = InetAddress::new(0, true);
        let client = TcpClient::new(loop_rc, addr, "test-client".to_string());
        assert!(client.connection().is_none());
        assert_eq!(client.name(), "test-client");
    }
}
