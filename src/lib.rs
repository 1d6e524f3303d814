//! A reactor-style, non-blocking TCP networking library for UNIX-like
//! systems: one event loop per thread, connections distributed across a
//! pool of such loops, every callback for a connection delivered on its
//! owning loop.
//!
//! Start with [`TcpServer`] or [`TcpClient`]; both sit on top of
//! [`EventLoop`], [`Connection`], [`Acceptor`]/[`Connector`], and the
//! [`Buffer`] used for buffered I/O.

#[macro_use]
mod macros;

pub mod acceptor;
pub mod buffer;
pub mod callbacks;
pub mod channel;
pub mod connection;
pub mod connector;
pub mod event_loop;
pub mod event_loop_thread;
pub mod event_loop_thread_pool;
pub mod http;
pub mod inet_address;
pub mod poller;
pub mod socket;
pub mod sockets_ops;
pub mod tcp_client;
pub mod tcp_server;
pub mod time;
pub mod timer;
mod timer_queue;

pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
pub use channel::Channel;
pub use connection::Connection;
pub use connector::Connector;
pub use event_loop::{EventLoop, EventLoopHandle};
pub use event_loop_thread::EventLoopThread;
pub use event_loop_thread_pool::EventLoopThreadPool;
pub use inet_address::InetAddress;
pub use socket::Socket;
pub use tcp_client::TcpClient;
pub use tcp_server::{ServerOption, TcpServer};
pub use time::Timestamp;
pub use timer::TimerId;
