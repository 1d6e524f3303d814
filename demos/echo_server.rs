//! A TCP echo server built on [`reactor_net::TcpServer`].
//!
//! ```text
//! $ cargo run --example echo_server -- 7007
//! $ nc 127.0.0.1 7007
//! ```

use std::io;

use reactor_net::{Connection, EventLoop, InetAddress, ServerOption, TcpServer};

fn main() -> io::Result<()> {
    env_logger::init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(7007);

    let loop_rc = EventLoop::new();
    let addr = InetAddress::new(port, false);
    let server = TcpServer::new(loop_rc.clone(), addr, "EchoServer".to_string(), ServerOption::ReusePort);

    server.set_connection_callback(std::sync::Arc::new(|conn: &Connection| {
        println!(
            "{} -> {} is {}",
            conn.local_addr(),
            conn.peer_addr(),
            if conn.connected() { "UP" } else { "DOWN" }
        );
    }));

    server.set_message_callback(std::sync::Arc::new(|conn, buf, receive_time| {
        let msg = buf.retrieve_all_as_bytes();
        println!(
            "{} echoing {} bytes, received at {}",
            conn.name(),
            msg.len(),
            receive_time.to_formatted_string(true)
        );
        conn.send(&msg);
    }));

    println!("echo_server listening on 127.0.0.1:{port}");
    server.start();
    EventLoop::run(&loop_rc);
    Ok(())
}
