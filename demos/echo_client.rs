//! A TCP echo client built on [`reactor_net::TcpClient`].
//!
//! Connects, sends one line, prints whatever comes back, then exits.
//!
//! ```text
//! $ cargo run --example echo_client -- 127.0.0.1 7007
//! ```

use std::io;
use std::sync::Arc;

use reactor_net::{EventLoop, InetAddress, TcpClient};

fn main() -> io::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = args.next().and_then(|s| s.parse().ok()).unwrap_or(7007);

    let loop_rc = EventLoop::new();
    let addr = InetAddress::with_ip_port(&host, port)?;
    let client = TcpClient::new(loop_rc.clone(), addr, "EchoClient".to_string());

    client.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            println!("connected to {}", conn.peer_addr());
            conn.send(b"hello from echo_client\n");
        } else {
            println!("disconnected from {}", conn.peer_addr());
            EventLoop::quit(&EventLoop::current());
        }
    }));

    client.set_message_callback(Arc::new(|conn, buf, _receive_time| {
        let reply = buf.retrieve_all_as_bytes();
        print!("{}", String::from_utf8_lossy(&reply));
        conn.shutdown();
    }));

    client.connect();
    EventLoop::run(&loop_rc);
    Ok(())
}
