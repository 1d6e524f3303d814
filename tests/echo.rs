//! Round-trips real bytes through a [`reactor_net::TcpServer`] over a real
//! loopback socket, driving the client side with plain `std::net` the way
//! the teacher's own integration tests drive `std::net` against `mio`
//! types directly.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use rand::Rng;
use reactor_net::{Connection, EventLoop, InetAddress, ServerOption, TcpServer};

const PORT: u16 = 17891;

fn spawn_echo_server(port: u16) -> (mpsc::Sender<()>, thread::JoinHandle<()>) {
    let (ready_tx, ready_rx) = mpsc::channel::<()>();
    let (quit_tx, quit_rx) = mpsc::channel::<()>();

    let join = thread::spawn(move || {
        let loop_rc = EventLoop::new();
        let handle = EventLoop::handle(&loop_rc);
        let addr = InetAddress::new(port, true);
        let server = TcpServer::new(loop_rc.clone(), addr, "echo-test".to_string(), ServerOption::NoReusePort);

        server.set_message_callback(Arc::new(|conn: &Connection, buf, _t| {
            let bytes = buf.retrieve_all_as_bytes();
            conn.send(&bytes);
        }));

        server.start();
        ready_tx.send(()).unwrap();

        // The test thread can only reach this loop through `handle`, so a
        // second thread relays its quit signal in rather than the test
        // blocking on the loop thread directly.
        thread::spawn(move || {
            quit_rx.recv().ok();
            handle.quit();
        });

        EventLoop::run(&loop_rc);
    });

    ready_rx.recv().expect("echo server failed to start");
    (quit_tx, join)
}

#[test]
fn echoes_back_exactly_what_was_sent() {
    let (quit_tx, join) = spawn_echo_server(PORT);

    let mut stream = TcpStream::connect(("127.0.0.1", PORT)).expect("connect to echo server");
    stream.set_nodelay(true).unwrap();

    let mut rng = rand::thread_rng();
    let payload: Vec<u8> = (0..256).map(|_| rng.gen::<u8>()).collect();
    stream.write_all(&payload).unwrap();

    let mut received = vec![0u8; payload.len()];
    stream.read_exact(&mut received).unwrap();
    assert_eq!(received, payload);

    drop(stream);
    quit_tx.send(()).ok();
    join.join().unwrap();
}

#[test]
fn multiple_small_writes_are_all_echoed() {
    let port = PORT + 1;
    let (quit_tx, join) = spawn_echo_server(port);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect to echo server");
    stream.set_nodelay(true).unwrap();

    let mut expected = Vec::new();
    for i in 0u8..10 {
        let chunk = vec![i; 37];
        stream.write_all(&chunk).unwrap();
        expected.extend_from_slice(&chunk);
    }

    let mut received = vec![0u8; expected.len()];
    stream.read_exact(&mut received).unwrap();
    assert_eq!(received, expected);

    drop(stream);
    quit_tx.send(()).ok();
    join.join().unwrap();
}
