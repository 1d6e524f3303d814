use std::os::unix::io::{OwnedFd, RawFd};

use crate::inet_address::InetAddress;
use crate::sockets_ops;

/// RAII ownership of a socket fd: binds, listens, accepts, and tunes socket
/// options, closing the fd on drop.
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    pub fn new(fd: OwnedFd) -> Socket {
        Socket { fd }
    }

    pub fn raw_fd(&self) -> RawFd {
        use std::os::unix::io::AsRawFd;
        self.fd.as_raw_fd()
    }

    pub fn bind_address(&self, addr: &InetAddress) {
        sockets_ops::bind_or_die(self.raw_fd(), addr.as_sockaddr_in());
    }

    pub fn listen(&self) {
        sockets_ops::listen_or_die(self.raw_fd());
    }

    /// Accepts one pending connection, if any. Returns `None` on a
    /// transient "nothing ready" condition (`EAGAIN`/`EWOULDBLOCK`); any
    /// other error, including `EMFILE`, is returned for the acceptor to
    /// classify.
    pub fn accept(&self) -> std::io::Result<Option<(Socket, InetAddress)>> {
        match sockets_ops::accept(self.raw_fd()) {
            Ok((fd, addr)) => Ok(Some((Socket::new(fd), InetAddress::from_sockaddr_in(addr)))),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn shutdown_write(&self) {
        sockets_ops::shutdown_write(self.raw_fd());
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        sockets_ops::set_tcp_nodelay(self.raw_fd(), on);
    }

    pub fn set_reuse_addr(&self, on: bool) {
        sockets_ops::set_reuse_addr(self.raw_fd(), on);
    }

    pub fn set_reuse_port(&self, on: bool) {
        sockets_ops::set_reuse_port(self.raw_fd(), on);
    }

    pub fn set_keep_alive(&self, on: bool) {
        sockets_ops::set_keepalive(self.raw_fd(), on);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_listen_and_accept_nothing_pending() {
        let socket = Socket::new(sockets_ops::create_nonblocking_or_die());
        let addr = InetAddress::new(0, true);
        socket.bind_address(&addr);
        socket.listen();
        assert!(socket.accept().unwrap().is_none());
    }
}
