use std::ffi::CStr;
use std::io;
use std::mem;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

/// Creates a non-blocking, close-on-exec IPv4 TCP socket. Socket creation
/// failing is an environment-level problem (fd exhaustion at the process
/// level, or no networking support at all); callers can't meaningfully
/// recover from it, so this panics rather than returning a `Result`,
/// matching the rest of the "OrDie" family below.
pub fn create_nonblocking_or_die() -> OwnedFd {
    let fd = syscall!(socket(
        libc::AF_INET,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        libc::IPPROTO_TCP,
    ))
    .unwrap_or_else(|e| panic!("sockets::create_nonblocking_or_die: {}", e));
    // SAFETY: socket() returned a freshly owned, valid fd.
    unsafe { OwnedFd::from_raw_fd(fd) }
}

pub fn connect(fd: RawFd, addr: &libc::sockaddr_in) -> io::Result<()> {
    syscall!(connect(
        fd,
        addr as *const libc::sockaddr_in as *const libc::sockaddr,
        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
    ))
    .map(|_| ())
}

pub fn bind_or_die(fd: RawFd, addr: &libc::sockaddr_in) {
    syscall!(bind(
        fd,
        addr as *const libc::sockaddr_in as *const libc::sockaddr,
        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
    ))
    .unwrap_or_else(|e| panic!("sockets::bind_or_die: {}", e));
}

pub fn listen_or_die(fd: RawFd) {
    syscall!(listen(fd, libc::SOMAXCONN)).unwrap_or_else(|e| panic!("sockets::listen_or_die: {}", e));
}

/// Accepts one connection, returning the new fd and the peer's address.
/// `Ok(None)` on a transient "nothing to accept yet" condition; propagates
/// anything else as an error for the caller to log and, per `EMFILE`,
/// recover from.
pub fn accept(fd: RawFd) -> io::Result<(OwnedFd, libc::sockaddr_in)> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut addrlen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let connfd = syscall!(accept4(
        fd,
        &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
        &mut addrlen,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ))?;
    // SAFETY: accept4() returned a freshly owned, valid fd.
    Ok((unsafe { OwnedFd::from_raw_fd(connfd) }, addr))
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())).map(|n| n as usize)
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len())).map(|n| n as usize)
}

pub fn close(fd: RawFd) {
    if let Err(e) = syscall!(close(fd)) {
        log::error!("sockets::close: {}", e);
    }
}

pub fn shutdown_write(fd: RawFd) {
    if let Err(e) = syscall!(shutdown(fd, libc::SHUT_WR)) {
        log::error!("sockets::shutdown_write: {}", e);
    }
}

pub fn set_tcp_nodelay(fd: RawFd, on: bool) {
    set_bool_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on);
}

pub fn set_reuse_addr(fd: RawFd, on: bool) {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on);
}

pub fn set_reuse_port(fd: RawFd, on: bool) {
    if let Err(e) = try_set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on) {
        if on {
            log::error!("SO_REUSEPORT failed: {}", e);
        }
    }
}

pub fn set_keepalive(fd: RawFd, on: bool) {
    set_bool_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on);
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, on: bool) {
    // best-effort, as the original: failures here are logged, not fatal.
    let _ = try_set_bool_opt(fd, level, name, on);
}

fn try_set_bool_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, on: bool) -> io::Result<()> {
    let optval: libc::c_int = if on { 1 } else { 0 };
    syscall!(setsockopt(
        fd,
        level,
        name,
        &optval as *const libc::c_int as *const libc::c_void,
        mem::size_of::<libc::c_int>() as libc::socklen_t,
    ))
    .map(|_| ())
}

pub fn get_socket_error(fd: RawFd) -> i32 {
    let mut optval: libc::c_int = 0;
    let mut optlen = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut optval as *mut libc::c_int as *mut libc::c_void,
            &mut optlen,
        )
    };
    if ret < 0 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    } else {
        optval
    }
}

pub fn get_local_addr(fd: RawFd) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut addrlen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd,
            &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut addrlen,
        )
    };
    if ret < 0 {
        log::error!("sockets::get_local_addr: {}", io::Error::last_os_error());
    }
    addr
}

pub fn get_peer_addr(fd: RawFd) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut addrlen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getpeername(
            fd,
            &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut addrlen,
        )
    };
    if ret < 0 {
        log::error!("sockets::get_peer_addr: {}", io::Error::last_os_error());
    }
    addr
}

pub fn is_self_connect(fd: RawFd) -> bool {
    let local = get_local_addr(fd);
    let peer = get_peer_addr(fd);
    local.sin_port == peer.sin_port && local.sin_addr.s_addr == peer.sin_addr.s_addr
}

pub fn to_ip(addr: &libc::sockaddr_in) -> String {
    let mut buf = [0u8; libc::INET_ADDRSTRLEN as usize];
    let ptr = unsafe {
        libc::inet_ntop(
            libc::AF_INET,
            &addr.sin_addr as *const libc::in_addr as *const libc::c_void,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len() as libc::socklen_t,
        )
    };
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(buf.as_ptr() as *const libc::c_char) }
        .to_string_lossy()
        .into_owned()
}

pub fn to_ip_port(addr: &libc::sockaddr_in) -> String {
    format!("{}:{}", to_ip(addr), u16::from_be(addr.sin_port))
}

pub fn from_ip_port(ip: &str, port: u16) -> io::Result<libc::sockaddr_in> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    let c_ip = std::ffi::CString::new(ip).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let ret = unsafe { libc::inet_pton(libc::AF_INET, c_ip.as_ptr(), &mut addr.sin_addr as *mut libc::in_addr as *mut libc::c_void) };
    if ret <= 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("not a valid IPv4 address: {}", ip)));
    }
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_ip_port_formatting() {
        let addr = from_ip_port("127.0.0.1", 8080).unwrap();
        assert_eq!(to_ip(&addr), "127.0.0.1");
        assert_eq!(to_ip_port(&addr), "127.0.0.1:8080");
    }

    #[test]
    fn from_ip_port_rejects_garbage() {
        assert!(from_ip_port("not-an-ip", 80).is_err());
    }

    #[test]
    fn create_bind_listen_close_round_trip() {
        use std::os::unix::io::AsRawFd;
        let fd = create_nonblocking_or_die();
        let addr = from_ip_port("127.0.0.1", 0).unwrap();
        bind_or_die(fd.as_raw_fd(), &addr);
        listen_or_die(fd.as_raw_fd());
    }
}
