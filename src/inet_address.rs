use std::ffi::CString;
use std::fmt;
use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::ptr;

use crate::sockets_ops;

/// An IPv4 endpoint: wraps a `sockaddr_in`.
///
/// Cheap to copy; two-field wide (family/port/addr all live inline), no
/// allocation. TLS/IPv6 are out of scope for this crate, so this is the
/// only address representation the wire layer needs.
#[derive(Clone, Copy)]
pub struct InetAddress {
    addr: libc::sockaddr_in,
}

impl InetAddress {
    /// An endpoint with the given port, bound to all interfaces (or only
    /// the loopback interface if `loopback_only` is set). Mostly used for
    /// `TcpServer` listening addresses.
    pub fn new(port: u16, loopback_only: bool) -> InetAddress {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        let ip = if loopback_only {
            u32::from(Ipv4Addr::LOCALHOST)
        } else {
            u32::from(Ipv4Addr::UNSPECIFIED)
        };
        addr.sin_addr.s_addr = ip.to_be();
        addr.sin_port = port.to_be();
        InetAddress { addr }
    }

    /// An endpoint for a dotted-quad IPv4 address, e.g. `"127.0.0.1"`.
    pub fn with_ip_port(ip: &str, port: u16) -> io::Result<InetAddress> {
        Ok(InetAddress {
            addr: sockets_ops::from_ip_port(ip, port)?,
        })
    }

    pub fn from_sockaddr_in(addr: libc::sockaddr_in) -> InetAddress {
        InetAddress { addr }
    }

    pub fn as_sockaddr_in(&self) -> &libc::sockaddr_in {
        &self.addr
    }

    pub fn to_ip(&self) -> String {
        sockets_ops::to_ip(&self.addr)
    }

    pub fn to_ip_port(&self) -> String {
        sockets_ops::to_ip_port(&self.addr)
    }

    pub fn port(&self) -> u16 {
        u16::from_be(self.addr.sin_port)
    }

    pub fn ip_net_endian(&self) -> u32 {
        self.addr.sin_addr.s_addr
    }

    pub fn port_net_endian(&self) -> u16 {
        self.addr.sin_port
    }

    /// Resolves `hostname` to its first IPv4 address via `getaddrinfo(3)`,
    /// leaving `port` and the address family untouched. Thread safe (unlike
    /// the source's `gethostbyname_r` with a thread-local scratch buffer,
    /// `getaddrinfo` needs no such workaround).
    pub fn resolve(hostname: &str, port: u16) -> io::Result<InetAddress> {
        let c_host = CString::new(hostname)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
        hints.ai_family = libc::AF_INET;
        hints.ai_socktype = libc::SOCK_STREAM;

        let mut result: *mut libc::addrinfo = ptr::null_mut();
        let ret = unsafe {
            libc::getaddrinfo(c_host.as_ptr(), ptr::null(), &hints, &mut result)
        };
        if ret != 0 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("InetAddress::resolve: getaddrinfo failed for {}: {}", hostname, ret),
            ));
        }

        // SAFETY: getaddrinfo succeeded, so `result` is a valid, non-null
        // linked list we own and must free with freeaddrinfo.
        let first = unsafe { &*result };
        let mut addr: libc::sockaddr_in = unsafe {
            ptr::read(first.ai_addr as *const libc::sockaddr_in)
        };
        addr.sin_port = port.to_be();

        unsafe { libc::freeaddrinfo(result) };
        Ok(InetAddress { addr })
    }
}

impl fmt::Debug for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InetAddress").field(&self.to_ip_port()).finish()
    }
}

impl fmt::Display for InetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_ip_port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_only_binds_127_0_0_1() {
        let addr = InetAddress::new(2007, true);
        assert_eq!(addr.to_ip(), "127.0.0.1");
        assert_eq!(addr.port(), 2007);
    }

    #[test]
    fn wildcard_binds_0_0_0_0() {
        let addr = InetAddress::new(80, false);
        assert_eq!(addr.to_ip(), "0.0.0.0");
    }

    #[test]
    fn with_ip_port_round_trips_through_to_ip_port() {
        let addr = InetAddress::with_ip_port("192.168.1.1", 8080).unwrap();
        assert_eq!(addr.to_ip_port(), "192.168.1.1:8080");
    }

    #[test]
    fn resolve_localhost() {
        let addr = InetAddress::resolve("localhost", 9).unwrap();
        assert_eq!(addr.to_ip(), "127.0.0.1");
        assert_eq!(addr.port(), 9);
    }
}
