//! IPv4 endpoint type.
//!
//! Grounded on `original_source/InetAddress.cc`: a `(port, dotted-ip)` pair
//! wrapping `sockaddr_in`. In Rust that's `std::net::SocketAddrV4`; this
//! module is a thin, muduo-flavored facade over it so the rest of the crate
//! never has to reach into `std::net` parsing directly.

use std::fmt;
use std::net::{AddrParseError, Ipv4Addr, SocketAddr, SocketAddrV4};

/// An IPv4 `(ip, port)` endpoint.
///
/// This core is IPv4-only by design (spec.md §6); there is no `InetAddr6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InetAddr(SocketAddrV4);

impl InetAddr {
    /// Builds an endpoint from a port and a dotted-quad (or resolvable)
    /// IPv4 string.
    pub fn new(port: u16, ip: &str) -> Result<InetAddr, AddrParseError> {
        let ip: Ipv4Addr = ip.parse()?;
        Ok(InetAddr(SocketAddrV4::new(ip, port)))
    }

    /// The wildcard endpoint `0.0.0.0:port`, used by listeners that accept
    /// on every local interface.
    pub fn any(port: u16) -> InetAddr {
        InetAddr(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
    }

    /// The dotted-quad IPv4 address, without the port.
    pub fn to_ip(&self) -> String {
        self.0.ip().to_string()
    }

    /// `ip:port`.
    pub fn to_ip_port(&self) -> String {
        format!("{}:{}", self.0.ip(), self.0.port())
    }

    /// The port alone.
    pub fn to_port(&self) -> u16 {
        self.0.port()
    }

    pub(crate) fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.0)
    }
}

impl fmt::Display for InetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_ip_port())
    }
}

impl From<SocketAddrV4> for InetAddr {
    fn from(addr: SocketAddrV4) -> InetAddr {
        InetAddr(addr)
    }
}

impl TryFrom<SocketAddr> for InetAddr {
    type Error = SocketAddr;

    fn try_from(addr: SocketAddr) -> Result<InetAddr, SocketAddr> {
        match addr {
            SocketAddr::V4(v4) => Ok(InetAddr(v4)),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ip_port() {
        let addr = InetAddr::new(9981, "127.0.0.1").unwrap();
        assert_eq!(addr.to_ip(), "127.0.0.1");
        assert_eq!(addr.to_port(), 9981);
        assert_eq!(addr.to_ip_port(), "127.0.0.1:9981");
    }

    #[test]
    fn any_binds_wildcard() {
        let addr = InetAddr::any(0);
        assert_eq!(addr.to_ip(), "0.0.0.0");
    }

    #[test]
    fn rejects_malformed_ip() {
        assert!(InetAddr::new(80, "not-an-ip").is_err());
    }

    #[test]
    fn converts_from_socket_addr_v4() {
        let std_addr: SocketAddr = "10.0.0.5:443".parse().unwrap();
        let addr = InetAddr::try_from(std_addr).unwrap();
        assert_eq!(addr.to_ip_port(), "10.0.0.5:443");
    }
}
