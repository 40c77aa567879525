use crate::error::Error;
use socket2::Domain;
use std::fmt;
use std::net::SocketAddr;

/// An IPv4 listening address: textual ip, port, and socket domain.
///
/// Used only for binding and display; all runtime I/O works on raw
/// descriptors and [`SocketAddr`] values resolved from this.
#[derive(Debug, Clone)]
pub struct Address {
    ip: String,
    port: u16,
    domain: Domain,
}

impl Address {
    /// Creates an IPv4 address from a dotted-quad string and a port.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            domain: Domain::IPV4,
        }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Resolves to a [`SocketAddr`], failing on a malformed ip string.
    pub fn to_socket_addr(&self) -> Result<SocketAddr, Error> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("{}:{}", self.ip, self.port)))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_valid_ipv4() {
        let addr = Address::new("127.0.0.1", 9090);
        let sa = addr.to_socket_addr().expect("valid address");
        assert_eq!(sa.port(), 9090);
        assert!(sa.is_ipv4());
    }

    #[test]
    fn rejects_malformed_ip() {
        let addr = Address::new("not-an-ip", 9090);
        assert!(matches!(
            addr.to_socket_addr(),
            Err(Error::InvalidAddress(_))
        ));
    }
}
