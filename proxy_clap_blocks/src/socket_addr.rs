//! Config for socket addresses.
use std::{net::ToSocketAddrs, ops::Deref};

/// Parsable socket address, resolving host names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketAddr(std::net::SocketAddr);

impl Deref for SocketAddr {
    type Target = std::net::SocketAddr;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::str::FromStr for SocketAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addrs = s
            .to_socket_addrs()
            .map_err(|e| format!("Cannot parse socket address '{s}': {e}"))?;
        addrs
            .next()
            .map(Self)
            .ok_or_else(|| format!("Found no addresses for '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_socketaddr() {
        let addr = SocketAddr::from_str("0.0.0.0:10201").unwrap();
        assert_eq!(*addr, std::net::SocketAddr::from(([0, 0, 0, 0], 10201)));

        assert_eq!(
            SocketAddr::from_str("no-port").unwrap_err(),
            "Cannot parse socket address 'no-port': invalid socket address",
        );
    }
}
