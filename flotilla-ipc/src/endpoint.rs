//! `tcp://host:port` endpoint strings

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::IpcError;

pub const TCP_SCHEME: &str = "tcp://";

/// Network address of an RPC server
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }

    /// `host:port`, suitable for `TcpStream::connect`
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", TCP_SCHEME, self.authority())
    }
}

impl FromStr for Endpoint {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IpcError::InvalidEndpoint(s.to_string());
        let rest = s.strip_prefix(TCP_SCHEME).ok_or_else(invalid)?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Endpoint::new(host, port))
    }
}

/// Parse every endpoint string, failing on the first malformed one
pub fn parse_endpoints<S: AsRef<str>>(endpoints: &[S]) -> Result<Vec<Endpoint>, IpcError> {
    endpoints.iter().map(|e| e.as_ref().parse()).collect()
}

/// Endpoints under which a listener bound to `bound` can be reached.
///
/// When `advertise_host` is set it is used as is. Otherwise a listener bound
/// to a specific address is advertised under that address, and a wildcard
/// listener under every non-loopback address the local host name resolves
/// to, falling back to 127.0.0.1.
pub fn advertised_endpoints(bound: SocketAddr, advertise_host: Option<&str>) -> Vec<Endpoint> {
    let port = bound.port();
    if let Some(host) = advertise_host {
        return vec![Endpoint::new(host, port)];
    }
    if !bound.ip().is_unspecified() {
        return vec![Endpoint::new(bound.ip().to_string(), port)];
    }

    let mut hosts: Vec<IpAddr> = local_addresses()
        .into_iter()
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified())
        .filter(|ip| ip.is_ipv4() == bound.is_ipv4())
        .collect();
    hosts.sort();
    hosts.dedup();

    if hosts.is_empty() {
        log::debug!("No non-loopback address found, advertising 127.0.0.1");
        return vec![Endpoint::new("127.0.0.1", port)];
    }
    hosts
        .into_iter()
        .map(|ip| Endpoint::new(ip.to_string(), port))
        .collect()
}

fn local_addresses() -> Vec<IpAddr> {
    use std::net::ToSocketAddrs;

    let name = match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            log::debug!("Could not read host name: {}", e);
            return Vec::new();
        }
    };
    match (name.as_str(), 0).to_socket_addrs() {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(e) => {
            log::debug!("Could not resolve host name '{}': {}", name, e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let endpoint: Endpoint = "tcp://10.0.0.1:50321".parse().unwrap();
        assert_eq!(endpoint, Endpoint::new("10.0.0.1", 50321));
        assert_eq!(endpoint.to_string(), "tcp://10.0.0.1:50321");
        assert_eq!(endpoint.authority(), "10.0.0.1:50321");
    }

    #[test]
    fn test_parse_ipv6() {
        let endpoint: Endpoint = "tcp://[::1]:4000".parse().unwrap();
        assert_eq!(endpoint.host, "::1");
        assert_eq!(endpoint.authority(), "[::1]:4000");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["10.0.0.1:5000", "udp://host:1", "tcp://host", "tcp://:80", "tcp://host:99999"] {
            assert!(bad.parse::<Endpoint>().is_err(), "{} should not parse", bad);
        }
    }

    #[test]
    fn test_advertised_endpoints() {
        let specific: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(
            advertised_endpoints(specific, None),
            vec![Endpoint::new("127.0.0.1", 4000)]
        );

        let wildcard: SocketAddr = "0.0.0.0:4000".parse().unwrap();
        assert_eq!(
            advertised_endpoints(wildcard, Some("node-7")),
            vec![Endpoint::new("node-7", 4000)]
        );

        let found = advertised_endpoints(wildcard, None);
        assert!(!found.is_empty());
        assert!(found.iter().all(|e| e.port == 4000));
    }
}
