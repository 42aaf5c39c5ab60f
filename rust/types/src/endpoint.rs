use std::net::UdpSocket;

use serde::{Deserialize, Serialize};

/// How a node chooses the address it binds and advertises.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum HostMode {
    /// The local address holding the default route (discovered via
    /// [`local_ip`]).
    Public,
    /// Loopback only.
    Local,
    /// An explicit address or hostname.
    Explicit(String),
}

impl HostMode {
    /// Parse the CLI form: `public`, `local`, or a literal address.
    pub fn parse(s: &str) -> HostMode {
        match s {
            "public" => HostMode::Public,
            "local" => HostMode::Local,
            other => HostMode::Explicit(other.to_string()),
        }
    }

    pub fn resolve(&self) -> String {
        match self {
            HostMode::Public => local_ip(),
            HostMode::Local => "127.0.0.1".to_string(),
            HostMode::Explicit(addr) => addr.clone(),
        }
    }
}

impl Default for HostMode {
    fn default() -> Self {
        HostMode::Public
    }
}

/// A resolved (host, port) pair a peer can be reached at.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// The gossip URI form used in bootstrap lists and the connection pool.
    pub fn uri(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Get the local IP address with the default route.
///
/// Connects a UDP socket to an address in a reserved range (192.88.99.0/24)
/// and reads back the chosen source address.  No packet is ever sent.  Falls
/// back to loopback when the route cannot be determined.
pub fn local_ip() -> String {
    fn discover() -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("192.88.99.254:420")?;
        Ok(socket.local_addr()?.ip().to_string())
    }
    discover().unwrap_or_else(|_| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_mode_parsing() {
        assert_eq!(HostMode::parse("public"), HostMode::Public);
        assert_eq!(HostMode::parse("local"), HostMode::Local);
        assert_eq!(
            HostMode::parse("10.1.2.3"),
            HostMode::Explicit("10.1.2.3".to_string())
        );
        assert_eq!(HostMode::Local.resolve(), "127.0.0.1");
    }

    #[test]
    fn endpoint_uri() {
        let ep = Endpoint::new("10.0.0.1", 42042);
        assert_eq!(ep.uri(), "tcp://10.0.0.1:42042");
    }

    #[test]
    fn local_ip_is_parseable() {
        let ip = local_ip();
        assert!(ip.parse::<std::net::IpAddr>().is_ok());
    }
}
