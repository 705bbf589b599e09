//! Upstream resolver descriptors.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

const DEFAULT_DNS_PORT: u16 = 53;

/// Transports an upstream accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamScheme {
    Udp,
    Tcp,
    /// UDP first, TCP when the UDP attempt times out.
    TcpUdp,
}

impl UpstreamScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            UpstreamScheme::Udp => "udp",
            UpstreamScheme::Tcp => "tcp",
            UpstreamScheme::TcpUdp => "tcp+udp",
        }
    }
}

/// An immutable resolver descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Upstream {
    pub scheme: UpstreamScheme,
    pub addr: SocketAddr,
}

impl Upstream {
    pub fn new(scheme: UpstreamScheme, addr: SocketAddr) -> Self {
        Self { scheme, addr }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.addr)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseUpstreamError {
    #[error("unsupported upstream scheme `{0}`")]
    Scheme(String),
    #[error("invalid upstream address `{0}`")]
    Address(String),
}

impl FromStr for Upstream {
    type Err = ParseUpstreamError;

    /// Accepts `udp://`, `tcp://` and `tcp+udp://` followed by an IP with an
    /// optional port. Without a scheme, `udp` is assumed.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = match s.split_once("://") {
            Some((scheme, rest)) => {
                let scheme = match scheme.to_ascii_lowercase().as_str() {
                    "udp" => UpstreamScheme::Udp,
                    "tcp" => UpstreamScheme::Tcp,
                    "tcp+udp" | "udp+tcp" => UpstreamScheme::TcpUdp,
                    _ => return Err(ParseUpstreamError::Scheme(scheme.to_string())),
                };
                (scheme, rest)
            }
            None => (UpstreamScheme::Udp, s),
        };

        let addr = parse_addr(rest).ok_or_else(|| ParseUpstreamError::Address(rest.to_string()))?;

        Ok(Self { scheme, addr })
    }
}

fn parse_addr(s: &str) -> Option<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Some(addr);
    }
    let ip = s.trim_start_matches('[').trim_end_matches(']');
    ip.parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, DEFAULT_DNS_PORT))
}
