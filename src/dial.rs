//! Dial arguments: how one attempt reaches one upstream.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::ForwardError;
use crate::timeout::is_timeout;
use crate::upstream::{Upstream, UpstreamScheme};

/// Layer 4 protocol of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Proto {
    Udp,
    Tcp,
}

impl L4Proto {
    pub fn as_str(self) -> &'static str {
        match self {
            L4Proto::Udp => "udp",
            L4Proto::Tcp => "tcp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn of(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() { IpVersion::V4 } else { IpVersion::V6 }
    }
}

/// Identifies a from-socket: address family plus the device it is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindKey {
    pub ip_version: IpVersion,
    pub interface: Option<Arc<str>>,
}

impl fmt::Display for BindKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let family = match self.ip_version {
            IpVersion::V4 => "ipv4",
            IpVersion::V6 => "ipv6",
        };
        match &self.interface {
            Some(iface) => write!(f, "{family}%{iface}"),
            None => f.write_str(family),
        }
    }
}

/// Concrete description of one attempt against an upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialArgument {
    pub l4proto: L4Proto,
    pub ip_version: IpVersion,
    pub target: SocketAddr,
    pub bind: BindKey,
}

/// Baseline dial argument for `upstream`.
///
/// `preferred` is honoured only when the scheme permits it: a UDP-only
/// upstream is always dialed over UDP and a TCP-only one over TCP.
pub fn resolve(upstream: &Upstream, preferred: L4Proto, interface: Option<&Arc<str>>) -> DialArgument {
    let l4proto = match upstream.scheme {
        UpstreamScheme::Udp => L4Proto::Udp,
        UpstreamScheme::Tcp => L4Proto::Tcp,
        UpstreamScheme::TcpUdp => preferred,
    };
    let ip_version = IpVersion::of(&upstream.addr);

    DialArgument {
        l4proto,
        ip_version,
        target: upstream.addr,
        bind: BindKey {
            ip_version,
            interface: interface.cloned(),
        },
    }
}

/// The TCP argument to retry with after `err`, if escalation applies.
///
/// Escalation happens only for a `tcp+udp` upstream, from a UDP attempt,
/// after a timeout. A TCP attempt is never escalated further.
pub fn tcp_fallback(
    upstream: &Upstream,
    current: &DialArgument,
    err: &ForwardError,
) -> Option<DialArgument> {
    if upstream.scheme != UpstreamScheme::TcpUdp
        || current.l4proto != L4Proto::Udp
        || !is_timeout(Some(err))
    {
        return None;
    }

    Some(DialArgument {
        l4proto: L4Proto::Tcp,
        ..current.clone()
    })
}
