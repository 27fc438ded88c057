//! Network tuples: the address descriptors used both as live transport
//! bindings and as registry lookup keys.
//!
//! A tuple is (address family, address, port, protocol) plus an optional weak
//! back-reference to the transport it was bound by. Wildcard variants — the
//! unspecified address for "any interface", port 0 for "any port" — are used
//! only as matching categories during lookup, never as literal socket values.
//!
//! IPv6 canonicalization falls out of representing addresses as
//! [`std::net::IpAddr`]: textually distinct spellings of the same address
//! (`::0:1` vs `::1`, mixed case hex) parse to the same value, so equality and
//! hashing are semantic by construction.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};

use crate::transport::Transport;

/// Port value acting as the "any port" wildcard during lookup.
pub const ANY_PORT: u16 = 0;

/// The transport protocols a SIP message can be carried over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Tls,
    Dtls,
}

impl TransportProtocol {
    /// TLS and DTLS transports are selected by SIP domain name rather than by
    /// tuple lookup.
    pub fn is_secure(&self) -> bool {
        matches!(self, TransportProtocol::Tls | TransportProtocol::Dtls)
    }

    /// Whether a request sent over this protocol needs an explicit
    /// `;transport=` URI parameter on engine-completed Contact headers.
    pub fn needs_transport_param(&self) -> bool {
        !matches!(self, TransportProtocol::Udp)
    }

    /// The token written into the Via header's transport field.
    pub fn via_token(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Tls => "TLS",
            TransportProtocol::Dtls => "DTLS",
        }
    }

    /// The lowercase token used as a URI `transport` parameter value.
    pub fn uri_param(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "udp",
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::Tls => "tls",
            TransportProtocol::Dtls => "dtls",
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.via_token())
    }
}

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    /// The family's unspecified ("any interface") address.
    pub fn unspecified(&self) -> IpAddr {
        match self {
            IpVersion::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpVersion::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// An address + port + protocol descriptor.
///
/// Equality and hashing cover family, address, port and protocol only; the
/// bound-transport back-reference never participates in identity.
#[derive(Clone)]
pub struct NetworkTuple {
    addr: IpAddr,
    port: u16,
    protocol: TransportProtocol,
    transport: Option<Weak<dyn Transport>>,
}

impl NetworkTuple {
    pub fn new(addr: IpAddr, port: u16, protocol: TransportProtocol) -> Self {
        NetworkTuple {
            addr,
            port,
            protocol,
            transport: None,
        }
    }

    /// Builds a tuple bound to the family's any-interface address.
    pub fn any_interface(version: IpVersion, port: u16, protocol: TransportProtocol) -> Self {
        NetworkTuple::new(version.unspecified(), port, protocol)
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.protocol
    }

    pub fn version(&self) -> IpVersion {
        match self.addr {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    /// True when this tuple describes an any-interface (wildcard) binding.
    pub fn is_any_interface(&self) -> bool {
        self.addr.is_unspecified()
    }

    /// True when this tuple carries the any-port lookup wildcard.
    pub fn is_any_port(&self) -> bool {
        self.port == ANY_PORT
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// The transport this tuple was bound to, if it is still alive.
    ///
    /// The reference is weak: a tuple never owns a transport, the registry
    /// does.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.as_ref()?.upgrade()
    }

    /// Whether a transport was ever bound to this tuple.
    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Records the transport chosen for this tuple so a later `retransmit`
    /// reuses it without another lookup.
    pub fn bind_transport(&mut self, transport: &Arc<dyn Transport>) {
        self.transport = Some(Arc::downgrade(transport));
    }

    /// The identity portion of this tuple, used as a registry key.
    pub fn key(&self) -> TupleKey {
        TupleKey {
            addr: self.addr,
            port: self.port,
            protocol: self.protocol,
        }
    }
}

impl PartialEq for NetworkTuple {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.port == other.port && self.protocol == other.protocol
    }
}

impl Eq for NetworkTuple {}

impl Hash for NetworkTuple {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
        self.port.hash(state);
        self.protocol.hash(state);
    }
}

impl fmt::Debug for NetworkTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkTuple")
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("bound", &self.transport.is_some())
            .finish()
    }
}

impl fmt::Display for NetworkTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(a) => write!(f, "{}:{}/{}", a, self.port, self.protocol),
            IpAddr::V6(a) => write!(f, "[{}]:{}/{}", a, self.port, self.protocol),
        }
    }
}

/// Hashable identity of a registered transport: family + address + port +
/// protocol, with the wildcard conventions of [`NetworkTuple`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TupleKey {
    pub addr: IpAddr,
    pub port: u16,
    pub protocol: TransportProtocol,
}

impl fmt::Display for TupleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(a) => write!(f, "{}:{}/{}", a, self.port, self.protocol),
            IpAddr::V6(a) => write!(f, "[{}]:{}/{}", a, self.port, self.protocol),
        }
    }
}

impl Default for NetworkTuple {
    fn default() -> Self {
        NetworkTuple::new(IpVersion::V4.unspecified(), ANY_PORT, TransportProtocol::Udp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp(addr: &str, port: u16) -> NetworkTuple {
        NetworkTuple::new(addr.parse().unwrap(), port, TransportProtocol::Udp)
    }

    #[test]
    fn ipv6_spellings_are_canonical() {
        let long = udp("2001:0db8:0000:0000:0000:0000:0000:0001", 5060);
        let short = udp("2001:db8::1", 5060);
        let upper = udp("2001:DB8::1", 5060);
        assert_eq!(long, short);
        assert_eq!(short, upper);
        assert_eq!(long.key(), short.key());
    }

    #[test]
    fn loopback_spellings_are_canonical() {
        assert_eq!(udp("::0:1", 5060), udp("::1", 5060));
    }

    #[test]
    fn identity_ignores_bound_transport() {
        let a = udp("10.0.0.1", 5060);
        let b = udp("10.0.0.1", 5060);
        assert_eq!(a, b);
        assert!(!a.has_transport());
    }

    #[test]
    fn protocol_distinguishes_tuples() {
        let a = udp("10.0.0.1", 5060);
        let b = NetworkTuple::new("10.0.0.1".parse().unwrap(), 5060, TransportProtocol::Tcp);
        assert_ne!(a, b);
    }

    #[test]
    fn wildcard_predicates() {
        let any = NetworkTuple::any_interface(IpVersion::V4, ANY_PORT, TransportProtocol::Udp);
        assert!(any.is_any_interface());
        assert!(any.is_any_port());
        assert!(!udp("127.0.0.1", 5060).is_any_interface());
        assert!(!udp("127.0.0.1", 5060).is_any_port());
    }
}
