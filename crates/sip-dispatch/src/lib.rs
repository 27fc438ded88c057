//! Transport selection and dispatch engine for the sipline SIP stack.
//!
//! For every outbound SIP message this crate decides which concrete transport
//! (UDP/TCP/TLS/DTLS) carries it, resolves the destination (including
//! asynchronous DNS), discovers the correct local source address for NAT- and
//! multihomed-host correctness, rewrites the top Via and hostless Contact
//! headers to reflect the choice, and hands the encoded bytes to the
//! transport. Send failures surface as synthesized notifications on the
//! transaction layer's inbound queue, never as errors across that boundary.
//!
//! Concrete socket transports, the SIP grammar and the transaction state
//! machines live in sibling crates; this crate consumes them through the
//! [`Transport`], [`SipMessage`] and [`DnsResolver`] seams.

pub mod dns;
pub mod error;
pub mod message;
pub mod registry;
pub mod selector;
pub mod source;
pub mod transport;
pub mod tuple;

pub use dns::{DnsFacade, DnsHandler, DnsResolver, DnsResult, DNS_WAKE_TOKEN};
pub use error::{Error, IdentityError, Result};
pub use message::{ContactFields, SipMessage, TargetUri, TransactionId, UriScheme, ViaFields};
pub use registry::{TransportId, TransportRegistry};
pub use selector::{AddTransport, DispatchNotice, IdentitySigner, ServiceMode, TransportSelector};
pub use source::SourceAddressResolver;
pub use transport::{
    PollEntry, PollResult, PollSet, Readiness, TlsMode, TlsSettings, Transport, TransportBuild,
    TransportFactory,
};
pub use tuple::{IpVersion, NetworkTuple, TransportProtocol, TupleKey, ANY_PORT};

/// Re-export of common types for easier use.
pub mod prelude {
    pub use crate::{
        AddTransport, DispatchNotice, DnsHandler, DnsResolver, DnsResult, Error, NetworkTuple,
        PollResult, PollSet, Result, ServiceMode, SipMessage, TargetUri, TransactionId, Transport,
        TransportFactory, TransportProtocol, TransportRegistry, TransportSelector,
    };
}
