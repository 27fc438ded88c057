//! Engine-side boundary to the external SIP message object model.
//!
//! The full header grammar lives in the stack's core crate; this engine only
//! needs a narrow view of a message: routing targets, the mutable fields of
//! the top Via and of hostless Contacts, the identity hooks, and the encoded
//! byte image. [`SipMessage`] captures exactly that view so the engine can be
//! exercised against the real message type or a test double.

use std::fmt;
use std::net::IpAddr;

use bytes::Bytes;

use crate::tuple::TransportProtocol;

/// Identifier tying a message to its transaction, carried back to the
/// transaction layer on both delivery and synthesized failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(pub String);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        TransactionId(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriScheme {
    Sip,
    Sips,
}

/// The routing-relevant portion of a SIP or SIPS URI: enough for the DNS
/// facade to produce candidate tuples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUri {
    pub scheme: UriScheme,
    pub host: String,
    pub port: Option<u16>,
    /// Explicit `;transport=` parameter, when present.
    pub protocol: Option<TransportProtocol>,
}

impl fmt::Display for TargetUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            UriScheme::Sip => "sip",
            UriScheme::Sips => "sips",
        };
        write!(f, "{}:{}", scheme, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(protocol) = self.protocol {
            write!(f, ";transport={}", protocol.uri_param())?;
        }
        Ok(())
    }
}

/// The mutable fields of the top-most Via header.
///
/// `None` (or port 0) means "empty, fill in at send time". The engine never
/// overwrites a field the application already set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViaFields {
    pub protocol: Option<TransportProtocol>,
    pub sent_host: Option<String>,
    pub sent_port: Option<u16>,
    pub maddr: Option<String>,
}

impl ViaFields {
    /// The sent-by host as an IP address, when the application set one that
    /// parses as such. Hostname hints are kept verbatim in the header but
    /// cannot drive a registry lookup.
    pub fn sent_host_addr(&self) -> Option<IpAddr> {
        self.sent_host.as_deref().and_then(|h| h.parse().ok())
    }

    pub fn has_sent_host(&self) -> bool {
        self.sent_host.as_deref().is_some_and(|h| !h.is_empty())
    }

    pub fn has_sent_port(&self) -> bool {
        self.sent_port.is_some_and(|p| p != 0)
    }
}

/// A Contact header as the engine sees it: possibly hostless, to be completed
/// with the discovered source at send time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactFields {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub transport_param: Option<TransportProtocol>,
}

impl ContactFields {
    pub fn is_hostless(&self) -> bool {
        self.host.as_deref().map_or(true, |h| h.is_empty())
    }
}

/// The engine's view of an outbound SIP message.
///
/// Implemented by the stack's message type; tests provide a mock. All header
/// mutation the engine performs goes through this trait, and the encoded byte
/// image stored via [`set_encoded`](SipMessage::set_encoded) is what
/// `retransmit` replays untouched.
pub trait SipMessage: Send {
    fn is_request(&self) -> bool;

    fn is_response(&self) -> bool {
        !self.is_request()
    }

    fn transaction_id(&self) -> TransactionId;

    /// Explicit next-hop override, set for ACK/CANCEL reuse and redirects.
    fn force_target(&self) -> Option<TargetUri>;
    fn set_force_target(&mut self, target: TargetUri);

    /// The URI of the top Route header, if any.
    fn top_route(&self) -> Option<TargetUri>;

    /// The Request-URI. Meaningless for responses.
    fn request_uri(&self) -> Option<TargetUri>;

    fn top_via(&self) -> Option<&ViaFields>;
    fn top_via_mut(&mut self) -> Option<&mut ViaFields>;

    fn contacts_mut(&mut self) -> &mut Vec<ContactFields>;

    /// The SIP domain used to select a TLS/DTLS transport for this message.
    fn tls_domain(&self) -> Option<String>;

    /// Whether the message carries an Identity header awaiting a signature.
    fn has_identity(&self) -> bool {
        false
    }

    /// Domain of the From header, used as the identity signing domain.
    fn from_domain(&self) -> Option<String> {
        None
    }

    /// Adds a Date header if missing; the identity canonical string covers it.
    fn ensure_date(&mut self) {}

    /// The canonical string the identity signature is computed over.
    fn identity_canonical_string(&self) -> String {
        String::new()
    }

    fn set_identity_signature(&mut self, _signature: String) {}

    fn remove_identity(&mut self) {}

    /// Serializes the message, reflecting all header mutation done so far.
    fn encode(&self) -> Bytes;

    /// Byte image stored by the last `transmit`, replayed by `retransmit`.
    fn encoded(&self) -> Option<Bytes>;
    fn set_encoded(&mut self, bytes: Bytes);
    fn clear_encoded(&mut self);
}
