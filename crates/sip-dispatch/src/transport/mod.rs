//! The transport seam: the trait every concrete byte-pusher (UDP, TCP, TLS,
//! DTLS) implements, the poll-set descriptors used in cooperative mode, and
//! the factory `add_transport` delegates construction to.
//!
//! Concrete transports live outside this crate; the engine only consumes this
//! interface and never reaches into a socket itself (the one exception being
//! the scratch sockets of the source-address resolver).

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mio::{Interest, Token};

use crate::error::Result;
use crate::message::TransactionId;
use crate::tuple::{IpVersion, NetworkTuple, TransportProtocol};

/// One file descriptor a transport wants watched, and for what.
#[derive(Debug, Clone, Copy)]
pub struct PollEntry {
    pub token: Token,
    pub fd: RawFd,
    pub interest: Interest,
}

/// Readiness interest gathered from every transport before the owner performs
/// the actual OS-level wait (cooperative mode only).
#[derive(Debug, Default)]
pub struct PollSet {
    entries: Vec<PollEntry>,
}

impl PollSet {
    pub fn new() -> Self {
        PollSet::default()
    }

    pub fn insert(&mut self, token: Token, fd: RawFd, interest: Interest) {
        self.entries.push(PollEntry { token, fd, interest });
    }

    pub fn entries(&self) -> &[PollEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Readiness observed on a descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

/// Outcome of the owner's OS-level wait, handed back to `process` for
/// dispatch to each interested transport.
#[derive(Debug, Default)]
pub struct PollResult {
    ready: HashMap<Token, Readiness>,
}

impl PollResult {
    pub fn new() -> Self {
        PollResult::default()
    }

    pub fn mark(&mut self, token: Token, readiness: Readiness) {
        self.ready.insert(token, readiness);
    }

    pub fn readiness(&self, token: Token) -> Option<Readiness> {
        self.ready.get(&token).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }
}

/// A live, bound SIP transport.
///
/// `send` must be safe to call from any task; in threaded mode the transport's
/// own synchronization covers it. `process`/`build_poll_set` are only invoked
/// in cooperative mode and must not block.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The tuple this transport is bound to. Any-interface bindings report
    /// the unspecified address.
    fn local_tuple(&self) -> NetworkTuple;

    fn protocol(&self) -> TransportProtocol;

    /// Queues or writes the encoded message toward `destination`.
    async fn send(
        &self,
        destination: &NetworkTuple,
        bytes: Bytes,
        transaction_id: &TransactionId,
    ) -> Result<()>;

    /// Services the transport's descriptors after an external poll wait.
    /// Non-blocking. Errors are caught and logged by the registry fan-out.
    fn process(&self, poll: &PollResult) -> Result<()>;

    /// Contributes this transport's readiness interest to the owner's poll.
    fn build_poll_set(&self, poll: &mut PollSet);

    fn has_pending_output(&self) -> bool;

    /// Bytes currently queued for the wire, for operational metrics.
    fn pending_output_bytes(&self) -> usize {
        0
    }

    /// Self-service loop, spawned at registration in threaded mode. Runs
    /// until `shutdown` is requested.
    async fn run(&self) {}

    /// Requests an orderly stop; the transport drains and then reports
    /// finished.
    fn shutdown(&self);

    fn is_finished(&self) -> bool;
}

/// TLS operating mode for secure transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    #[default]
    Standard,
    /// Require and verify a client certificate.
    Mutual,
}

/// TLS/DTLS settings handed through to the factory.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    /// The SIP domain this transport serves; also the domain-index key.
    pub domain: String,
    /// PEM key/certificate material, when not taken from ambient config.
    pub key_material: Option<Bytes>,
    pub mode: TlsMode,
}

/// Everything the factory needs to construct one transport.
#[derive(Debug, Clone)]
pub struct TransportBuild {
    pub protocol: TransportProtocol,
    pub version: IpVersion,
    /// Interface to bind; `None` binds the family's any-interface address.
    pub interface: Option<std::net::IpAddr>,
    pub port: u16,
    pub tls: Option<TlsSettings>,
}

impl TransportBuild {
    /// The tuple this transport will register under.
    pub fn bind_tuple(&self) -> NetworkTuple {
        let addr = self.interface.unwrap_or_else(|| self.version.unspecified());
        NetworkTuple::new(addr, self.port, self.protocol)
    }
}

/// Constructs protocol-specific transports on behalf of `add_transport`.
///
/// Binding the socket happens inside the factory; a bind failure surfaces as
/// an error here and is reported to the administrative caller, never thrown
/// across the engine boundary.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn build(&self, build: &TransportBuild) -> Result<Arc<dyn Transport>>;
}
