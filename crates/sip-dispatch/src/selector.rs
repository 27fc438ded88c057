//! The transport selector: orchestrates DNS resolution, source-address
//! discovery, registry lookup, Via/Contact rewrite, encoding and the handoff
//! to the chosen transport.
//!
//! Each outbound message runs a linear pipeline:
//!
//! ```text
//! Routing -> SourceResolving -> TransportBinding -> HeaderRewrite
//!         -> Encoding -> Sent | Failed
//! ```
//!
//! Its only asynchronous suspension point is DNS resolution, which is always
//! delivered off the caller's frame (see [`crate::dns`]); source discovery is
//! a bounded synchronous kernel lookup.
//!
//! Anything that prevents a single message from being sent is converted, at
//! the outer boundary of [`transmit`](TransportSelector::transmit), into a
//! failure notification on the transaction layer's inbound queue. That queue
//! is the only error channel back to the transaction layer; no error type
//! crosses it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dns::{DnsFacade, DnsHandler, DnsResolver, DnsResult};
use crate::error::{Error, Result};
use crate::message::{SipMessage, TargetUri, TransactionId};
use crate::registry::TransportRegistry;
use crate::source::SourceAddressResolver;
use crate::transport::{
    PollResult, PollSet, TlsSettings, Transport, TransportBuild, TransportFactory,
};
use crate::tuple::{IpVersion, NetworkTuple, TransportProtocol};

/// Scheduling model, fixed at engine construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    /// All transports are serviced from one external poll loop via
    /// `build_poll_set`/`process`.
    Cooperative,
    /// Each transport self-services on its own task, started at
    /// registration; the engine's fan-out entry points become no-ops.
    Threaded,
}

/// Notification pushed onto the transaction layer's inbound queue.
///
/// `failed = true` is the synthesized failure for a message the engine could
/// not send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchNotice {
    pub transaction_id: TransactionId,
    pub failed: bool,
}

/// External security collaborator computing Identity header signatures.
pub trait IdentitySigner: Send + Sync {
    fn compute_identity(
        &self,
        domain: &str,
        canonical: &str,
    ) -> std::result::Result<String, crate::error::IdentityError>;
}

/// Parameters for [`TransportSelector::add_transport`].
#[derive(Debug, Clone)]
pub struct AddTransport {
    pub protocol: TransportProtocol,
    pub port: u16,
    pub version: IpVersion,
    /// Specific interface to bind, or `None` for any-interface.
    pub interface: Option<std::net::IpAddr>,
    /// SIP domain for TLS/DTLS transports.
    pub sip_domain: Option<String>,
    pub tls: Option<TlsSettings>,
}

/// The transport selection and dispatch engine.
pub struct TransportSelector {
    registry: TransportRegistry,
    source: SourceAddressResolver,
    dns: DnsFacade,
    factory: Arc<dyn TransportFactory>,
    signer: Option<Arc<dyn IdentitySigner>>,
    tx_queue: mpsc::Sender<DispatchNotice>,
    mode: ServiceMode,
}

impl TransportSelector {
    pub fn new(
        mode: ServiceMode,
        resolver: Arc<dyn DnsResolver>,
        factory: Arc<dyn TransportFactory>,
        tx_queue: mpsc::Sender<DispatchNotice>,
    ) -> Self {
        TransportSelector {
            registry: TransportRegistry::new(),
            source: SourceAddressResolver::new(),
            dns: DnsFacade::new(resolver, mode),
            factory,
            signer: None,
            tx_queue,
            mode,
        }
    }

    pub fn with_identity_signer(mut self, signer: Arc<dyn IdentitySigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn mode(&self) -> ServiceMode {
        self.mode
    }

    pub fn registry(&self) -> &TransportRegistry {
        &self.registry
    }

    /// Phase one of DNS resolution: allocate a pending handle bound to
    /// `handler`. No I/O.
    pub fn create_dns_result(&self, handler: Arc<dyn DnsHandler>) -> Arc<DnsResult> {
        self.dns.create_result(handler)
    }

    /// Phase two: determine the effective target of `message` and resolve it
    /// into `handle`. Completion arrives through the handler, never inline.
    ///
    /// Target precedence: an already-set forced target wins (ACK/CANCEL and
    /// redirects); else the top Route's URI, which is also recorded as the
    /// forced target so a retry keeps it; else the Request-URI. Responses
    /// must arrive here with a forced target already set.
    pub fn dns_resolve(&self, handle: &Arc<DnsResult>, message: &mut dyn SipMessage) -> Result<()> {
        let target = self.effective_target(message);
        debug!(target = %target, tx = %message.transaction_id(), "resolving message target");
        self.dns.resolve(handle, target)
    }

    fn effective_target(&self, message: &mut dyn SipMessage) -> TargetUri {
        if let Some(target) = message.force_target() {
            return target;
        }
        assert!(
            message.is_request(),
            "dns_resolve on a response requires a forced target"
        );
        if let Some(route) = message.top_route() {
            // Record the Route as the forced target so a retry after failure
            // does not fall back to the Request-URI.
            message.set_force_target(route.clone());
            return route;
        }
        message
            .request_uri()
            .expect("request without a Request-URI")
    }

    /// Selects a transport for `message`, rewrites its top Via and hostless
    /// Contacts, encodes it and hands it to the transport.
    ///
    /// Never returns an error: a failure is synthesized onto the transaction
    /// inbound queue instead, carrying the message's transaction id.
    pub async fn transmit(&self, message: &mut dyn SipMessage, destination: &mut NetworkTuple) {
        let transaction_id = message.transaction_id();
        match self.try_transmit(message, destination).await {
            Ok(()) => {
                debug!(tx = %transaction_id, %destination, "message dispatched");
            }
            Err(e) => {
                warn!(tx = %transaction_id, %destination, error = %e, "dispatch failed");
                self.notify_failure(transaction_id).await;
            }
        }
    }

    async fn try_transmit(
        &self,
        message: &mut dyn SipMessage,
        destination: &mut NetworkTuple,
    ) -> Result<()> {
        let transaction_id = message.transaction_id();

        let (transport, source) = if message.is_request() {
            self.route_request(message, destination)?
        } else {
            self.route_response(destination)?
        };

        destination.bind_transport(&transport);

        if message.is_request() {
            self.rewrite_via(message, &transport, &source);
        }
        self.fill_contacts(message, &transport, &source);
        self.apply_identity(message);

        let bytes = message.encode();
        message.set_encoded(bytes.clone());
        transport.send(destination, bytes, &transaction_id).await
    }

    /// Request routing: source first (so a specifically-bound interface wins
    /// the transport lookup), then transport by domain (TLS/DTLS) or by the
    /// source tuple.
    fn route_request(
        &self,
        message: &mut dyn SipMessage,
        destination: &NetworkTuple,
    ) -> Result<(Arc<dyn Transport>, NetworkTuple)> {
        let (hint, hint_port) = match message.top_via() {
            Some(via) => (via.sent_host_addr(), via.sent_port.unwrap_or(0)),
            None => (None, 0),
        };
        let source = self.source.resolve(destination, hint, hint_port)?;

        let transport = if let Some(bound) = destination.transport() {
            bound
        } else if destination.protocol().is_secure() {
            let domain = message.tls_domain().unwrap_or_default();
            self.registry
                .find_by_domain(&domain)
                .ok_or_else(|| Error::NoRoute {
                    destination: destination.clone(),
                })?
        } else {
            self.registry
                .find(&source)
                .ok_or_else(|| Error::NoRoute {
                    destination: destination.clone(),
                })?
        };
        Ok((transport, source))
    }

    /// Response routing: the transport must already be bound on the
    /// destination tuple, carried over from the transaction that received the
    /// request. Only an any-interface binding needs per-destination source
    /// discovery.
    fn route_response(
        &self,
        destination: &NetworkTuple,
    ) -> Result<(Arc<dyn Transport>, NetworkTuple)> {
        assert!(
            destination.has_transport(),
            "response destination without a bound transport"
        );
        let transport = destination.transport().ok_or(Error::TransportClosed)?;

        let local = transport.local_tuple();
        let source = if local.is_any_interface() {
            self.source.resolve(destination, None, local.port())?
        } else {
            local
        };
        Ok((transport, source))
    }

    /// Fills still-empty fields of the top Via from the chosen transport and
    /// discovered source. Values the application set are never overwritten.
    /// The `maddr` parameter is always stripped.
    fn rewrite_via(
        &self,
        message: &mut dyn SipMessage,
        transport: &Arc<dyn Transport>,
        source: &NetworkTuple,
    ) {
        let local_port = transport.local_tuple().port();
        let protocol = transport.protocol();
        if let Some(via) = message.top_via_mut() {
            via.maddr = None;
            if via.protocol.is_none() {
                via.protocol = Some(protocol);
            }
            if !via.has_sent_host() {
                via.sent_host = Some(source.addr().to_string());
            }
            if !via.has_sent_port() {
                let port = if source.port() != 0 {
                    source.port()
                } else {
                    local_port
                };
                via.sent_port = Some(port);
            }
        }
    }

    /// Completes hostless Contact headers with the discovered source. For
    /// requests over non-UDP transports the transport parameter is made
    /// explicit.
    fn fill_contacts(
        &self,
        message: &mut dyn SipMessage,
        transport: &Arc<dyn Transport>,
        source: &NetworkTuple,
    ) {
        let is_request = message.is_request();
        let protocol = transport.protocol();
        let port = if source.port() != 0 {
            source.port()
        } else {
            transport.local_tuple().port()
        };
        let host = source.addr().to_string();
        for contact in message.contacts_mut().iter_mut() {
            if !contact.is_hostless() {
                continue;
            }
            contact.host = Some(host.clone());
            contact.port = Some(port);
            if is_request && protocol.needs_transport_param() {
                contact.transport_param = Some(protocol);
            }
        }
    }

    /// Computes the Identity signature through the external security
    /// collaborator. Failure is non-fatal: the identity header is removed and
    /// the send continues.
    fn apply_identity(&self, message: &mut dyn SipMessage) {
        if !message.has_identity() {
            return;
        }
        let Some(domain) = message.from_domain() else {
            message.remove_identity();
            return;
        };
        match &self.signer {
            Some(signer) => {
                message.ensure_date();
                let canonical = message.identity_canonical_string();
                match signer.compute_identity(&domain, &canonical) {
                    Ok(signature) => message.set_identity_signature(signature),
                    Err(e) => {
                        warn!(domain = %domain, error = %e, "identity computation failed");
                        message.remove_identity();
                    }
                }
            }
            None => message.remove_identity(),
        }
    }

    /// Resends the exact bytes of a previous `transmit` through the exact
    /// transport it chose. Never re-encodes, never re-resolves headers.
    ///
    /// Calling this before a successful `transmit` bound the tuple and stored
    /// the encoded image is a programming error and panics.
    pub async fn retransmit(&self, message: &dyn SipMessage, destination: &NetworkTuple) {
        let transport = destination
            .transport()
            .expect("retransmit before transmit: no transport bound to destination");
        let bytes = message
            .encoded()
            .expect("retransmit before transmit: message has no encoded bytes");
        let transaction_id = message.transaction_id();
        if let Err(e) = transport.send(destination, bytes, &transaction_id).await {
            warn!(tx = %transaction_id, %destination, error = %e, "retransmission failed");
            self.notify_failure(transaction_id).await;
        }
    }

    async fn notify_failure(&self, transaction_id: TransactionId) {
        let notice = DispatchNotice {
            transaction_id,
            failed: true,
        };
        if self.tx_queue.send(notice).await.is_err() {
            warn!("transaction inbound queue closed; dropping failure notice");
        }
    }

    /// Constructs, registers and (in threaded mode) starts a transport.
    ///
    /// Returns `false` with a logged diagnostic on any failure — invalid
    /// port, duplicate key, factory/bind error — so the caller can try
    /// alternate parameters. Nothing is thrown across this boundary.
    pub async fn add_transport(&self, params: AddTransport) -> bool {
        if params.port == 0 {
            warn!(protocol = %params.protocol, "rejecting transport with port 0");
            return false;
        }

        let build = TransportBuild {
            protocol: params.protocol,
            version: params.version,
            interface: params.interface,
            port: params.port,
            tls: params.tls,
        };
        let tuple = build.bind_tuple();

        if self
            .registry
            .would_conflict(&tuple, params.sip_domain.as_deref())
        {
            warn!(%tuple, "transport already registered for this tuple");
            return false;
        }

        let transport = match self.factory.build(&build).await {
            Ok(t) => t,
            Err(e) => {
                warn!(%tuple, error = %e, "transport construction failed");
                return false;
            }
        };

        match self
            .registry
            .register(&tuple, params.sip_domain.clone(), transport.clone())
        {
            Ok(_) => {}
            Err(e) => {
                warn!(%tuple, error = %e, "transport registration failed");
                transport.shutdown();
                return false;
            }
        }

        if self.mode == ServiceMode::Threaded {
            let runner = transport.clone();
            tokio::spawn(async move {
                runner.run().await;
            });
        }

        info!(%tuple, domain = ?params.sip_domain, "transport added");
        true
    }

    /// Fan-out service pass: every transport once, then the DNS facade.
    /// No-op in threaded mode, where transports self-service.
    pub fn process(&self, poll: &PollResult) {
        if self.mode == ServiceMode::Threaded {
            return;
        }
        self.registry.process(poll);
        self.dns.process(poll);
    }

    /// Gathers readiness interest from every transport and the DNS facade.
    /// No-op in threaded mode.
    pub fn build_poll_set(&self, poll: &mut PollSet) {
        if self.mode == ServiceMode::Threaded {
            return;
        }
        self.registry.build_poll_set(poll);
        self.dns.build_poll_set(poll);
    }

    /// Whether any transport has output queued. No-op (false) in threaded
    /// mode.
    pub fn has_pending_output(&self) -> bool {
        if self.mode == ServiceMode::Threaded {
            return false;
        }
        self.registry.has_pending_output()
    }

    /// Total bytes queued for the wire across all transports. Operational
    /// metric, available in both modes.
    pub fn sum_pending_output(&self) -> usize {
        self.registry.pending_output_bytes()
    }

    pub fn shutdown(&self) {
        info!("shutting down transport selector");
        self.registry.shutdown();
    }

    pub fn is_finished(&self) -> bool {
        self.registry.is_finished() && !self.dns.has_queued_completions()
    }
}
