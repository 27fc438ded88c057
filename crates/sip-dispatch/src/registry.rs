//! The indexed collection of live transports.
//!
//! Transports are owned once, in an arena, and addressed everywhere else by
//! their arena index. The lookup indices map tuple keys (in the wildcard
//! classes listed below) and TLS/DTLS domain names to that index, so
//! "iterate every transport exactly once" is a plain arena walk regardless of
//! how many indices a transport appears in.
//!
//! Lookup order for TCP/UDP destinations:
//! 1. exact interface + exact port
//! 2. any interface + exact port (only when the requested port is non-zero)
//! 3. exact interface + any port (only when the requested port is zero)
//! 4. any interface + any port (only when the requested port is zero)
//! 5. the protocol's default transport (first registered for that protocol)
//!
//! A transport bound to a specific interface and port is also reachable
//! through class 3 (and an any-interface one through class 4), so a zero-port
//! lookup still prefers the transport on the matching interface over the
//! protocol default. An explicit any-port registration takes the class-3/4
//! slot over these implicit entries.
//!
//! The indices are mutated only at registration and shutdown; steady-state
//! lookups take the read lock.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::transport::{PollResult, PollSet, Transport};
use crate::tuple::{IpVersion, NetworkTuple, TransportProtocol, TupleKey};

/// Stable handle into the registry's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(usize);

/// Any-interface + exact-port index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PortKey {
    version: IpVersion,
    port: u16,
    protocol: TransportProtocol,
}

/// Exact-interface + any-port index key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InterfaceKey {
    addr: IpAddr,
    protocol: TransportProtocol,
}

/// Any-interface + any-port index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FamilyKey {
    version: IpVersion,
    protocol: TransportProtocol,
}

struct Entry {
    transport: Arc<dyn Transport>,
}

#[derive(Default)]
struct Indices {
    /// Arena: exclusive owner of every registered transport.
    arena: Vec<Entry>,
    /// Every registration by its full key; duplicate detection only.
    keys: HashMap<TupleKey, TransportId>,
    exact: HashMap<TupleKey, TransportId>,
    any_interface: HashMap<PortKey, TransportId>,
    any_port: HashMap<InterfaceKey, TransportId>,
    any_any: HashMap<FamilyKey, TransportId>,
    /// TLS/DTLS transports keyed by SIP domain.
    by_domain: HashMap<String, TransportId>,
    /// All TLS/DTLS registrations, for the single-transport "no domain"
    /// convenience default.
    secure: Vec<TransportId>,
    /// First transport registered per protocol, the last-resort fallback.
    defaults: HashMap<TransportProtocol, TransportId>,
}

/// Registry of live transports with the four-tier tuple lookup plus the
/// by-domain TLS/DTLS index.
#[derive(Default)]
pub struct TransportRegistry {
    inner: RwLock<Indices>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        TransportRegistry::default()
    }

    /// Whether a registration under `tuple` (and `domain`, for TLS/DTLS)
    /// would collide with an existing one.
    pub fn would_conflict(&self, tuple: &NetworkTuple, domain: Option<&str>) -> bool {
        let inner = self.inner.read();
        if inner.slot_for(&tuple.key()).is_some() {
            return true;
        }
        if tuple.protocol().is_secure() {
            if let Some(domain) = domain {
                if inner.by_domain.contains_key(domain) {
                    return true;
                }
            }
        }
        false
    }

    /// Registers `transport` under `tuple`, classifying it into the index
    /// matching its wildcard class. TLS/DTLS transports with a domain also
    /// land in the domain index. The first registration for a protocol
    /// becomes that protocol's default.
    pub fn register(
        &self,
        tuple: &NetworkTuple,
        domain: Option<String>,
        transport: Arc<dyn Transport>,
    ) -> Result<TransportId> {
        let mut inner = self.inner.write();
        let key = tuple.key();

        if inner.slot_for(&key).is_some() {
            return Err(Error::DuplicateTransport { key });
        }
        if let Some(domain) = domain.as_deref() {
            if tuple.protocol().is_secure() && inner.by_domain.contains_key(domain) {
                return Err(Error::DuplicateDomain {
                    domain: domain.to_string(),
                });
            }
        }

        let id = TransportId(inner.arena.len());
        inner.arena.push(Entry { transport });
        inner.keys.insert(key, id);

        let interface_key = InterfaceKey {
            addr: tuple.addr(),
            protocol: tuple.protocol(),
        };
        let family_key = FamilyKey {
            version: tuple.version(),
            protocol: tuple.protocol(),
        };
        match (tuple.is_any_interface(), tuple.is_any_port()) {
            (false, false) => {
                inner.exact.insert(key, id);
                // Keep the interface reachable for zero-port lookups; the
                // first transport on an interface claims the slot.
                inner.any_port.entry(interface_key).or_insert(id);
            }
            (true, false) => {
                inner.any_interface.insert(
                    PortKey {
                        version: tuple.version(),
                        port: tuple.port(),
                        protocol: tuple.protocol(),
                    },
                    id,
                );
                inner.any_any.entry(family_key).or_insert(id);
            }
            // Explicit any-port registrations take the slot even over an
            // earlier implicit entry.
            (false, true) => {
                inner.any_port.insert(interface_key, id);
            }
            (true, true) => {
                inner.any_any.insert(family_key, id);
            }
        }

        if tuple.protocol().is_secure() {
            inner.secure.push(id);
            if let Some(domain) = domain {
                inner.by_domain.insert(domain, id);
            }
        }

        inner.defaults.entry(tuple.protocol()).or_insert(id);

        debug!(tuple = %tuple, id = ?id, "registered transport");
        Ok(id)
    }

    /// Resolves a (possibly partial) tuple to a transport for TCP/UDP.
    ///
    /// Returns `None` when nothing matches anywhere; the caller decides
    /// whether that is fatal.
    pub fn find(&self, tuple: &NetworkTuple) -> Option<Arc<dyn Transport>> {
        let inner = self.inner.read();
        let id = if !tuple.is_any_port() {
            inner
                .exact
                .get(&tuple.key())
                .or_else(|| {
                    inner.any_interface.get(&PortKey {
                        version: tuple.version(),
                        port: tuple.port(),
                        protocol: tuple.protocol(),
                    })
                })
                .copied()
        } else {
            inner
                .any_port
                .get(&InterfaceKey {
                    addr: tuple.addr(),
                    protocol: tuple.protocol(),
                })
                .or_else(|| {
                    inner.any_any.get(&FamilyKey {
                        version: tuple.version(),
                        protocol: tuple.protocol(),
                    })
                })
                .copied()
        };
        let id = id.or_else(|| inner.defaults.get(&tuple.protocol()).copied())?;
        Some(inner.arena[id.0].transport.clone())
    }

    /// Resolves a TLS/DTLS transport by SIP domain.
    ///
    /// An empty domain returns the sole secure transport when exactly one is
    /// registered; otherwise the domain must match exactly.
    pub fn find_by_domain(&self, domain: &str) -> Option<Arc<dyn Transport>> {
        let inner = self.inner.read();
        if domain.is_empty() {
            if let [only] = inner.secure.as_slice() {
                return Some(inner.arena[only.0].transport.clone());
            }
            return None;
        }
        let id = inner.by_domain.get(domain).copied()?;
        Some(inner.arena[id.0].transport.clone())
    }

    pub fn get(&self, id: TransportId) -> Option<Arc<dyn Transport>> {
        let inner = self.inner.read();
        inner.arena.get(id.0).map(|e| e.transport.clone())
    }

    /// Snapshot of every registered transport, each exactly once.
    pub fn transports(&self) -> Vec<Arc<dyn Transport>> {
        let inner = self.inner.read();
        inner.arena.iter().map(|e| e.transport.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().arena.is_empty()
    }

    /// Services every transport once. A failure in one transport is logged
    /// and does not prevent the rest of the pass.
    pub fn process(&self, poll: &PollResult) {
        for (idx, transport) in self.transports().into_iter().enumerate() {
            if let Err(e) = transport.process(poll) {
                error!(
                    transport = %transport.local_tuple(),
                    slot = idx,
                    error = %e,
                    "transport process failed"
                );
            }
        }
    }

    pub fn build_poll_set(&self, poll: &mut PollSet) {
        for transport in self.transports() {
            transport.build_poll_set(poll);
        }
    }

    pub fn has_pending_output(&self) -> bool {
        self.transports().iter().any(|t| t.has_pending_output())
    }

    /// Total bytes queued for the wire across all transports.
    pub fn pending_output_bytes(&self) -> usize {
        self.transports()
            .iter()
            .fold(0usize, |acc, t| acc.saturating_add(t.pending_output_bytes()))
    }

    pub fn shutdown(&self) {
        for transport in self.transports() {
            transport.shutdown();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.transports().iter().all(|t| t.is_finished())
    }
}

impl Indices {
    /// The registration already holding this exact key, if any. The lookup
    /// indices cannot answer this: they carry implicit entries for other
    /// keys.
    fn slot_for(&self, key: &TupleKey) -> Option<TransportId> {
        self.keys.get(key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TransactionId;
    use crate::tuple::ANY_PORT;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubTransport {
        local: NetworkTuple,
        processed: AtomicUsize,
        fail_process: bool,
        shut: AtomicBool,
    }

    impl StubTransport {
        fn new(local: NetworkTuple) -> Arc<Self> {
            Arc::new(StubTransport {
                local,
                processed: AtomicUsize::new(0),
                fail_process: false,
                shut: AtomicBool::new(false),
            })
        }

        fn failing(local: NetworkTuple) -> Arc<Self> {
            Arc::new(StubTransport {
                local,
                processed: AtomicUsize::new(0),
                fail_process: true,
                shut: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        fn local_tuple(&self) -> NetworkTuple {
            self.local.clone()
        }

        fn protocol(&self) -> TransportProtocol {
            self.local.protocol()
        }

        async fn send(
            &self,
            _destination: &NetworkTuple,
            _bytes: Bytes,
            _transaction_id: &TransactionId,
        ) -> Result<()> {
            Ok(())
        }

        fn process(&self, _poll: &PollResult) -> Result<()> {
            self.processed.fetch_add(1, Ordering::SeqCst);
            if self.fail_process {
                return Err(Error::Io(io::Error::new(io::ErrorKind::Other, "boom")));
            }
            Ok(())
        }

        fn build_poll_set(&self, _poll: &mut PollSet) {}

        fn has_pending_output(&self) -> bool {
            false
        }

        fn shutdown(&self) {
            self.shut.store(true, Ordering::SeqCst);
        }

        fn is_finished(&self) -> bool {
            self.shut.load(Ordering::SeqCst)
        }
    }

    fn udp(addr: &str, port: u16) -> NetworkTuple {
        NetworkTuple::new(addr.parse().unwrap(), port, TransportProtocol::Udp)
    }

    fn tls(addr: &str, port: u16) -> NetworkTuple {
        NetworkTuple::new(addr.parse().unwrap(), port, TransportProtocol::Tls)
    }

    #[test]
    fn lookup_priority_for_udp() {
        let registry = TransportRegistry::new();
        let exact = StubTransport::new(udp("192.168.1.10", 5060));
        let wildcard = StubTransport::new(udp("0.0.0.0", 5060));
        let fallback = StubTransport::new(udp("0.0.0.0", ANY_PORT));

        // Registration order makes `exact` the UDP default.
        registry
            .register(&exact.local_tuple(), None, exact.clone())
            .unwrap();
        registry
            .register(&wildcard.local_tuple(), None, wildcard.clone())
            .unwrap();
        registry
            .register(&fallback.local_tuple(), None, fallback.clone())
            .unwrap();

        let hit = registry.find(&udp("192.168.1.10", 5060)).unwrap();
        assert_eq!(hit.local_tuple(), exact.local_tuple());

        let hit = registry.find(&udp("192.168.1.99", 5060)).unwrap();
        assert_eq!(hit.local_tuple(), wildcard.local_tuple());

        // Unmatched interface and port falls back to the protocol default.
        let hit = registry.find(&udp("192.168.1.99", 9999)).unwrap();
        assert_eq!(hit.local_tuple(), exact.local_tuple());
    }

    #[test]
    fn zero_port_lookup_uses_any_port_indices() {
        let registry = TransportRegistry::new();
        let per_iface = StubTransport::new(udp("192.168.1.10", ANY_PORT));
        let any_any = StubTransport::new(udp("0.0.0.0", ANY_PORT));

        registry
            .register(&per_iface.local_tuple(), None, per_iface.clone())
            .unwrap();
        registry
            .register(&any_any.local_tuple(), None, any_any.clone())
            .unwrap();

        let hit = registry.find(&udp("192.168.1.10", ANY_PORT)).unwrap();
        assert_eq!(hit.local_tuple(), per_iface.local_tuple());

        let hit = registry.find(&udp("192.168.1.99", ANY_PORT)).unwrap();
        assert_eq!(hit.local_tuple(), any_any.local_tuple());
    }

    #[test]
    fn zero_port_lookup_prefers_matching_interface_over_default() {
        let registry = TransportRegistry::new();
        let first = StubTransport::new(udp("10.0.0.1", 5060));
        let second = StubTransport::new(udp("192.168.1.10", 5060));

        // `first` becomes the UDP default by registration order.
        registry
            .register(&first.local_tuple(), None, first.clone())
            .unwrap();
        registry
            .register(&second.local_tuple(), None, second.clone())
            .unwrap();

        // A lookup carrying no port must still land on the transport bound
        // to the requested interface, not fall through to the default.
        let hit = registry.find(&udp("192.168.1.10", ANY_PORT)).unwrap();
        assert_eq!(hit.local_tuple(), second.local_tuple());

        let hit = registry.find(&udp("10.0.0.1", ANY_PORT)).unwrap();
        assert_eq!(hit.local_tuple(), first.local_tuple());
    }

    #[test]
    fn zero_port_lookup_reaches_any_interface_transport_on_unknown_interface() {
        let registry = TransportRegistry::new();
        let specific = StubTransport::new(udp("10.0.0.1", 5060));
        let wildcard = StubTransport::new(udp("0.0.0.0", 5070));

        registry
            .register(&specific.local_tuple(), None, specific.clone())
            .unwrap();
        registry
            .register(&wildcard.local_tuple(), None, wildcard.clone())
            .unwrap();

        let hit = registry.find(&udp("203.0.113.5", ANY_PORT)).unwrap();
        assert_eq!(hit.local_tuple(), wildcard.local_tuple());
    }

    #[test]
    fn explicit_any_port_registration_wins_the_zero_port_slot() {
        let registry = TransportRegistry::new();
        let bound = StubTransport::new(udp("10.0.0.1", 5060));
        let listener = StubTransport::new(udp("10.0.0.1", ANY_PORT));

        registry
            .register(&bound.local_tuple(), None, bound.clone())
            .unwrap();
        registry
            .register(&listener.local_tuple(), None, listener.clone())
            .unwrap();

        let hit = registry.find(&udp("10.0.0.1", ANY_PORT)).unwrap();
        assert_eq!(hit.local_tuple(), listener.local_tuple());
        // The port-carrying lookup is untouched by the any-port entry.
        let hit = registry.find(&udp("10.0.0.1", 5060)).unwrap();
        assert_eq!(hit.local_tuple(), bound.local_tuple());
    }

    #[test]
    fn duplicate_registration_fails_and_preserves_state() {
        let registry = TransportRegistry::new();
        let first = StubTransport::new(udp("10.0.0.1", 5060));
        let second = StubTransport::new(udp("10.0.0.1", 5060));

        registry
            .register(&first.local_tuple(), None, first.clone())
            .unwrap();
        let err = registry
            .register(&second.local_tuple(), None, second.clone())
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateTransport { .. }));

        assert_eq!(registry.len(), 1);
        let hit = registry.find(&udp("10.0.0.1", 5060)).unwrap();
        assert!(Arc::ptr_eq(
            &hit,
            &(first.clone() as Arc<dyn Transport>)
        ));
    }

    #[test]
    fn domain_lookup_with_single_tls_transport() {
        let registry = TransportRegistry::new();
        let secure = StubTransport::new(tls("10.0.0.1", 5061));
        registry
            .register(&secure.local_tuple(), Some("a.com".into()), secure.clone())
            .unwrap();

        assert!(registry.find_by_domain("a.com").is_some());
        assert!(registry.find_by_domain("").is_some());
        assert!(registry.find_by_domain("b.com").is_none());
    }

    #[test]
    fn empty_domain_is_ambiguous_with_two_tls_transports() {
        let registry = TransportRegistry::new();
        let a = StubTransport::new(tls("10.0.0.1", 5061));
        let b = StubTransport::new(tls("10.0.0.2", 5061));
        registry
            .register(&a.local_tuple(), Some("a.com".into()), a.clone())
            .unwrap();
        registry
            .register(&b.local_tuple(), Some("b.com".into()), b.clone())
            .unwrap();

        assert!(registry.find_by_domain("").is_none());
        assert!(registry.find_by_domain("a.com").is_some());
        assert!(registry.find_by_domain("b.com").is_some());
    }

    #[test]
    fn duplicate_domain_fails() {
        let registry = TransportRegistry::new();
        let a = StubTransport::new(tls("10.0.0.1", 5061));
        let b = StubTransport::new(tls("10.0.0.2", 5061));
        registry
            .register(&a.local_tuple(), Some("a.com".into()), a.clone())
            .unwrap();
        let err = registry
            .register(&b.local_tuple(), Some("a.com".into()), b.clone())
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateDomain { .. }));
    }

    #[test]
    fn fan_out_survives_one_failing_transport() {
        let registry = TransportRegistry::new();
        let bad = StubTransport::failing(udp("10.0.0.1", 5060));
        let good = StubTransport::new(udp("10.0.0.2", 5060));
        registry
            .register(&bad.local_tuple(), None, bad.clone())
            .unwrap();
        registry
            .register(&good.local_tuple(), None, good.clone())
            .unwrap();

        registry.process(&PollResult::new());

        assert_eq!(bad.processed.load(Ordering::SeqCst), 1);
        assert_eq!(good.processed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_match_without_default_returns_none() {
        let registry = TransportRegistry::new();
        let t = StubTransport::new(udp("10.0.0.1", 5060));
        registry.register(&t.local_tuple(), None, t).unwrap();

        // Different protocol has no default registered.
        let tcp = NetworkTuple::new("10.0.0.9".parse().unwrap(), 5060, TransportProtocol::Tcp);
        assert!(registry.find(&tcp).is_none());
    }

    #[test]
    fn shutdown_reaches_every_transport() {
        let registry = TransportRegistry::new();
        let a = StubTransport::new(udp("10.0.0.1", 5060));
        let b = StubTransport::new(udp("0.0.0.0", 5070));
        registry.register(&a.local_tuple(), None, a.clone()).unwrap();
        registry.register(&b.local_tuple(), None, b.clone()).unwrap();

        assert!(!registry.is_finished());
        registry.shutdown();
        assert!(registry.is_finished());
    }
}
