//! Source-address discovery.
//!
//! Given a destination, asks the OS which local address it would route from:
//! connect a scratch UDP datagram socket toward the destination (no packet is
//! emitted by a connect), read the socket's assigned local address, then reset
//! the association so the socket can be reused. One scratch socket per address
//! family is kept for the life of the engine.
//!
//! A caller-supplied sent-by hint (the top Via's host, when the application
//! set one) always wins; the resolver never overrides explicit routing.

use std::net::{IpAddr, SocketAddr};

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::tuple::{IpVersion, NetworkTuple};

/// Destination port used for route discovery when the destination tuple
/// carries the any-port wildcard; connect(2) rejects port 0.
const DISCOVERY_FALLBACK_PORT: u16 = 5060;

/// Resolves the local source tuple the stack will present for a destination.
pub struct SourceAddressResolver {
    scratch_v4: Mutex<Option<Socket>>,
    scratch_v6: Mutex<Option<Socket>>,
}

impl SourceAddressResolver {
    pub fn new() -> Self {
        SourceAddressResolver {
            scratch_v4: Mutex::new(None),
            scratch_v6: Mutex::new(None),
        }
    }

    /// Produces the source tuple for `destination`.
    ///
    /// `hint` is an explicit sent-by address already chosen by the
    /// application; when present it is returned unmodified, combined with
    /// `hint_port`. `hint_port` of 0 means "let the stack pick" and is
    /// carried through for the selector to fill from the chosen transport.
    pub fn resolve(
        &self,
        destination: &NetworkTuple,
        hint: Option<IpAddr>,
        hint_port: u16,
    ) -> Result<NetworkTuple> {
        if let Some(addr) = hint {
            trace!(%destination, %addr, "using caller-supplied sent-by hint");
            return Ok(NetworkTuple::new(addr, hint_port, destination.protocol()));
        }

        let local = self.discover(destination)?;
        debug!(%destination, local = %local, "discovered source address");
        Ok(NetworkTuple::new(local, hint_port, destination.protocol()))
    }

    /// Connect-to-discover on the family's scratch socket. Synchronous and
    /// bounded: a kernel routing-table lookup, no network I/O.
    fn discover(&self, destination: &NetworkTuple) -> Result<IpAddr> {
        let guard = match destination.version() {
            IpVersion::V4 => &self.scratch_v4,
            IpVersion::V6 => &self.scratch_v6,
        };
        let mut slot = guard.lock();

        if slot.is_none() {
            let domain = match destination.version() {
                IpVersion::V4 => Domain::IPV4,
                IpVersion::V6 => Domain::IPV6,
            };
            let s = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
                .map_err(|e| self.no_route(destination, &e))?;
            *slot = Some(s);
        }
        let socket = slot.as_ref().ok_or_else(|| Error::NoRoute {
            destination: destination.clone(),
        })?;

        let port = if destination.port() == 0 {
            DISCOVERY_FALLBACK_PORT
        } else {
            destination.port()
        };
        let peer = SocketAddr::new(destination.addr(), port);

        socket
            .connect(&peer.into())
            .map_err(|e| self.no_route(destination, &e))?;

        let local = socket
            .local_addr()
            .map_err(|e| self.no_route(destination, &e))?
            .as_socket()
            .ok_or_else(|| Error::NoRoute {
                destination: destination.clone(),
            })?;

        // Reset the peer association so the socket is clean for the next
        // discovery. Kernels differ on how (and whether) a datagram socket
        // disassociates; a refusal here is harmless because the next connect
        // replaces the association anyway.
        let unspec = SocketAddr::new(destination.version().unspecified(), 0);
        if let Err(e) = socket.connect(&unspec.into()) {
            if e.kind() == std::io::ErrorKind::Unsupported {
                trace!(error = %e, "scratch socket disconnect unsupported");
            } else {
                warn!(error = %e, "failed to reset scratch socket association");
            }
        }

        Ok(local.ip())
    }

    fn no_route(&self, destination: &NetworkTuple, cause: &std::io::Error) -> Error {
        warn!(%destination, error = %cause, "source address discovery failed");
        Error::NoRoute {
            destination: destination.clone(),
        }
    }
}

impl Default for SourceAddressResolver {
    fn default() -> Self {
        SourceAddressResolver::new()
    }
}
