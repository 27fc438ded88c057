//! Error types for the dispatch engine.
//!
//! Every public operation in this crate returns `Result<T>`. Errors that would
//! prevent a single message from being sent are converted into a transaction
//! queue notification at the outer boundary of `TransportSelector::transmit`;
//! they never cross that boundary as errors.

use std::io;

use thiserror::Error;

use crate::tuple::{NetworkTuple, TransportProtocol, TupleKey};

/// Errors produced by the transport selection and dispatch engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A transport with an identical (interface, port, family, protocol) key
    /// is already registered. Registration-time only; the caller may retry
    /// with different parameters.
    #[error("duplicate transport registration for {key}")]
    DuplicateTransport { key: TupleKey },

    /// A TLS/DTLS transport is already registered for this SIP domain.
    #[error("duplicate transport registration for domain {domain}")]
    DuplicateDomain { domain: String },

    /// Source-address discovery or transport lookup failed for a destination.
    /// Recovered locally inside `transmit` by synthesizing a transaction
    /// failure notification.
    #[error("no route to {destination}")]
    NoRoute { destination: NetworkTuple },

    /// Listener transports must bind an explicit non-zero port.
    #[error("invalid port 0 for {protocol} transport")]
    InvalidPort { protocol: TransportProtocol },

    /// A phase-two resolution was issued on a handle that already has one in
    /// flight. A handle may be reused for a redirect only after the previous
    /// resolution completed.
    #[error("dns resolution already in progress for this handle")]
    ResolutionInProgress,

    /// DNS resolution completed without any usable candidate.
    #[error("dns resolution failed for {target}: {reason}")]
    ResolutionFailed { target: String, reason: String },

    /// The transport refused the send, e.g. because it was shut down.
    #[error("transport closed")]
    TransportClosed,

    /// Per-transport I/O failure, raised during `send` or fan-out `process`.
    /// During fan-out these are caught and logged per transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by the external identity/signature collaborator.
///
/// Always recoverable: the engine removes the identity header and continues.
#[derive(Debug, Error)]
#[error("identity computation failed: {0}")]
pub struct IdentityError(pub String);
