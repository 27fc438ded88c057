//! Two-phase DNS resolution facade.
//!
//! Phase one allocates a [`DnsResult`] handle bound to a completion handler;
//! phase two resolves a target URI into it through the external resolver.
//! A handle may be re-resolved against a new target after completion (redirect
//! following), but a resolution in flight is not restartable.
//!
//! Completion is asynchronous by contract, never delivered inside the caller's
//! stack frame — even when the resolver answers from cache. A synchronous
//! cache hit invoking the handler before the transaction layer finished
//! setting up its state for the send is a known defect class in stacks of
//! this family; here delivery always goes through a spawned task (threaded
//! mode) or the completion queue drained by `process` (cooperative mode).

use std::collections::VecDeque;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use async_trait::async_trait;
use mio::{Interest, Token};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::message::TargetUri;
use crate::selector::ServiceMode;
use crate::transport::{PollResult, PollSet};
use crate::tuple::NetworkTuple;

/// External resolver boundary. SRV/NAPTR/A/AAAA logic lives behind it; the
/// candidates come back already ordered by priority with round-robin applied.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn lookup(&self, target: &TargetUri) -> Result<Vec<NetworkTuple>>;
}

/// Completion callback supplied at handle creation. Invoked exactly once per
/// finished resolution, never inline with `resolve`.
pub trait DnsHandler: Send + Sync {
    fn on_resolved(&self, result: &Arc<DnsResult>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    InFlight,
    Complete,
}

struct ResultState {
    phase: Phase,
    target: Option<TargetUri>,
    candidates: VecDeque<NetworkTuple>,
    failure: Option<String>,
}

/// A pending or completed resolution for one outbound message.
///
/// Owned by the caller (the transaction layer); the facade only writes into
/// it. Dropping the handle is the only cancellation mechanism.
pub struct DnsResult {
    state: Mutex<ResultState>,
    handler: Arc<dyn DnsHandler>,
}

impl DnsResult {
    fn new(handler: Arc<dyn DnsHandler>) -> Arc<Self> {
        Arc::new(DnsResult {
            state: Mutex::new(ResultState {
                phase: Phase::Idle,
                target: None,
                candidates: VecDeque::new(),
                failure: None,
            }),
            handler,
        })
    }

    /// Pops the next candidate in resolver order.
    pub fn next_candidate(&self) -> Option<NetworkTuple> {
        self.state.lock().candidates.pop_front()
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().phase == Phase::Complete
    }

    /// The failure message, when the resolution completed without candidates.
    pub fn failure(&self) -> Option<String> {
        self.state.lock().failure.clone()
    }

    pub fn target(&self) -> Option<TargetUri> {
        self.state.lock().target.clone()
    }

    fn begin(&self, target: TargetUri) -> Result<()> {
        let mut state = self.state.lock();
        if state.phase == Phase::InFlight {
            return Err(Error::ResolutionInProgress);
        }
        state.phase = Phase::InFlight;
        state.target = Some(target);
        state.candidates.clear();
        state.failure = None;
        Ok(())
    }

    fn complete(&self, outcome: Result<Vec<NetworkTuple>>) {
        let mut state = self.state.lock();
        state.phase = Phase::Complete;
        match outcome {
            Ok(candidates) => state.candidates = candidates.into(),
            Err(e) => state.failure = Some(e.to_string()),
        }
    }
}

struct Completion {
    result: Arc<DnsResult>,
}

/// Token under which the facade's wake descriptor appears in the poll set.
pub const DNS_WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// Completions awaiting delivery from `process` (cooperative mode only),
/// shared with the resolution tasks that feed it, plus the wake descriptor
/// that gets a poll-blocked owner out of its OS wait when something lands.
struct CompletionQueue {
    items: Mutex<VecDeque<Completion>>,
    /// Loopback datagram socket connected to itself; one byte per wake-up.
    /// Created on the first `build_poll_set` pass.
    waker: Mutex<Option<Socket>>,
}

impl CompletionQueue {
    fn new() -> Arc<Self> {
        Arc::new(CompletionQueue {
            items: Mutex::new(VecDeque::new()),
            waker: Mutex::new(None),
        })
    }

    fn push(&self, completion: Completion) {
        self.items.lock().push_back(completion);
        self.wake();
    }

    fn wake(&self) {
        if let Some(socket) = self.waker.lock().as_ref() {
            if let Err(e) = socket.send(&[1]) {
                if e.kind() != std::io::ErrorKind::WouldBlock {
                    warn!(error = %e, "failed to signal dns completion");
                }
            }
        }
    }

    /// The wake descriptor, creating it on first use. `None` when the socket
    /// could not be opened; delivery then waits for the owner's next pass.
    fn waker_fd(&self) -> Option<RawFd> {
        let mut slot = self.waker.lock();
        if slot.is_none() {
            match Self::open_waker() {
                Ok(socket) => *slot = Some(socket),
                Err(e) => {
                    warn!(error = %e, "failed to open dns wake socket");
                    return None;
                }
            }
        }
        slot.as_ref().map(|s| s.as_raw_fd())
    }

    fn open_waker() -> std::io::Result<Socket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        let bind = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
        socket.bind(&bind.into())?;
        let local = socket.local_addr()?;
        socket.connect(&local)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    /// Consumes pending wake-up bytes so the descriptor goes quiet until the
    /// next completion.
    fn drain_signal(&self) {
        if let Some(socket) = self.waker.lock().as_ref() {
            let mut buf = [MaybeUninit::<u8>::uninit(); 16];
            while socket.recv(&mut buf).is_ok() {}
        }
    }
}

/// Wraps the external resolver with the two-phase handle protocol and the
/// asynchronous delivery guarantee.
pub struct DnsFacade {
    resolver: Arc<dyn DnsResolver>,
    mode: ServiceMode,
    queued: Arc<CompletionQueue>,
}

impl DnsFacade {
    pub fn new(resolver: Arc<dyn DnsResolver>, mode: ServiceMode) -> Self {
        DnsFacade {
            resolver,
            mode,
            queued: CompletionQueue::new(),
        }
    }

    /// Phase one: allocate a handle. Pure allocation, no I/O.
    pub fn create_result(&self, handler: Arc<dyn DnsHandler>) -> Arc<DnsResult> {
        DnsResult::new(handler)
    }

    /// Phase two: resolve `target` into `handle`.
    ///
    /// Returns an error only for protocol misuse (a resolution already in
    /// flight on this handle); resolver failures are reported through the
    /// handle and its handler like any other completion. The lookup runs on a
    /// spawned task, so the surrounding tokio runtime must be driven for it
    /// to make progress in either mode.
    pub fn resolve(&self, handle: &Arc<DnsResult>, target: TargetUri) -> Result<()> {
        handle.begin(target.clone())?;
        // A completion of the previous resolution that was still waiting for
        // the fan-out pass is superseded; drop it so the handler only ever
        // observes the new resolution.
        self.queued
            .items
            .lock()
            .retain(|c| !Arc::ptr_eq(&c.result, handle));
        debug!(target = %target, "starting dns resolution");

        let resolver = self.resolver.clone();
        let result = handle.clone();

        match self.mode {
            ServiceMode::Threaded => {
                tokio::spawn(async move {
                    let outcome = resolver.lookup(&target).await;
                    if let Err(ref e) = outcome {
                        warn!(target = %target, error = %e, "dns resolution failed");
                    }
                    result.complete(outcome);
                    // Delivered from this task, never the resolver caller's
                    // frame.
                    result.handler.on_resolved(&result);
                });
            }
            ServiceMode::Cooperative => {
                let pending = self.queued.clone();
                tokio::spawn(async move {
                    let outcome = resolver.lookup(&target).await;
                    if let Err(ref e) = outcome {
                        warn!(target = %target, error = %e, "dns resolution failed");
                    }
                    result.complete(outcome);
                    pending.push(Completion { result });
                });
            }
        }
        Ok(())
    }

    /// Delivers queued completions to their handlers. Part of the cooperative
    /// fan-out; a no-op when nothing completed since the last pass.
    pub fn process(&self, _poll: &PollResult) {
        self.queued.drain_signal();
        loop {
            let completion = self.queued.items.lock().pop_front();
            match completion {
                Some(c) => {
                    // A re-resolution may have restarted the handle between
                    // the push and this pass; its completion delivers later.
                    if c.result.is_complete() {
                        c.result.handler.on_resolved(&c.result);
                    } else {
                        debug!("dropping completion superseded by a re-resolution");
                    }
                }
                None => break,
            }
        }
    }

    /// Contributes the wake descriptor under [`DNS_WAKE_TOKEN`] so an owner
    /// blocked in its OS-level wait learns that a completion is ready for
    /// delivery. No-op in threaded mode.
    pub fn build_poll_set(&self, poll: &mut PollSet) {
        if self.mode == ServiceMode::Threaded {
            return;
        }
        if let Some(fd) = self.queued.waker_fd() {
            poll.insert(DNS_WAKE_TOKEN, fd, Interest::READABLE);
        }
    }

    pub fn has_queued_completions(&self) -> bool {
        !self.queued.items.lock().is_empty()
    }
}
