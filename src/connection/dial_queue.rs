// Copyright 2024 meshp2p developers
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Concurrent dial coordinator.
//!
//! A dial resolves its target to candidate addresses, deduplicates against
//! in-flight dials, then races the candidates under two concurrency bounds:
//! a per-peer window and a node-global limit. The first successful upgrade
//! wins and cancels its siblings; concurrent dials for the same peer share
//! one underlying dial and settle together.

use crate::{
    addresses::{ensure_peer_id, is_path_address, peer_id_from_address},
    connection::{upgrader::Upgrader, Connection},
    error::Error,
    gater::ConnectionGater,
    peer_id::PeerId,
    peer_store::PeerStore,
    transport::TransportManager,
};

use futures::{future::Shared, stream::FuturesUnordered, FutureExt, StreamExt};
use multiaddr::{Multiaddr, Protocol};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use trust_dns_resolver::TokioAsyncResolver;

use std::{
    cmp::Ordering,
    collections::BTreeSet,
    net::IpAddr,
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        Arc,
    },
    time::Duration,
};

/// Logging target for the file.
const LOG_TARGET: &str = "meshp2p::dial-queue";

/// Priority assigned to user-initiated dials.
pub const DEFAULT_DIAL_PRIORITY: u8 = 50;

/// Priority assigned to dials submitted by the auto-dial loop.
pub const AUTO_DIAL_PRIORITY: u8 = 0;

/// Target of a dial.
#[derive(Debug, Clone)]
pub enum DialTarget {
    /// A peer whose addresses come from the peer store.
    Peer(PeerId),

    /// A single address.
    Address(Multiaddr),

    /// A list of addresses, all belonging to the same peer if any of them
    /// names one.
    Addresses(Vec<Multiaddr>),
}

impl From<PeerId> for DialTarget {
    fn from(peer: PeerId) -> Self {
        DialTarget::Peer(peer)
    }
}

impl From<Multiaddr> for DialTarget {
    fn from(address: Multiaddr) -> Self {
        DialTarget::Address(address)
    }
}

impl From<Vec<Multiaddr>> for DialTarget {
    fn from(addresses: Vec<Multiaddr>) -> Self {
        DialTarget::Addresses(addresses)
    }
}

/// Options of a single dial call.
#[derive(Debug, Clone, Default)]
pub struct DialOptions {
    /// Abort signal of the caller. Aborting abandons this caller's wait;
    /// other callers sharing the dial keep waiting.
    pub signal: Option<CancellationToken>,

    /// Scheduling priority, recorded for introspection.
    pub priority: u8,
}

/// One candidate address of a dial.
#[derive(Debug, Clone)]
pub struct DialCandidate {
    /// The address.
    pub multiaddr: Multiaddr,

    /// Whether the address came from a verified signed peer record.
    pub is_certified: bool,
}

/// Comparator deciding the order in which candidate addresses are attempted.
pub type AddressSorter = Arc<dyn Fn(&DialCandidate, &DialCandidate) -> Ordering + Send + Sync>;

/// Limits and timeouts of the dial queue.
#[derive(Debug, Clone)]
pub struct DialQueueConfig {
    /// Global cap on concurrently racing transport dials.
    pub max_parallel_dials: usize,

    /// Cap on addresses racing for one peer.
    pub max_concurrent_dials_per_peer: usize,

    /// Cap on candidate addresses per dial.
    pub max_peer_addresses_to_dial: usize,

    /// Overall timeout of one dial.
    pub dial_timeout: Duration,
}

impl Default for DialQueueConfig {
    fn default() -> Self {
        Self {
            max_parallel_dials: 100,
            max_concurrent_dials_per_peer: 10,
            max_peer_addresses_to_dial: 25,
            dial_timeout: Duration::from_secs(10),
        }
    }
}

/// Status of a pending dial.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DialStatus {
    /// Created, not racing yet.
    Queued,

    /// Candidate addresses are racing.
    Active,

    /// A connection was established.
    Success,

    /// Every candidate failed.
    Error,
}

/// Introspection snapshot of one pending dial.
#[derive(Debug, Clone)]
pub struct PendingDialInfo {
    /// Dial ID.
    pub id: u64,

    /// Target peer, if known.
    pub peer: Option<PeerId>,

    /// Candidate addresses in attempt order.
    pub addresses: Vec<Multiaddr>,

    /// Current status.
    pub status: DialStatus,

    /// Priority the dial was submitted at.
    pub priority: u8,
}

type SharedDialFuture = Shared<
    futures::future::BoxFuture<'static, Result<Arc<Connection>, Arc<Error>>>,
>;

struct PendingDialEntry {
    id: u64,
    peer: Option<PeerId>,
    addresses: Vec<Multiaddr>,
    address_key: BTreeSet<String>,
    status: Arc<RwLock<DialStatus>>,
    priority: u8,
    future: SharedDialFuture,
}

/// The dial queue.
#[derive(Clone)]
pub struct DialQueue {
    inner: Arc<DialQueueInner>,
}

struct DialQueueInner {
    local_peer: PeerId,
    peer_store: PeerStore,
    transports: Arc<TransportManager>,
    upgrader: Upgrader,
    gater: Arc<dyn ConnectionGater>,
    resolver: Option<Arc<TokioAsyncResolver>>,
    sorter: AddressSorter,
    config: DialQueueConfig,
    shutdown: CancellationToken,
    global_slots: Arc<Semaphore>,
    pending: Mutex<Vec<PendingDialEntry>>,
    next_dial_id: AtomicU64,
}

impl DialQueue {
    /// Create a new dial queue.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_peer: PeerId,
        peer_store: PeerStore,
        transports: Arc<TransportManager>,
        upgrader: Upgrader,
        gater: Arc<dyn ConnectionGater>,
        resolver: Option<Arc<TokioAsyncResolver>>,
        sorter: AddressSorter,
        config: DialQueueConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let global_slots = Arc::new(Semaphore::new(config.max_parallel_dials));

        Self {
            inner: Arc::new(DialQueueInner {
                local_peer,
                peer_store,
                transports,
                upgrader,
                gater,
                resolver,
                sorter,
                config,
                shutdown,
                global_slots,
                pending: Mutex::new(Vec::new()),
                next_dial_id: AtomicU64::new(0),
            }),
        }
    }

    /// Dial `target`.
    ///
    /// Joins an in-flight dial for the same peer (or the same exact address
    /// set) instead of starting a second one.
    pub async fn dial(
        &self,
        target: impl Into<DialTarget>,
        options: DialOptions,
    ) -> crate::Result<Arc<Connection>> {
        let target = target.into();
        let inner = &self.inner;

        let (peer, candidates) = self.resolve_target(target)?;

        if peer == Some(inner.local_peer) {
            return Err(Error::DialedSelf);
        }

        if let Some(peer) = &peer {
            if inner.gater.deny_dial_peer(peer).await {
                return Err(Error::PeerDialIntercepted(*peer));
            }
        }

        let candidates = self.prepare_addresses(peer, candidates).await?;

        if candidates.iter().any(|candidate| inner.transports.is_listen_address(&candidate.multiaddr))
        {
            return Err(Error::DialedSelf);
        }
        if candidates.is_empty() {
            return Err(Error::NoValidAddresses(peer));
        }

        let shared = self.join_or_create(peer, candidates, options.priority);

        let result = match &options.signal {
            Some(signal) => tokio::select! {
                result = shared => result,
                _ = signal.cancelled() => return Err(Error::Aborted),
            },
            None => shared.await,
        };

        result.map_err(|error| match Arc::try_unwrap(error) {
            Ok(error) => error,
            Err(error) => Error::SharedDial(error),
        })
    }

    /// Snapshot of the in-flight dials.
    pub fn pending_dials(&self) -> Vec<PendingDialInfo> {
        self.inner
            .pending
            .lock()
            .iter()
            .map(|entry| PendingDialInfo {
                id: entry.id,
                peer: entry.peer,
                addresses: entry.addresses.clone(),
                status: *entry.status.read(),
                priority: entry.priority,
            })
            .collect()
    }

    /// Whether a dial for `peer` is currently in flight.
    pub fn has_pending_dial(&self, peer: &PeerId) -> bool {
        self.inner.pending.lock().iter().any(|entry| entry.peer.as_ref() == Some(peer))
    }

    /// Join an existing pending dial or create a new one.
    fn join_or_create(
        &self,
        peer: Option<PeerId>,
        candidates: Vec<DialCandidate>,
        priority: u8,
    ) -> SharedDialFuture {
        let inner = &self.inner;
        let address_key: BTreeSet<String> =
            candidates.iter().map(|candidate| candidate.multiaddr.to_string()).collect();

        let mut pending = inner.pending.lock();

        // Dedup key: the peer id when there is one, the exact address set
        // otherwise.
        let existing = pending.iter().find(|entry| match (&entry.peer, &peer) {
            (Some(existing), Some(target)) => existing == target,
            (None, None) => entry.address_key == address_key,
            _ => false,
        });

        if let Some(entry) = existing {
            tracing::trace!(target: LOG_TARGET, ?peer, dial = entry.id, "joining in-flight dial");
            return entry.future.clone();
        }

        let id = inner.next_dial_id.fetch_add(1, AtomicOrdering::Relaxed);
        let status = Arc::new(RwLock::new(DialStatus::Queued));
        let addresses: Vec<Multiaddr> =
            candidates.iter().map(|candidate| candidate.multiaddr.clone()).collect();

        tracing::debug!(
            target: LOG_TARGET,
            dial = id,
            ?peer,
            addresses = candidates.len(),
            "starting dial",
        );

        let future: SharedDialFuture = {
            let queue = self.clone();
            let status = status.clone();

            async move {
                *status.write() = DialStatus::Active;

                let result = queue.race(peer, candidates).await;

                *status.write() =
                    if result.is_ok() { DialStatus::Success } else { DialStatus::Error };
                queue.inner.pending.lock().retain(|entry| entry.id != id);

                result.map_err(Arc::new)
            }
            .boxed()
            .shared()
        };

        pending.push(PendingDialEntry {
            id,
            peer,
            addresses,
            address_key,
            status,
            priority,
            future: future.clone(),
        });

        // Drive the dial to completion even if every caller stops waiting.
        let driver = future.clone();
        tokio::spawn(async move {
            let _ = driver.await;
        });

        future
    }

    /// Race the candidate addresses under the per-peer and global bounds.
    async fn race(
        &self,
        peer: Option<PeerId>,
        candidates: Vec<DialCandidate>,
    ) -> crate::Result<Arc<Connection>> {
        let inner = &self.inner;
        let cancel = inner.shutdown.child_token();
        let timeout = tokio::time::sleep(inner.config.dial_timeout);
        tokio::pin!(timeout);

        let mut remaining = candidates.into_iter();
        let mut in_flight = FuturesUnordered::new();
        for _ in 0..inner.config.max_concurrent_dials_per_peer.max(1) {
            match remaining.next() {
                Some(candidate) =>
                    in_flight.push(self.attempt(peer, candidate.multiaddr, cancel.child_token())),
                None => break,
            }
        }

        let mut errors: Vec<Arc<Error>> = Vec::new();

        loop {
            tokio::select! {
                attempt = in_flight.next() => match attempt {
                    Some(Ok(connection)) => {
                        // First success wins; cancel the racing siblings.
                        cancel.cancel();
                        return Ok(connection);
                    }
                    Some(Err(error)) => {
                        tracing::trace!(target: LOG_TARGET, ?peer, ?error, "dial attempt failed");
                        errors.push(Arc::new(error));

                        match remaining.next() {
                            Some(candidate) => in_flight.push(self.attempt(
                                peer,
                                candidate.multiaddr,
                                cancel.child_token(),
                            )),
                            None if in_flight.is_empty() => break,
                            None => {}
                        }
                    }
                    None => break,
                },
                _ = &mut timeout => {
                    cancel.cancel();
                    return Err(Error::Timeout);
                }
                _ = inner.shutdown.cancelled() => {
                    cancel.cancel();
                    return Err(Error::Aborted);
                }
            }
        }

        // Surface the unwrapped error when only one address was tried.
        Err(match errors.len() {
            0 => Error::NoValidAddresses(peer),
            1 => match Arc::try_unwrap(errors.pop().expect("length was checked; qed")) {
                Ok(error) => error,
                Err(error) => Error::SharedDial(error),
            },
            _ => Error::DialAggregate(errors),
        })
    }

    /// One transport dial plus upgrade.
    async fn attempt(
        &self,
        peer: Option<PeerId>,
        address: Multiaddr,
        cancel: CancellationToken,
    ) -> crate::Result<Arc<Connection>> {
        let inner = &self.inner;

        let _permit = tokio::select! {
            permit = inner.global_slots.clone().acquire_owned() =>
                permit.map_err(|_| Error::Aborted)?,
            _ = cancel.cancelled() => return Err(Error::Aborted),
        };

        tracing::trace!(target: LOG_TARGET, ?address, "attempting transport dial");

        let result = async {
            let raw = inner.transports.dial(address.clone(), cancel.child_token()).await?;

            tokio::select! {
                upgraded = inner.upgrader.upgrade_outbound(raw, address.clone(), peer) => upgraded,
                _ = cancel.cancelled() => Err(Error::Aborted),
            }
        }
        .await;

        // Cancelled siblings are not dial outcomes.
        if !matches!(result, Err(Error::Aborted)) {
            let outcome_peer = peer.or_else(|| result.as_ref().ok().map(|conn| conn.peer()));
            if let Some(outcome_peer) = outcome_peer {
                let _ = inner
                    .peer_store
                    .record_dial_outcome(outcome_peer, address, result.is_ok())
                    .await;
            }
        }

        result
    }

    fn resolve_target(
        &self,
        target: DialTarget,
    ) -> crate::Result<(Option<PeerId>, Vec<DialCandidate>)> {
        match target {
            DialTarget::Peer(peer) => {
                // An unknown peer is routine here; it surfaces later as
                // no-valid-addresses.
                let candidates = match self.inner.peer_store.get(&peer) {
                    Ok(info) => info
                        .addresses
                        .into_iter()
                        .map(|entry| DialCandidate {
                            multiaddr: entry.multiaddr,
                            is_certified: entry.is_certified,
                        })
                        .collect(),
                    Err(Error::NotFound) => Vec::new(),
                    Err(error) => return Err(error),
                };

                Ok((Some(peer), candidates))
            }
            DialTarget::Address(address) => {
                let peer = peer_id_from_address(&address)?;
                Ok((peer, vec![DialCandidate { multiaddr: address, is_certified: false }]))
            }
            DialTarget::Addresses(addresses) => {
                let mut peer = None;

                for address in &addresses {
                    if let Some(found) = peer_id_from_address(address)? {
                        match peer {
                            None => peer = Some(found),
                            Some(existing) if existing != found =>
                                return Err(Error::InvalidParameters(
                                    "addresses belong to different peers".to_string(),
                                )),
                            Some(_) => {}
                        }
                    }
                }

                Ok((
                    peer,
                    addresses
                        .into_iter()
                        .map(|multiaddr| DialCandidate { multiaddr, is_certified: false })
                        .collect(),
                ))
            }
        }
    }

    /// Expand, filter, deduplicate, gate, suffix and sort candidates.
    async fn prepare_addresses(
        &self,
        peer: Option<PeerId>,
        candidates: Vec<DialCandidate>,
    ) -> crate::Result<Vec<DialCandidate>> {
        let inner = &self.inner;

        let mut expanded: Vec<DialCandidate> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self.resolve_dns(candidate.multiaddr.clone()).await {
                Ok(addresses) => expanded.extend(addresses.into_iter().map(|multiaddr| {
                    DialCandidate { multiaddr, is_certified: candidate.is_certified }
                })),
                Err(error) => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        address = ?candidate.multiaddr,
                        ?error,
                        "dns resolution failed, skipping address",
                    );
                }
            }
        }

        expanded.retain(|candidate| inner.transports.supports(&candidate.multiaddr));

        // Dedup by string form, OR-merging certification.
        let mut merged: Vec<DialCandidate> = Vec::with_capacity(expanded.len());
        for candidate in expanded {
            match merged
                .iter_mut()
                .find(|existing| existing.multiaddr == candidate.multiaddr)
            {
                Some(existing) => existing.is_certified |= candidate.is_certified,
                None => merged.push(candidate),
            }
        }

        if merged.len() > inner.config.max_peer_addresses_to_dial {
            return Err(Error::TooManyAddresses {
                got: merged.len(),
                limit: inner.config.max_peer_addresses_to_dial,
            });
        }

        let mut allowed = Vec::with_capacity(merged.len());
        for candidate in merged {
            if inner.gater.deny_dial_multiaddr(&candidate.multiaddr).await {
                continue;
            }
            if let Some(peer) = &peer {
                if !inner.gater.filter_multiaddr_for_peer(peer, &candidate.multiaddr).await {
                    continue;
                }
            }
            allowed.push(candidate);
        }

        if let Some(peer) = &peer {
            for candidate in &mut allowed {
                if !is_path_address(&candidate.multiaddr) {
                    candidate.multiaddr = ensure_peer_id(candidate.multiaddr.clone(), peer);
                }
            }
        }

        allowed.sort_by(|a, b| (inner.sorter)(a, b));

        Ok(allowed)
    }

    /// Resolve a leading DNS component, keeping the rest of the address.
    async fn resolve_dns(&self, address: Multiaddr) -> crate::Result<Vec<Multiaddr>> {
        let Some(resolver) = &self.inner.resolver else {
            return Ok(vec![address]);
        };

        let (domain, want_v4, want_v6) = match address.iter().next() {
            Some(Protocol::Dns4(domain)) => (domain.to_string(), true, false),
            Some(Protocol::Dns6(domain)) => (domain.to_string(), false, true),
            Some(Protocol::Dns(domain)) => (domain.to_string(), true, true),
            _ => return Ok(vec![address]),
        };

        let resolved = resolver
            .lookup_ip(domain)
            .await
            .map_err(|_| Error::AddressError(crate::error::AddressError::DnsResolutionFailed))?;

        let replacement = resolved.iter().find_map(|ip| match ip {
            IpAddr::V4(ip) if want_v4 => Some(Protocol::Ip4(ip)),
            IpAddr::V6(ip) if want_v6 => Some(Protocol::Ip6(ip)),
            _ => None,
        });

        let Some(replacement) = replacement else {
            return Err(Error::AddressError(crate::error::AddressError::DnsResolutionFailed));
        };

        let mut rewritten = Multiaddr::empty();
        rewritten.push(replacement);
        for protocol in address.iter().skip(1) {
            rewritten.push(protocol);
        }

        Ok(vec![rewritten])
    }
}

/// Default candidate order: certified addresses first, then public before
/// loopback.
pub fn default_address_sorter() -> AddressSorter {
    Arc::new(|a, b| {
        b.is_certified
            .cmp(&a.is_certified)
            .then_with(|| publicness(&b.multiaddr).cmp(&publicness(&a.multiaddr)))
    })
}

fn publicness(address: &Multiaddr) -> u8 {
    match address.iter().next() {
        Some(Protocol::Ip4(ip)) =>
            if ip.is_loopback() {
                0
            } else if ip.is_private() || ip.is_link_local() {
                1
            } else {
                2
            },
        Some(Protocol::Ip6(ip)) =>
            if ip.is_loopback() {
                0
            } else {
                2
            },
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::EventBus,
        crypto::{ed25519::Keypair, PublicKey},
        gater::AllowAll,
        mux::mplex::Mplex,
        peer_store::{AddressUpdate, MemoryDatastore, PeerUpdate},
        registrar::Registrar,
        security::plaintext::PlainText,
        transport::{
            memory::{MemoryHub, MemoryTransport},
            InboundRawConnection, Transport,
        },
    };

    use std::sync::atomic::AtomicUsize;

    /// Transport wrapper counting dial invocations.
    struct CountingTransport {
        inner: MemoryTransport,
        dials: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Transport for CountingTransport {
        fn tag(&self) -> &'static str {
            self.inner.tag()
        }

        fn can_dial(&self, address: &Multiaddr) -> bool {
            self.inner.can_dial(address)
        }

        async fn dial(
            &self,
            address: Multiaddr,
            abort: CancellationToken,
        ) -> crate::Result<Box<dyn crate::transport::RawConnection>> {
            self.dials.fetch_add(1, AtomicOrdering::SeqCst);
            self.inner.dial(address, abort).await
        }

        async fn listen(
            &self,
            address: Multiaddr,
        ) -> crate::Result<Box<dyn crate::transport::TransportListener>> {
            self.inner.listen(address).await
        }
    }

    struct Harness {
        queue: DialQueue,
        peer_store: PeerStore,
        local_peer: PeerId,
        dials: Arc<AtomicUsize>,
    }

    /// Build a dialing node plus a listening remote that upgrades inbound
    /// connections.
    async fn harness(hub: MemoryHub) -> Harness {
        let keypair = Keypair::generate();
        let local_peer = PublicKey::Ed25519(keypair.public()).to_peer_id();
        let bus = EventBus::new(64);
        let peer_store = PeerStore::new(Arc::new(MemoryDatastore::default()), bus.clone())
            .await
            .unwrap();
        let registrar = Registrar::new(local_peer, peer_store.clone(), bus.clone());
        let dials = Arc::new(AtomicUsize::new(0));

        let transports = Arc::new(
            TransportManager::new(vec![Arc::new(CountingTransport {
                inner: MemoryTransport::new(hub),
                dials: dials.clone(),
            }) as _])
            .unwrap(),
        );

        let (closed_tx, _closed_rx) = tokio::sync::mpsc::channel(64);
        let upgrader = Upgrader::new(
            local_peer,
            vec![Arc::new(PlainText::new(keypair))],
            vec![Arc::new(Mplex)],
            None,
            Arc::new(AllowAll),
            registrar,
            Duration::from_secs(5),
            closed_tx,
        )
        .unwrap();

        let queue = DialQueue::new(
            local_peer,
            peer_store.clone(),
            transports,
            upgrader,
            Arc::new(AllowAll),
            None,
            default_address_sorter(),
            DialQueueConfig::default(),
            CancellationToken::new(),
        );

        Harness { queue, peer_store, local_peer, dials }
    }

    /// Spawn a remote node accepting and upgrading memory connections.
    async fn spawn_remote(hub: MemoryHub) -> (PeerId, Multiaddr) {
        let keypair = Keypair::generate();
        let peer = PublicKey::Ed25519(keypair.public()).to_peer_id();
        let bus = EventBus::new(64);
        let peer_store = PeerStore::new(Arc::new(MemoryDatastore::default()), bus.clone())
            .await
            .unwrap();
        let registrar = Registrar::new(peer, peer_store, bus.clone());

        let transports =
            Arc::new(TransportManager::new(vec![Arc::new(MemoryTransport::new(hub)) as _]).unwrap());

        let (closed_tx, _closed_rx) = tokio::sync::mpsc::channel(64);
        let upgrader = Upgrader::new(
            peer,
            vec![Arc::new(PlainText::new(keypair))],
            vec![Arc::new(Mplex)],
            None,
            Arc::new(AllowAll),
            registrar,
            Duration::from_secs(5),
            closed_tx,
        )
        .unwrap();

        let (inbound_tx, mut inbound_rx) = tokio::sync::mpsc::channel::<InboundRawConnection>(16);
        transports
            .listen(
                vec!["/memory/0".parse().unwrap()],
                inbound_tx,
                CancellationToken::new(),
                bus.clone(),
            )
            .await
            .unwrap();

        let mut events = bus.subscribe();
        let address = loop {
            match events.recv().await.unwrap() {
                crate::bus::Meshp2pEvent::ListenerReady { address } => break address,
                _ => {}
            }
        };

        tokio::spawn(async move {
            let mut connections = Vec::new();
            while let Some(inbound) = inbound_rx.recv().await {
                if let Ok(connection) =
                    upgrader.upgrade_inbound(inbound.io, inbound.remote_address).await
                {
                    connections.push(connection);
                }
            }
        });

        (peer, address)
    }

    #[tokio::test]
    async fn dialing_self_is_rejected_and_leaves_no_pending_dial() {
        let harness = harness(MemoryHub::default()).await;

        match harness.queue.dial(harness.local_peer, DialOptions::default()).await {
            Err(error) => assert_eq!(error.code(), "ERR_DIALED_SELF"),
            Ok(_) => panic!("dial to self succeeded"),
        }

        assert!(harness.queue.pending_dials().is_empty());
    }

    #[tokio::test]
    async fn unknown_peer_has_no_valid_addresses() {
        let harness = harness(MemoryHub::default()).await;

        match harness.queue.dial(PeerId::random(), DialOptions::default()).await {
            Err(Error::NoValidAddresses(_)) => {}
            result => panic!("expected no valid addresses, got {:?}", result.is_ok()),
        }
    }

    #[tokio::test]
    async fn dial_by_stored_peer_addresses_succeeds() {
        let hub = MemoryHub::default();
        let harness = harness(hub.clone()).await;
        let (remote_peer, remote_address) = spawn_remote(hub).await;

        harness
            .peer_store
            .merge(
                remote_peer,
                PeerUpdate {
                    multiaddrs: Some(vec![AddressUpdate {
                        multiaddr: remote_address,
                        is_certified: false,
                    }]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let connection =
            harness.queue.dial(remote_peer, DialOptions::default()).await.unwrap();

        assert_eq!(connection.peer(), remote_peer);
        assert!(harness.queue.pending_dials().is_empty());

        // The successful dial is recorded against the address.
        let info = harness.peer_store.get(&remote_peer).unwrap();
        assert!(info.addresses.iter().any(|entry| entry.last_success.is_some()));
    }

    #[tokio::test]
    async fn concurrent_dials_share_one_transport_dial() {
        let hub = MemoryHub::default();
        let harness = harness(hub.clone()).await;
        let (remote_peer, remote_address) = spawn_remote(hub).await;

        harness
            .peer_store
            .merge(
                remote_peer,
                PeerUpdate {
                    multiaddrs: Some(vec![AddressUpdate {
                        multiaddr: remote_address,
                        is_certified: false,
                    }]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut dials = Vec::new();
        for _ in 0..10 {
            let queue = harness.queue.clone();
            dials.push(tokio::spawn(async move {
                queue.dial(remote_peer, DialOptions::default()).await
            }));
        }

        let mut connections = Vec::new();
        for dial in dials {
            connections.push(dial.await.unwrap().unwrap());
        }

        // All callers resolved with the same connection.
        let first = connections[0].id();
        assert!(connections.iter().all(|connection| connection.id() == first));
        assert_eq!(harness.dials.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_single_address_dial_surfaces_the_transport_error() {
        let harness = harness(MemoryHub::default()).await;

        // No listener bound on this address.
        let result = harness
            .queue
            .dial("/memory/99".parse::<Multiaddr>().unwrap(), DialOptions::default())
            .await;

        match result {
            Err(error) => assert_eq!(error.code(), "ERR_TRANSPORT_DIAL_FAILED"),
            Ok(_) => panic!("dial unexpectedly succeeded"),
        }
    }

    #[tokio::test]
    async fn caller_abort_signal_abandons_the_wait() {
        let hub = MemoryHub::default();
        let harness = harness(hub.clone()).await;

        // A listener that accepts the transport connection but never runs
        // the upgrade, so the dial hangs until its timeout.
        let silent = MemoryTransport::new(hub);
        let _listener = silent.listen("/memory/77".parse().unwrap()).await.unwrap();

        let signal = CancellationToken::new();
        let queue = harness.queue.clone();
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move {
                queue
                    .dial(
                        "/memory/77".parse::<Multiaddr>().unwrap(),
                        DialOptions { signal: Some(signal), priority: DEFAULT_DIAL_PRIORITY },
                    )
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        signal.cancel();

        match waiter.await.unwrap() {
            Err(Error::Aborted) => {}
            result => panic!("expected aborted, got {:?}", result.is_ok()),
        }
    }

    #[tokio::test]
    async fn too_many_addresses_are_rejected() {
        let hub = MemoryHub::default();
        let harness = harness(hub).await;
        let peer = PeerId::random();

        let addresses: Vec<AddressUpdate> = (0..40u64)
            .map(|port| AddressUpdate {
                multiaddr: format!("/memory/{}", 1000 + port).parse().unwrap(),
                is_certified: false,
            })
            .collect();

        harness
            .peer_store
            .merge(peer, PeerUpdate { multiaddrs: Some(addresses), ..Default::default() })
            .await
            .unwrap();

        match harness.queue.dial(peer, DialOptions::default()).await {
            Err(Error::TooManyAddresses { got: 40, limit: 25 }) => {}
            result => panic!("expected too many addresses, got {:?}", result.is_ok()),
        }
    }

    #[test]
    fn default_sorter_prefers_certified_then_public() {
        let sorter = default_address_sorter();

        let certified_loopback = DialCandidate {
            multiaddr: "/ip4/127.0.0.1/tcp/1".parse().unwrap(),
            is_certified: true,
        };
        let public = DialCandidate {
            multiaddr: "/ip4/203.0.113.5/tcp/1".parse().unwrap(),
            is_certified: false,
        };
        let loopback = DialCandidate {
            multiaddr: "/ip4/127.0.0.1/tcp/2".parse().unwrap(),
            is_certified: false,
        };

        let mut candidates = vec![loopback, public, certified_loopback];
        candidates.sort_by(|a, b| sorter(a, b));

        assert!(candidates[0].is_certified);
        assert_eq!(candidates[1].multiaddr.to_string(), "/ip4/203.0.113.5/tcp/1");
    }
}
