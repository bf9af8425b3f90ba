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

//! Connection inventory and lifecycle policy.
//!
//! The manager keeps the connection inventory, enforces the min/max
//! connection limits (pruning by keep-alive flag, tag value and age),
//! rate-limits inbound accepts, and runs the auto-dial loop that keeps the
//! node above its minimum connection count.

use crate::{
    bus::{EventBus, Meshp2pEvent},
    connection::{
        dial_queue::{DialOptions, DialQueue, DialTarget, PendingDialInfo, AUTO_DIAL_PRIORITY},
        upgrader::Upgrader,
        Connection,
    },
    error::Error,
    peer_id::PeerId,
    peer_store::{PeerInfo, PeerStore},
    registrar::Registrar,
    transport::InboundRawConnection,
    types::ConnectionId,
};

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::sync::{mpsc::Receiver, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

/// Logging target for the file.
const LOG_TARGET: &str = "meshp2p::connection-manager";

/// Well-known tag exempting a peer from pruning and scheduling reconnection
/// on startup.
pub const KEEP_ALIVE: &str = "keep-alive";

/// Interval between unsolicited auto-dial passes.
const AUTO_DIAL_INTERVAL: Duration = Duration::from_secs(10);

/// Connection limits enforced by the manager.
#[derive(Debug, Clone)]
pub struct ConnectionLimits {
    /// Auto-dial keeps the connection count at or above this.
    pub min_connections: usize,

    /// Pruning keeps the connection count at or below this.
    pub max_connections: usize,

    /// Inbound connections accepted per second before raw accepts are
    /// dropped without upgrade.
    pub inbound_connection_threshold: usize,

    /// Cap on inbound upgrades in flight.
    pub max_incoming_pending_connections: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: 100,
            inbound_connection_threshold: 5,
            max_incoming_pending_connections: 10,
        }
    }
}

impl ConnectionLimits {
    /// Check internal consistency.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_connections < self.min_connections {
            return Err(Error::InvalidParameters(
                "max_connections must be at least min_connections".to_string(),
            ));
        }
        Ok(())
    }
}

/// The connection manager.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionManagerInner>,
}

struct ConnectionManagerInner {
    local_peer: PeerId,
    connections: RwLock<HashMap<PeerId, Vec<Arc<Connection>>>>,
    dial_queue: DialQueue,
    upgrader: Upgrader,
    peer_store: PeerStore,
    registrar: Registrar,
    bus: EventBus,
    limits: ConnectionLimits,
    shutdown: CancellationToken,
    auto_dial_notify: Notify,
    inbound_pending: Arc<Semaphore>,
    accept_times: Mutex<Vec<Instant>>,
}

impl ConnectionManager {
    /// Create a new connection manager.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_peer: PeerId,
        dial_queue: DialQueue,
        upgrader: Upgrader,
        peer_store: PeerStore,
        registrar: Registrar,
        bus: EventBus,
        limits: ConnectionLimits,
        shutdown: CancellationToken,
    ) -> crate::Result<Self> {
        limits.validate()?;
        let inbound_pending = Arc::new(Semaphore::new(limits.max_incoming_pending_connections));

        Ok(Self {
            inner: Arc::new(ConnectionManagerInner {
                local_peer,
                connections: RwLock::new(HashMap::new()),
                dial_queue,
                upgrader,
                peer_store,
                registrar,
                bus,
                limits,
                shutdown,
                auto_dial_notify: Notify::new(),
                inbound_pending,
                accept_times: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Connections to `peer`, or all connections.
    pub fn get_connections(&self, peer: Option<&PeerId>) -> Vec<Arc<Connection>> {
        let connections = self.inner.connections.read();

        match peer {
            Some(peer) => connections.get(peer).cloned().unwrap_or_default(),
            None => connections.values().flatten().cloned().collect(),
        }
    }

    /// Snapshot of the whole inventory.
    pub fn get_connections_map(&self) -> HashMap<PeerId, Vec<Arc<Connection>>> {
        self.inner.connections.read().clone()
    }

    /// Snapshot of the in-flight dials.
    pub fn get_dial_queue(&self) -> Vec<PendingDialInfo> {
        self.inner.dial_queue.pending_dials()
    }

    /// Total connection count.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().values().map(Vec::len).sum()
    }

    /// Open a connection to `target`, reusing an existing one if possible.
    pub async fn open_connection(
        &self,
        target: impl Into<DialTarget>,
        options: DialOptions,
    ) -> crate::Result<Arc<Connection>> {
        let target = target.into();

        if let DialTarget::Peer(peer) = &target {
            if let Some(connection) = self
                .get_connections(Some(peer))
                .into_iter()
                .find(|connection| connection.status() == super::ConnectionStatus::Open)
            {
                return Ok(connection);
            }
        }

        let connection = self.inner.dial_queue.dial(target, options).await?;
        self.add(connection.clone());

        Ok(connection)
    }

    /// Close every connection to `peer`.
    pub async fn close_connections(&self, peer: &PeerId) -> crate::Result<()> {
        for connection in self.get_connections(Some(peer)) {
            connection.close().await?;
        }
        Ok(())
    }

    /// Insert a connection into the inventory and emit the open event.
    ///
    /// Idempotent by connection ID; shared dials hand the same connection to
    /// every caller.
    pub(crate) fn add(&self, connection: Arc<Connection>) {
        {
            let mut connections = self.inner.connections.write();
            let entries = connections.entry(connection.peer()).or_default();

            if entries.iter().any(|existing| existing.id() == connection.id()) {
                return;
            }
            entries.push(connection.clone());
        }

        tracing::debug!(
            target: LOG_TARGET,
            peer = ?connection.peer(),
            connection = %connection.id(),
            total = self.connection_count(),
            "connection added",
        );

        let id = connection.id();
        self.inner.bus.emit(Meshp2pEvent::ConnectionEstablished { connection });

        // The connection whose open is being dispatched is never the one
        // pruned by that same pass.
        self.maybe_prune(Some(id));
    }

    /// Drive connection-close notifications. Runs until shutdown.
    pub(crate) async fn run_close_loop(self, mut closed_rx: Receiver<(PeerId, ConnectionId)>) {
        loop {
            tokio::select! {
                closed = closed_rx.recv() => match closed {
                    Some((peer, connection)) => self.on_connection_closed(peer, connection),
                    None => return,
                },
                _ = self.inner.shutdown.cancelled() => return,
            }
        }
    }

    /// Accept raw inbound connections, applying the accept-rate threshold
    /// and the pending-upgrade cap. Runs until shutdown.
    pub(crate) async fn run_inbound_loop(self, mut inbound_rx: Receiver<InboundRawConnection>) {
        loop {
            let inbound = tokio::select! {
                inbound = inbound_rx.recv() => match inbound {
                    Some(inbound) => inbound,
                    None => return,
                },
                _ = self.inner.shutdown.cancelled() => return,
            };

            if !self.accept_within_rate() {
                tracing::debug!(
                    target: LOG_TARGET,
                    address = ?inbound.remote_address,
                    "inbound accept rate exceeded, dropping connection",
                );
                continue;
            }

            let Ok(permit) = self.inner.inbound_pending.clone().try_acquire_owned() else {
                tracing::debug!(
                    target: LOG_TARGET,
                    address = ?inbound.remote_address,
                    "too many pending inbound upgrades, dropping connection",
                );
                continue;
            };

            let manager = self.clone();
            tokio::spawn(async move {
                let result = manager
                    .inner
                    .upgrader
                    .upgrade_inbound(inbound.io, inbound.remote_address)
                    .await;
                drop(permit);

                match result {
                    Ok(connection) => manager.add(connection),
                    Err(error) => {
                        tracing::debug!(target: LOG_TARGET, ?error, "inbound upgrade failed");
                    }
                }
            });
        }
    }

    /// Keep the connection count above the minimum. Runs until shutdown.
    pub(crate) async fn run_auto_dial_loop(self) {
        let mut interval = tokio::time::interval(AUTO_DIAL_INTERVAL);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.inner.auto_dial_notify.notified() => {}
                _ = self.inner.shutdown.cancelled() => return,
            }

            self.auto_dial_pass().await;
        }
    }

    /// Submit dials for every peer tagged keep-alive.
    pub(crate) fn reconnect_keep_alive_peers(&self) {
        let peers = self.inner.peer_store.all(|info| info.has_tag(KEEP_ALIVE));

        for info in peers {
            tracing::debug!(target: LOG_TARGET, peer = ?info.peer_id, "reconnecting keep-alive peer");

            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(error) = manager
                    .open_connection(
                        info.peer_id,
                        DialOptions { signal: None, priority: AUTO_DIAL_PRIORITY },
                    )
                    .await
                {
                    tracing::debug!(
                        target: LOG_TARGET,
                        peer = ?info.peer_id,
                        ?error,
                        "keep-alive reconnect failed",
                    );
                }
            });
        }
    }

    fn on_connection_closed(&self, peer: PeerId, connection: ConnectionId) {
        let last_for_peer = {
            let mut connections = self.inner.connections.write();

            let remaining = match connections.get_mut(&peer) {
                Some(entries) => {
                    entries.retain(|existing| existing.id() != connection);
                    entries.len()
                }
                None => return,
            };

            if remaining == 0 {
                connections.remove(&peer);
            }
            remaining == 0
        };

        tracing::debug!(target: LOG_TARGET, ?peer, %connection, "connection closed");

        self.inner.registrar.on_connection_closed(connection);
        if last_for_peer {
            self.inner.registrar.on_peer_disconnected(&peer);
        }

        self.inner.bus.emit(Meshp2pEvent::ConnectionClosed { peer, connection });
        self.inner.auto_dial_notify.notify_one();
    }

    /// Sliding one-second accept counter.
    fn accept_within_rate(&self) -> bool {
        let now = Instant::now();
        let mut times = self.inner.accept_times.lock();

        times.retain(|accepted| now.duration_since(*accepted) < Duration::from_secs(1));
        if times.len() >= self.inner.limits.inbound_connection_threshold {
            return false;
        }

        times.push(now);
        true
    }

    /// Close lowest-value connections until the count is back under the
    /// maximum.
    fn maybe_prune(&self, exclude: Option<ConnectionId>) {
        let excess = {
            let connections = self.inner.connections.read();
            let total: usize = connections.values().map(Vec::len).sum();
            total.saturating_sub(self.inner.limits.max_connections)
        };
        if excess == 0 {
            return;
        }

        let mut candidates: Vec<(bool, u32, Instant, Arc<Connection>)> = self
            .get_connections(None)
            .into_iter()
            .filter(|connection| Some(connection.id()) != exclude)
            .map(|connection| {
                let info = self.inner.peer_store.get(&connection.peer()).ok();
                let keep_alive =
                    info.as_ref().map_or(false, |info| info.has_tag(KEEP_ALIVE));
                let tag_sum = info.as_ref().map_or(0, PeerInfo::tag_sum);

                (keep_alive, tag_sum, connection.opened_at(), connection)
            })
            .collect();

        // Keep-alive first, then higher tag sums; older connections survive.
        candidates.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.cmp(&a.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        for (_, _, _, connection) in candidates.iter().rev().take(excess) {
            tracing::debug!(
                target: LOG_TARGET,
                peer = ?connection.peer(),
                connection = %connection.id(),
                "pruning connection over limit",
            );

            let connection = connection.clone();
            tokio::spawn(async move {
                let _ = connection.close().await;
            });
        }
    }

    async fn auto_dial_pass(&self) {
        let inner = &self.inner;
        if inner.limits.min_connections == 0
            || self.connection_count() >= inner.limits.min_connections
        {
            return;
        }

        let connected: Vec<PeerId> = inner.connections.read().keys().copied().collect();

        let mut peers = inner.peer_store.all(|info| {
            info.peer_id != inner.local_peer
                && !info.addresses.is_empty()
                && !connected.contains(&info.peer_id)
                && !inner.dial_queue.has_pending_dial(&info.peer_id)
        });

        // Unbiased shuffle, then a stable sort so equally tagged peers stay
        // in random relative order.
        peers.shuffle(&mut rand::thread_rng());
        peers.sort_by(|a, b| b.tag_sum().cmp(&a.tag_sum()));

        tracing::trace!(
            target: LOG_TARGET,
            candidates = peers.len(),
            connections = self.connection_count(),
            "auto-dial pass",
        );

        for info in peers {
            if self.connection_count() >= inner.limits.min_connections
                || inner.shutdown.is_cancelled()
            {
                break;
            }

            match self
                .open_connection(
                    info.peer_id,
                    DialOptions { signal: None, priority: AUTO_DIAL_PRIORITY },
                )
                .await
            {
                Ok(_) => {}
                Err(error) => {
                    tracing::trace!(
                        target: LOG_TARGET,
                        peer = ?info.peer_id,
                        ?error,
                        "auto-dial failed",
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::{ed25519::Keypair, PublicKey},
        gater::AllowAll,
        mux::{mplex::Mplex, StreamMuxerFactory},
        peer_store::{MemoryDatastore, TagOptions},
        security::plaintext::PlainText,
        transport::{memory::MemoryHub, memory::MemoryTransport, TransportManager},
        types::Direction,
    };

    struct Harness {
        manager: ConnectionManager,
        peer_store: PeerStore,
        bus: EventBus,
        closed_tx: tokio::sync::mpsc::Sender<(PeerId, ConnectionId)>,
        registrar: Registrar,
        next_id: std::sync::atomic::AtomicUsize,
    }

    async fn harness(limits: ConnectionLimits) -> Harness {
        let keypair = Keypair::generate();
        let local_peer = PublicKey::Ed25519(keypair.public()).to_peer_id();
        let bus = EventBus::new(256);
        let peer_store = PeerStore::new(Arc::new(MemoryDatastore::default()), bus.clone())
            .await
            .unwrap();
        let registrar = Registrar::new(local_peer, peer_store.clone(), bus.clone());
        let transports = Arc::new(
            TransportManager::new(vec![
                Arc::new(MemoryTransport::new(MemoryHub::default())) as _
            ])
            .unwrap(),
        );

        let (closed_tx, closed_rx) = tokio::sync::mpsc::channel(256);
        let upgrader = Upgrader::new(
            local_peer,
            vec![Arc::new(PlainText::new(keypair))],
            vec![Arc::new(Mplex)],
            None,
            Arc::new(AllowAll),
            registrar.clone(),
            Duration::from_secs(5),
            closed_tx.clone(),
        )
        .unwrap();

        let dial_queue = DialQueue::new(
            local_peer,
            peer_store.clone(),
            transports,
            upgrader.clone(),
            Arc::new(AllowAll),
            None,
            crate::connection::dial_queue::default_address_sorter(),
            Default::default(),
            CancellationToken::new(),
        );

        let manager = ConnectionManager::new(
            local_peer,
            dial_queue,
            upgrader,
            peer_store.clone(),
            registrar.clone(),
            bus.clone(),
            limits,
            CancellationToken::new(),
        )
        .unwrap();

        tokio::spawn(manager.clone().run_close_loop(closed_rx));

        Harness {
            manager,
            peer_store,
            bus,
            closed_tx,
            registrar,
            next_id: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// A connection over a live muxer whose remote half is kept alive.
    fn test_connection(harness: &Harness, peer: PeerId) -> Arc<Connection> {
        let (local_io, remote_io) = tokio::io::duplex(64 * 1024);
        let (muxer, incoming) = Mplex.create_stream_muxer(Box::new(local_io), Direction::Outbound);
        let (remote_muxer, remote_incoming) =
            Mplex.create_stream_muxer(Box::new(remote_io), Direction::Inbound);
        std::mem::forget((remote_muxer, remote_incoming));

        let id = harness.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        Connection::spawn(
            ConnectionId::from(id),
            peer,
            "/memory/1".parse().unwrap(),
            Direction::Inbound,
            "/plaintext/2.0.0".into(),
            "/mplex/6.7.0".into(),
            false,
            muxer,
            incoming,
            harness.registrar.clone(),
            harness.closed_tx.clone(),
        )
    }

    #[tokio::test]
    async fn limits_are_validated() {
        let limits = ConnectionLimits {
            min_connections: 10,
            max_connections: 5,
            ..Default::default()
        };

        assert!(limits.validate().is_err());
    }

    #[tokio::test]
    async fn add_is_idempotent_per_connection_id() {
        let harness = harness(Default::default()).await;
        let connection = test_connection(&harness, PeerId::random());

        harness.manager.add(connection.clone());
        harness.manager.add(connection);

        assert_eq!(harness.manager.connection_count(), 1);
    }

    #[tokio::test]
    async fn pruning_closes_lowest_tag_sum_first() {
        let harness = harness(ConnectionLimits {
            max_connections: 2,
            ..Default::default()
        })
        .await;

        let peer1 = PeerId::random();
        let peer2 = PeerId::random();
        let peer3 = PeerId::random();

        harness
            .peer_store
            .tag_peer(peer1, "important", TagOptions { value: 80, ttl: None })
            .await
            .unwrap();
        harness
            .peer_store
            .tag_peer(peer2, "slight", TagOptions { value: 10, ttl: None })
            .await
            .unwrap();

        let connection1 = test_connection(&harness, peer1);
        let connection2 = test_connection(&harness, peer2);
        let connection3 = test_connection(&harness, peer3);

        harness.manager.add(connection1.clone());
        harness.manager.add(connection2.clone());
        harness.manager.add(connection3.clone());

        // Pruning closes asynchronously.
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(harness.manager.connection_count(), 2);
        assert!(!harness.manager.get_connections(Some(&peer1)).is_empty());
        // peer3's open triggered the prune, so it is protected; among the
        // rest, peer2 has the lower tag sum.
        assert!(harness.manager.get_connections(Some(&peer2)).is_empty());
        assert!(!harness.manager.get_connections(Some(&peer3)).is_empty());
    }

    #[tokio::test]
    async fn keep_alive_connections_survive_pruning() {
        let harness = harness(ConnectionLimits {
            max_connections: 1,
            ..Default::default()
        })
        .await;

        let keep_alive_peer = PeerId::random();
        let other_peer = PeerId::random();

        harness
            .peer_store
            .tag_peer(keep_alive_peer, KEEP_ALIVE, TagOptions { value: 0, ttl: None })
            .await
            .unwrap();
        harness
            .peer_store
            .tag_peer(other_peer, "valued", TagOptions { value: 100, ttl: None })
            .await
            .unwrap();

        harness.manager.add(test_connection(&harness, keep_alive_peer));
        harness.manager.add(test_connection(&harness, other_peer));

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(harness.manager.connection_count(), 1);
        assert!(!harness.manager.get_connections(Some(&keep_alive_peer)).is_empty());
    }

    #[tokio::test]
    async fn closed_connections_leave_the_inventory_and_emit() {
        let harness = harness(Default::default()).await;
        let peer = PeerId::random();
        let mut events = harness.bus.subscribe();

        let connection = test_connection(&harness, peer);
        harness.manager.add(connection.clone());

        connection.close().await.unwrap();

        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Ok(Meshp2pEvent::ConnectionClosed { peer: closed_peer, .. })) => {
                    assert_eq!(closed_peer, peer);
                    break;
                }
                Ok(Ok(_)) => {}
                other => panic!("connection close event missing: {other:?}"),
            }
        }

        assert_eq!(harness.manager.connection_count(), 0);
    }
}
