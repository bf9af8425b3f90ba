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

//! Per-protocol handler and topology registry.
//!
//! The registrar demultiplexes newly opened inbound streams to registered
//! handlers, enforces per-protocol stream caps in both directions and
//! notifies topology subscribers as peers gain or lose protocol support.
//! Only weak counts are kept here; streams are owned by their handlers.

use crate::{
    bus::{EventBus, Meshp2pEvent},
    connection::{Connection, Stream},
    error::Error,
    multistream,
    peer_id::PeerId,
    peer_store::{PeerStore, PeerUpdate},
    types::{protocol::ProtocolName, ConnectionId, Direction},
};

use futures::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::RwLock;

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

/// Logging target for the file.
const LOG_TARGET: &str = "meshp2p::registrar";

/// Inbound stream cap applied when a registration does not set one.
const DEFAULT_MAX_INBOUND_STREAMS: usize = 32;

/// Outbound stream cap applied when a protocol is not registered or its
/// registration does not set one.
const DEFAULT_MAX_OUTBOUND_STREAMS: usize = 64;

/// Callback invoked with each accepted inbound stream.
pub type StreamHandler =
    Arc<dyn Fn(Stream, Arc<Connection>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Options of a protocol registration.
#[derive(Debug, Clone)]
pub struct StreamHandlerOptions {
    /// Cap on concurrently open inbound streams per connection.
    pub max_inbound_streams: usize,

    /// Cap on concurrently open outbound streams per connection.
    pub max_outbound_streams: usize,

    /// Whether the protocol may run over data/duration-limited connections.
    pub run_on_transient_connection: bool,
}

impl Default for StreamHandlerOptions {
    fn default() -> Self {
        Self {
            max_inbound_streams: DEFAULT_MAX_INBOUND_STREAMS,
            max_outbound_streams: DEFAULT_MAX_OUTBOUND_STREAMS,
            run_on_transient_connection: false,
        }
    }
}

/// Subscription for connect/disconnect notifications of peers supporting a
/// protocol.
pub trait Topology: Send + Sync {
    /// A peer supporting the protocol gained a connection, or a connected
    /// peer was discovered to support it.
    fn on_connect(&self, peer: PeerId, connection: &Arc<Connection>);

    /// The peer lost its last stream or connection for the protocol.
    fn on_disconnect(&self, peer: PeerId);

    /// Whether to notify for transient connections.
    fn notify_on_transient(&self) -> bool {
        false
    }
}

struct HandlerEntry {
    handler: StreamHandler,
    options: StreamHandlerOptions,
}

struct RegistrarInner {
    local_peer: PeerId,
    handlers: RwLock<HashMap<ProtocolName, HandlerEntry>>,
    topologies: RwLock<IndexMap<u64, (ProtocolName, Arc<dyn Topology>)>>,
    next_topology_id: AtomicU64,

    /// Live stream counts per (connection, protocol, direction).
    counts: RwLock<HashMap<(ConnectionId, ProtocolName, Direction), usize>>,

    /// Protocol sets identify reported per peer, for delta notifications.
    peer_protocols: RwLock<HashMap<PeerId, HashSet<ProtocolName>>>,

    peer_store: PeerStore,
    bus: EventBus,
}

/// The registrar.
#[derive(Clone)]
pub struct Registrar {
    inner: Arc<RegistrarInner>,
}

impl Registrar {
    /// Create a new registrar.
    pub fn new(local_peer: PeerId, peer_store: PeerStore, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(RegistrarInner {
                local_peer,
                handlers: RwLock::new(HashMap::new()),
                topologies: RwLock::new(IndexMap::new()),
                next_topology_id: AtomicU64::new(0),
                counts: RwLock::new(HashMap::new()),
                peer_protocols: RwLock::new(HashMap::new()),
                peer_store,
                bus,
            }),
        }
    }

    /// Register or replace the handler for `protocol`.
    ///
    /// Triggers a self-update so connected peers learn about the new
    /// protocol through identify push.
    pub async fn handle(
        &self,
        protocol: ProtocolName,
        handler: StreamHandler,
        options: StreamHandlerOptions,
    ) -> crate::Result<()> {
        tracing::debug!(target: LOG_TARGET, %protocol, "register protocol handler");

        self.inner.handlers.write().insert(protocol, HandlerEntry { handler, options });
        self.publish_protocols().await
    }

    /// Remove the handler for `protocol`. Idempotent.
    pub async fn unhandle(&self, protocol: &ProtocolName) -> crate::Result<()> {
        let removed = self.inner.handlers.write().remove(protocol).is_some();
        if !removed {
            return Ok(());
        }

        tracing::debug!(target: LOG_TARGET, %protocol, "unregister protocol handler");
        self.publish_protocols().await
    }

    /// Subscribe a topology to `protocol`. Returns the subscription ID.
    pub fn register(&self, protocol: ProtocolName, topology: Arc<dyn Topology>) -> u64 {
        let id = self.inner.next_topology_id.fetch_add(1, Ordering::Relaxed);
        self.inner.topologies.write().insert(id, (protocol, topology));
        id
    }

    /// Remove a topology subscription. Idempotent.
    pub fn unregister(&self, id: u64) {
        self.inner.topologies.write().shift_remove(&id);
    }

    /// Currently supported protocols, sorted and deduplicated.
    pub fn get_protocols(&self) -> Vec<ProtocolName> {
        let mut protocols: Vec<ProtocolName> =
            self.inner.handlers.read().keys().cloned().collect();
        protocols.sort();
        protocols.dedup();
        protocols
    }

    /// Negotiate and dispatch one inbound stream.
    pub(crate) async fn dispatch_inbound(
        &self,
        connection: Arc<Connection>,
        muxed: crate::mux::MuxedStream,
    ) {
        let supported = self.get_protocols();

        let (io, protocol) = match multistream::listener_select(muxed, &supported).await {
            Ok(negotiated) => negotiated,
            Err(error) => {
                tracing::trace!(
                    target: LOG_TARGET,
                    peer = ?connection.peer(),
                    ?error,
                    "inbound stream negotiation failed",
                );
                return;
            }
        };

        let (handler, options) = match self.inner.handlers.read().get(&protocol) {
            Some(entry) => (entry.handler.clone(), entry.options.clone()),
            // Raced with unhandle.
            None => {
                let mut io = io;
                io.reset();
                return;
            }
        };

        if connection.transient() && !options.run_on_transient_connection {
            tracing::trace!(
                target: LOG_TARGET,
                %protocol,
                "dropping inbound stream on transient connection",
            );
            let mut io = io;
            io.reset();
            return;
        }

        let reservation = match self.try_reserve(
            &connection,
            protocol.clone(),
            Direction::Inbound,
            options.max_inbound_streams,
        ) {
            Some(reservation) => reservation,
            None => {
                tracing::debug!(
                    target: LOG_TARGET,
                    peer = ?connection.peer(),
                    %protocol,
                    error = %Error::TooManyInboundStreams(protocol.clone()),
                    "resetting inbound stream",
                );
                let mut io = io;
                io.reset();
                return;
            }
        };

        let stream = Stream::new(io, protocol, Direction::Inbound, reservation, &connection);
        tokio::spawn(handler(stream, connection));
    }

    /// Reserve an outbound stream slot, called when a stream is opened
    /// through the connection.
    pub(crate) fn reserve_outbound(
        &self,
        connection: &Arc<Connection>,
        protocol: ProtocolName,
    ) -> crate::Result<StreamReservation> {
        let options = self
            .inner
            .handlers
            .read()
            .get(&protocol)
            .map(|entry| entry.options.clone())
            .unwrap_or_default();

        if connection.transient() && !options.run_on_transient_connection {
            return Err(Error::TransientConnection(protocol));
        }

        self.try_reserve(
            connection,
            protocol.clone(),
            Direction::Outbound,
            options.max_outbound_streams,
        )
        .ok_or(Error::TooManyOutboundStreams(protocol))
    }

    /// Identify reported an updated protocol set for `peer`; notify
    /// topologies for the delta.
    pub(crate) fn on_peer_protocols_updated(
        &self,
        peer: PeerId,
        protocols: &[ProtocolName],
        connection: &Arc<Connection>,
    ) {
        let current: HashSet<ProtocolName> = protocols.iter().cloned().collect();
        let previous = self
            .inner
            .peer_protocols
            .write()
            .insert(peer, current.clone())
            .unwrap_or_default();

        let added: Vec<_> = current.difference(&previous).cloned().collect();
        let removed: Vec<_> = previous.difference(&current).cloned().collect();
        if added.is_empty() && removed.is_empty() {
            return;
        }

        let topologies: Vec<(ProtocolName, Arc<dyn Topology>)> =
            self.inner.topologies.read().values().cloned().collect();

        for (protocol, topology) in topologies {
            if added.contains(&protocol) {
                if !connection.transient() || topology.notify_on_transient() {
                    topology.on_connect(peer, connection);
                }
            } else if removed.contains(&protocol) {
                topology.on_disconnect(peer);
            }
        }
    }

    /// The last connection to `peer` closed.
    pub(crate) fn on_peer_disconnected(&self, peer: &PeerId) {
        let Some(protocols) = self.inner.peer_protocols.write().remove(peer) else {
            return;
        };

        let topologies: Vec<(ProtocolName, Arc<dyn Topology>)> =
            self.inner.topologies.read().values().cloned().collect();

        for (protocol, topology) in topologies {
            if protocols.contains(&protocol) {
                topology.on_disconnect(*peer);
            }
        }
    }

    /// Forget all counts of a closed connection.
    pub(crate) fn on_connection_closed(&self, connection: ConnectionId) {
        self.inner.counts.write().retain(|(id, _, _), _| *id != connection);
    }

    fn try_reserve(
        &self,
        connection: &Arc<Connection>,
        protocol: ProtocolName,
        direction: Direction,
        max: usize,
    ) -> Option<StreamReservation> {
        {
            let mut counts = self.inner.counts.write();
            let count = counts.entry((connection.id(), protocol.clone(), direction)).or_insert(0);
            if *count >= max {
                return None;
            }
            *count += 1;
        }

        Some(StreamReservation {
            registrar: self.clone(),
            connection: connection.id(),
            connection_ref: Arc::downgrade(connection),
            peer: connection.peer(),
            protocol,
            direction,
        })
    }

    fn release(&self, reservation: &StreamReservation) {
        let no_streams_left = {
            let mut counts = self.inner.counts.write();
            let key = (
                reservation.connection,
                reservation.protocol.clone(),
                reservation.direction,
            );

            if let Some(count) = counts.get_mut(&key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    counts.remove(&key);
                }
            }

            let other = (
                reservation.connection,
                reservation.protocol.clone(),
                opposite(reservation.direction),
            );
            // The peer must have no stream left for this protocol on this
            // connection in either direction.
            !counts.contains_key(&key) && !counts.contains_key(&other)
        };

        if no_streams_left {
            let topologies: Vec<(ProtocolName, Arc<dyn Topology>)> =
                self.inner.topologies.read().values().cloned().collect();

            for (protocol, topology) in topologies {
                if protocol == reservation.protocol {
                    topology.on_disconnect(reservation.peer);
                }
            }
        }
    }

    /// Publish the current protocol set into the self peer-store entry.
    async fn publish_protocols(&self) -> crate::Result<()> {
        let protocols = self.get_protocols();

        let info = self
            .inner
            .peer_store
            .patch(
                self.inner.local_peer,
                PeerUpdate { protocols: Some(protocols), ..Default::default() },
            )
            .await?;

        self.inner.bus.emit(Meshp2pEvent::LocalPeerUpdated { peer: Arc::new(info) });
        Ok(())
    }
}

fn opposite(direction: Direction) -> Direction {
    match direction {
        Direction::Inbound => Direction::Outbound,
        Direction::Outbound => Direction::Inbound,
    }
}

/// Weak accounting of one live stream; releasing it decrements the counts
/// and fires topology disconnects when the last stream of a protocol ends.
pub(crate) struct StreamReservation {
    registrar: Registrar,
    connection: ConnectionId,
    connection_ref: Weak<Connection>,
    peer: PeerId,
    protocol: ProtocolName,
    direction: Direction,
}

impl StreamReservation {
    pub(crate) fn connection_ref(&self) -> Weak<Connection> {
        self.connection_ref.clone()
    }
}

impl Drop for StreamReservation {
    fn drop(&mut self) {
        self.registrar.release(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mux::{mplex::Mplex, StreamMuxerFactory},
        peer_store::MemoryDatastore,
    };

    async fn registrar() -> Registrar {
        let bus = EventBus::new(64);
        let peer_store = PeerStore::new(Arc::new(MemoryDatastore::default()), bus.clone())
            .await
            .unwrap();
        Registrar::new(PeerId::random(), peer_store, bus)
    }

    fn noop_handler() -> StreamHandler {
        Arc::new(|_stream, _connection| Box::pin(async {}))
    }

    /// A connection over a live muxer whose remote half is kept alive.
    fn test_connection(
        registrar: &Registrar,
    ) -> (Arc<Connection>, tokio::sync::mpsc::Receiver<(PeerId, ConnectionId)>) {
        let (local_io, remote_io) = tokio::io::duplex(64 * 1024);
        let (muxer, incoming) = Mplex.create_stream_muxer(Box::new(local_io), Direction::Outbound);
        let (remote_muxer, remote_incoming) =
            Mplex.create_stream_muxer(Box::new(remote_io), Direction::Inbound);
        std::mem::forget((remote_muxer, remote_incoming));

        let (closed_tx, closed_rx) = tokio::sync::mpsc::channel(8);
        let connection = Connection::spawn(
            ConnectionId::from(0),
            PeerId::random(),
            "/memory/1".parse().unwrap(),
            Direction::Outbound,
            "/plaintext/2.0.0".into(),
            "/mplex/6.7.0".into(),
            false,
            muxer,
            incoming,
            registrar.clone(),
            closed_tx,
        );

        (connection, closed_rx)
    }

    #[derive(Default)]
    struct RecordingTopology {
        connects: std::sync::atomic::AtomicUsize,
        disconnects: std::sync::atomic::AtomicUsize,
    }

    impl Topology for RecordingTopology {
        fn on_connect(&self, _: PeerId, _: &Arc<Connection>) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_disconnect(&self, _: PeerId) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn protocols_are_sorted_and_deduplicated() {
        let registrar = registrar().await;

        registrar
            .handle("/b/1.0.0".into(), noop_handler(), Default::default())
            .await
            .unwrap();
        registrar
            .handle("/a/1.0.0".into(), noop_handler(), Default::default())
            .await
            .unwrap();
        // Replacing a handler must not duplicate the protocol.
        registrar
            .handle("/a/1.0.0".into(), noop_handler(), Default::default())
            .await
            .unwrap();

        assert_eq!(
            registrar.get_protocols(),
            vec![ProtocolName::from("/a/1.0.0"), ProtocolName::from("/b/1.0.0")],
        );
    }

    #[tokio::test]
    async fn handle_emits_self_update() {
        let bus = EventBus::new(64);
        let peer_store = PeerStore::new(Arc::new(MemoryDatastore::default()), bus.clone())
            .await
            .unwrap();
        let registrar = Registrar::new(PeerId::random(), peer_store, bus.clone());
        let mut rx = bus.subscribe();

        registrar
            .handle("/echo/1.0.0".into(), noop_handler(), Default::default())
            .await
            .unwrap();

        loop {
            match rx.recv().await.unwrap() {
                Meshp2pEvent::LocalPeerUpdated { peer } => {
                    assert_eq!(peer.protocols, vec![ProtocolName::from("/echo/1.0.0")]);
                    break;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn unhandle_unknown_protocol_is_idempotent() {
        let registrar = registrar().await;

        registrar.unhandle(&"/missing/1.0.0".into()).await.unwrap();
        assert!(registrar.get_protocols().is_empty());
    }

    #[tokio::test]
    async fn topology_subscriptions_can_be_removed() {
        let registrar = registrar().await;

        struct Noop;
        impl Topology for Noop {
            fn on_connect(&self, _: PeerId, _: &Arc<Connection>) {}
            fn on_disconnect(&self, _: PeerId) {}
        }

        let id1 = registrar.register("/echo/1.0.0".into(), Arc::new(Noop));
        let id2 = registrar.register("/echo/1.0.0".into(), Arc::new(Noop));
        assert_ne!(id1, id2);

        registrar.unregister(id1);
        registrar.unregister(id1);
        assert_eq!(registrar.inner.topologies.read().len(), 1);
    }

    #[tokio::test]
    async fn releasing_one_of_several_streams_is_not_a_disconnect() {
        let registrar = registrar().await;
        let topology = Arc::new(RecordingTopology::default());
        registrar.register("/echo/1.0.0".into(), topology.clone());

        let (connection, _closed_rx) = test_connection(&registrar);

        // Two concurrent outbound streams for the same protocol.
        let reservation1 =
            registrar.reserve_outbound(&connection, "/echo/1.0.0".into()).unwrap();
        let reservation2 =
            registrar.reserve_outbound(&connection, "/echo/1.0.0".into()).unwrap();

        drop(reservation1);
        assert_eq!(
            topology.disconnects.load(Ordering::SeqCst),
            0,
            "disconnect fired while a stream was still open",
        );

        drop(reservation2);
        assert_eq!(topology.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn last_stream_in_either_direction_triggers_the_disconnect() {
        let registrar = registrar().await;
        let topology = Arc::new(RecordingTopology::default());
        registrar.register("/echo/1.0.0".into(), topology.clone());

        let (connection, _closed_rx) = test_connection(&registrar);

        let outbound =
            registrar.reserve_outbound(&connection, "/echo/1.0.0".into()).unwrap();
        let inbound = registrar
            .try_reserve(&connection, "/echo/1.0.0".into(), Direction::Inbound, 32)
            .unwrap();

        // One half ending is not a disconnect while the other is live.
        drop(inbound);
        assert_eq!(topology.disconnects.load(Ordering::SeqCst), 0);

        drop(outbound);
        assert_eq!(topology.disconnects.load(Ordering::SeqCst), 1);
    }
}
