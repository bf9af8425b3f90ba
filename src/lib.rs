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

//! Modular peer-to-peer networking node.
//!
//! [`Meshp2p`] wires the peer store, address manager, transports, upgrader,
//! registrar, dial queue, connection manager and identify service into one
//! node. Transports, connection security and stream muxers are capability
//! traits plugged in through [`config::ConfigBuilder`].

use crate::{
    addresses::AddressManager,
    bus::EventBus,
    config::Config,
    connection::{
        dial_queue::{DialOptions, DialQueue, DialTarget, DEFAULT_DIAL_PRIORITY},
        manager::ConnectionManager,
        upgrader::Upgrader,
        Connection,
    },
    crypto::PublicKey,
    error::Error,
    executor::Executor,
    peer_store::PeerStore,
    protocol::identify::IdentifyService,
    registrar::{Registrar, StreamHandler, StreamHandlerOptions},
    transport::TransportManager,
    types::protocol::ProtocolName,
};

use multiaddr::Multiaddr;
use tokio::sync::{broadcast, mpsc::channel};
use tokio_util::sync::CancellationToken;

use std::{result, sync::Arc, time::Duration};

pub use bus::Meshp2pEvent;
pub use peer_id::PeerId;

pub mod addresses;
pub mod bus;
pub mod codec;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod executor;
pub mod gater;
pub mod multistream;
pub mod mux;
pub mod peer_id;
pub mod peer_store;
pub mod protocol;
pub mod record;
pub mod registrar;
pub mod schema;
pub mod security;
pub mod transport;
pub mod types;

/// Public result type used by the crate.
pub type Result<T> = result::Result<T, error::Error>;

/// Logging target for the file.
const LOG_TARGET: &str = "meshp2p";

/// Default channel size.
const DEFAULT_CHANNEL_SIZE: usize = 64;

/// Capacity of the event bus.
const EVENT_BUS_CAPACITY: usize = 256;

/// The node.
pub struct Meshp2p {
    local_peer_id: PeerId,
    bus: EventBus,
    events: broadcast::Receiver<Meshp2pEvent>,
    peer_store: PeerStore,
    address_manager: AddressManager,
    transports: Arc<TransportManager>,
    registrar: Registrar,
    connection_manager: ConnectionManager,
    identify: IdentifyService,
    executor: Arc<dyn Executor>,
    shutdown: CancellationToken,
    listen_addresses: Vec<Multiaddr>,
    stop_timeout: Duration,
    closed_rx: Option<tokio::sync::mpsc::Receiver<(PeerId, crate::types::ConnectionId)>>,
    started: bool,
}

impl Meshp2p {
    /// Create a new node from `config`.
    ///
    /// Components are wired in two phases: the shared handles are allocated
    /// first, then the services that reference them.
    pub async fn new(config: Config) -> crate::Result<Meshp2p> {
        let local_peer_id = PublicKey::Ed25519(config.keypair.public()).to_peer_id();
        let shutdown = CancellationToken::new();
        let bus = EventBus::new(EVENT_BUS_CAPACITY);
        let events = bus.subscribe();

        // Phase one: shared state.
        let peer_store = PeerStore::new(config.datastore, bus.clone()).await?;
        let transports = Arc::new(TransportManager::new(config.transports)?);
        let registrar = Registrar::new(local_peer_id, peer_store.clone(), bus.clone());
        let address_manager = AddressManager::new(
            local_peer_id,
            transports.listen_addresses(),
            config.announce_addresses,
            config.announce_filter,
            config.max_observed_addresses,
            peer_store.clone(),
            bus.clone(),
        );

        // Phase two: services over the shared state. Connections report
        // their close over a channel rather than a back-reference.
        let (closed_tx, closed_rx) = channel(DEFAULT_CHANNEL_SIZE);

        let upgrader = Upgrader::new(
            local_peer_id,
            config.security,
            config.muxers,
            config.protector,
            config.gater.clone(),
            registrar.clone(),
            config.inbound_upgrade_timeout,
            closed_tx,
        )?;

        let dial_queue = DialQueue::new(
            local_peer_id,
            peer_store.clone(),
            transports.clone(),
            upgrader.clone(),
            config.gater,
            config.resolver,
            config.address_sorter,
            config.dial,
            shutdown.child_token(),
        );

        let connection_manager = ConnectionManager::new(
            local_peer_id,
            dial_queue,
            upgrader,
            peer_store.clone(),
            registrar.clone(),
            bus.clone(),
            config.limits,
            shutdown.child_token(),
        )?;

        let identify = IdentifyService::new(
            config.keypair,
            registrar.clone(),
            address_manager.clone(),
            peer_store.clone(),
            connection_manager.clone(),
            bus.clone(),
            config.identify,
            shutdown.child_token(),
        );

        tracing::debug!(target: LOG_TARGET, peer = ?local_peer_id, "node created");

        Ok(Meshp2p {
            local_peer_id,
            bus,
            events,
            peer_store,
            address_manager,
            transports,
            registrar,
            connection_manager,
            identify,
            executor: config.executor,
            shutdown,
            listen_addresses: config.listen_addresses,
            stop_timeout: config.stop_timeout,
            closed_rx: Some(closed_rx),
            started: false,
        })
    }

    /// Start listening and spawn the service loops.
    pub async fn start(&mut self) -> crate::Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;

        self.identify.start().await?;
        self.registrar
            .handle(
                ProtocolName::from(protocol::ping::PROTOCOL_NAME),
                protocol::ping::handler(),
                StreamHandlerOptions::default(),
            )
            .await?;

        let (inbound_tx, inbound_rx) = channel(DEFAULT_CHANNEL_SIZE);
        self.transports
            .listen(
                self.listen_addresses.clone(),
                inbound_tx,
                self.shutdown.child_token(),
                self.bus.clone(),
            )
            .await?;
        self.address_manager.on_listen_addresses_changed();

        let closed_rx = self.closed_rx.take().ok_or_else(|| {
            Error::InvalidParameters("node was already started once".to_string())
        })?;

        self.executor.run(
            "connection-close-loop",
            Box::pin(self.connection_manager.clone().run_close_loop(closed_rx)),
        );
        self.executor.run(
            "inbound-connection-loop",
            Box::pin(self.connection_manager.clone().run_inbound_loop(inbound_rx)),
        );
        self.executor.run(
            "auto-dial-loop",
            Box::pin(self.connection_manager.clone().run_auto_dial_loop()),
        );

        self.connection_manager.reconnect_keep_alive_peers();

        tracing::info!(target: LOG_TARGET, peer = ?self.local_peer_id, "node started");
        Ok(())
    }

    /// Stop the node: abort pending work and close all connections.
    pub async fn stop(&mut self) -> crate::Result<()> {
        tracing::info!(target: LOG_TARGET, peer = ?self.local_peer_id, "stopping node");

        self.shutdown.cancel();

        let connections = self.connection_manager.get_connections(None);
        let graceful = async {
            for connection in &connections {
                let _ = connection.close().await;
            }
        };

        if tokio::time::timeout(self.stop_timeout, graceful).await.is_err() {
            for connection in self.connection_manager.get_connections(None) {
                connection.abort();
            }
        }

        Ok(())
    }

    /// Get the local peer ID.
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Addresses the node is currently listening on.
    pub fn listen_addresses(&self) -> Vec<Multiaddr> {
        self.address_manager.get_listen_addrs()
    }

    /// Addresses the node advertises.
    pub fn addresses(&self) -> Vec<Multiaddr> {
        self.address_manager.get_addresses()
    }

    /// Get the peer store.
    pub fn peer_store(&self) -> &PeerStore {
        &self.peer_store
    }

    /// Get the address manager.
    pub fn address_manager(&self) -> &AddressManager {
        &self.address_manager
    }

    /// Get the connection manager.
    pub fn connection_manager(&self) -> &ConnectionManager {
        &self.connection_manager
    }

    /// Get the registrar.
    pub fn registrar(&self) -> &Registrar {
        &self.registrar
    }

    /// Dial a peer, an address or an address list.
    pub async fn dial(&self, target: impl Into<DialTarget>) -> crate::Result<Arc<Connection>> {
        self.connection_manager
            .open_connection(
                target,
                DialOptions { signal: None, priority: DEFAULT_DIAL_PRIORITY },
            )
            .await
    }

    /// Dial with explicit options.
    pub async fn dial_with_options(
        &self,
        target: impl Into<DialTarget>,
        options: DialOptions,
    ) -> crate::Result<Arc<Connection>> {
        self.connection_manager.open_connection(target, options).await
    }

    /// Register a handler for `protocol`.
    pub async fn handle(
        &self,
        protocol: ProtocolName,
        handler: StreamHandler,
        options: StreamHandlerOptions,
    ) -> crate::Result<()> {
        self.registrar.handle(protocol, handler, options).await
    }

    /// Remove the handler for `protocol`.
    pub async fn unhandle(&self, protocol: &ProtocolName) -> crate::Result<()> {
        self.registrar.unhandle(protocol).await
    }

    /// Measure the round-trip time to a peer, connecting first if needed.
    pub async fn ping(&self, target: impl Into<DialTarget>) -> crate::Result<Duration> {
        let connection = self.dial(target).await?;
        protocol::ping::ping(&connection).await
    }

    /// Subscribe to node events.
    pub fn subscribe(&self) -> broadcast::Receiver<Meshp2pEvent> {
        self.bus.subscribe()
    }

    /// Poll the next node event.
    pub async fn next_event(&mut self) -> Option<Meshp2pEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(target: LOG_TARGET, missed, "event consumer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ConfigBuilder,
        crypto::ed25519::Keypair,
        mux::mplex::Mplex,
        security::plaintext::PlainText,
        transport::memory::{MemoryHub, MemoryTransport},
    };

    fn node_config(hub: MemoryHub) -> Config {
        let keypair = Keypair::generate();

        ConfigBuilder::new()
            .with_transport(Arc::new(MemoryTransport::new(hub)))
            .with_security(Arc::new(PlainText::new(keypair.clone())))
            .with_muxer(Arc::new(Mplex))
            .with_keypair(keypair)
            .with_listen_address("/memory/0".parse().unwrap())
            .build()
    }

    #[tokio::test]
    async fn node_without_transports_fails_to_build() {
        let keypair = Keypair::generate();
        let config = ConfigBuilder::new()
            .with_security(Arc::new(PlainText::new(keypair.clone())))
            .with_muxer(Arc::new(Mplex))
            .with_keypair(keypair)
            .build();

        match Meshp2p::new(config).await {
            Err(error) => assert_eq!(error.code(), "ERR_TRANSPORTS_REQUIRED"),
            Ok(_) => panic!("node built without transports"),
        }
    }

    #[tokio::test]
    async fn node_without_encryption_fails_to_build() {
        let config = ConfigBuilder::new()
            .with_transport(Arc::new(MemoryTransport::new(MemoryHub::default())))
            .with_muxer(Arc::new(Mplex))
            .build();

        match Meshp2p::new(config).await {
            Err(error) => assert_eq!(error.code(), "ERR_CONN_ENCRYPTION_REQUIRED"),
            Ok(_) => panic!("node built without connection encryption"),
        }
    }

    #[tokio::test]
    async fn two_nodes_connect() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let hub = MemoryHub::default();
        let mut node1 = Meshp2p::new(node_config(hub.clone())).await.unwrap();
        let mut node2 = Meshp2p::new(node_config(hub)).await.unwrap();

        node1.start().await.unwrap();
        node2.start().await.unwrap();

        let address = node2.listen_addresses().pop().unwrap();
        let connection = node1.dial(address).await.unwrap();

        assert_eq!(connection.peer(), *node2.local_peer_id());

        // The remote sees the connection too.
        let node1_peer = *node1.local_peer_id();
        loop {
            match node2.next_event().await.unwrap() {
                Meshp2pEvent::ConnectionEstablished { connection } => {
                    assert_eq!(connection.peer(), node1_peer);
                    break;
                }
                _ => {}
            }
        }

        node1.stop().await.unwrap();
        node2.stop().await.unwrap();
    }

    #[tokio::test]
    async fn dialing_a_stopped_listener_fails() {
        let hub = MemoryHub::default();
        let mut node1 = Meshp2p::new(node_config(hub.clone())).await.unwrap();
        let mut node2 = Meshp2p::new(node_config(hub)).await.unwrap();

        node1.start().await.unwrap();
        node2.start().await.unwrap();

        let address = node2.listen_addresses().pop().unwrap();
        node2.stop().await.unwrap();

        // Give the listener task a moment to unbind.
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(node1.dial(address).await.is_err());
        node1.stop().await.unwrap();
    }
}
