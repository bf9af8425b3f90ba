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

//! [`/ipfs/id/1.0.0`](https://github.com/libp2p/specs/blob/master/identify/README.md) implementation.
//!
//! On every new connection the service requests the remote's identify
//! message, validates the carried identity against the connection and merges
//! addresses, protocols, metadata and the signed peer record into the peer
//! store. When the local node's own state changes, the new state is pushed
//! to connected peers over `/ipfs/id/push/1.0.0`.

use crate::{
    addresses::{strip_peer_id, AddressManager},
    bus::{EventBus, Meshp2pEvent},
    codec,
    connection::{manager::ConnectionManager, Connection, Stream},
    crypto::{ed25519::Keypair, PublicKey},
    error::Error,
    peer_id::PeerId,
    peer_store::{
        self, AddressUpdate, PeerStore, PeerUpdate, METADATA_AGENT_VERSION,
        METADATA_PROTOCOL_VERSION,
    },
    record::PeerRecord,
    registrar::{Registrar, StreamHandlerOptions},
    schema,
    types::{protocol::ProtocolName, ConnectionId},
};

use multiaddr::Multiaddr;
use parking_lot::Mutex;
use prost::Message;
use tokio_util::sync::CancellationToken;

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Logging target for the file.
const LOG_TARGET: &str = "meshp2p::ipfs::identify";

/// IPFS Identify protocol name.
pub const PROTOCOL_NAME: &str = "/ipfs/id/1.0.0";

/// IPFS Identify push protocol name.
pub const PUSH_PROTOCOL_NAME: &str = "/ipfs/id/push/1.0.0";

/// Distinct peers that must report an observed address before it is
/// confirmed.
const OBSERVED_CONFIRMATIONS: usize = 2;

/// Identify configuration.
#[derive(Debug, Clone)]
pub struct IdentifyConfig {
    /// Protocol version advertised in identify messages.
    pub protocol_version: String,

    /// Agent version advertised in identify messages.
    pub agent_version: String,

    /// Timeout of one identify exchange.
    pub timeout: Duration,

    /// Cap on the encoded identify message; over-size is a fatal protocol
    /// error.
    pub max_message_size: usize,
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        Self {
            protocol_version: "meshp2p/1.0.0".to_string(),
            agent_version: "meshp2p/0.1.0".to_string(),
            timeout: Duration::from_secs(5),
            max_message_size: 8192,
        }
    }
}

/// Result of a completed identify exchange.
#[derive(Debug, Clone)]
pub struct IdentifyInfo {
    /// The identified peer.
    pub peer: PeerId,

    /// Connection the exchange ran on.
    pub connection: ConnectionId,

    /// Remote's protocol version.
    pub protocol_version: Option<String>,

    /// Remote's agent version.
    pub agent_version: Option<String>,

    /// Remote's public key.
    pub public_key: PublicKey,

    /// Addresses the remote claims to listen on.
    pub listen_addresses: Vec<Multiaddr>,

    /// Address the remote observed us at.
    pub observed_address: Option<Multiaddr>,

    /// Protocols the remote supports.
    pub protocols: Vec<ProtocolName>,

    /// Verified signed peer record, if one was supplied.
    pub signed_peer_record: Option<PeerRecord>,
}

/// The identify service.
#[derive(Clone)]
pub struct IdentifyService {
    inner: Arc<IdentifyInner>,
}

struct IdentifyInner {
    keypair: Keypair,
    local_peer: PeerId,
    registrar: Registrar,
    address_manager: AddressManager,
    peer_store: PeerStore,
    connections: ConnectionManager,
    bus: EventBus,
    config: IdentifyConfig,

    /// Sequence number for signed peer records; strictly increasing.
    record_seq: AtomicU64,

    /// Which peers reported each observed address, for confirmation.
    observed_reporters: Mutex<HashMap<String, HashSet<PeerId>>>,

    shutdown: CancellationToken,
}

impl IdentifyService {
    /// Create a new identify service.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keypair: Keypair,
        registrar: Registrar,
        address_manager: AddressManager,
        peer_store: PeerStore,
        connections: ConnectionManager,
        bus: EventBus,
        config: IdentifyConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let local_peer = PublicKey::Ed25519(keypair.public()).to_peer_id();

        Self {
            inner: Arc::new(IdentifyInner {
                keypair,
                local_peer,
                registrar,
                address_manager,
                peer_store,
                connections,
                bus,
                config,
                record_seq: AtomicU64::new(now_millis()),
                observed_reporters: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    /// Register the identify handlers and start the service loop.
    pub async fn start(&self) -> crate::Result<()> {
        let service = self.clone();
        self.inner
            .registrar
            .handle(
                ProtocolName::from(PROTOCOL_NAME),
                Arc::new(move |stream, connection| {
                    let service = service.clone();
                    Box::pin(async move { service.respond(stream, connection).await })
                }),
                StreamHandlerOptions {
                    max_inbound_streams: 1,
                    run_on_transient_connection: true,
                    ..Default::default()
                },
            )
            .await?;

        let service = self.clone();
        self.inner
            .registrar
            .handle(
                ProtocolName::from(PUSH_PROTOCOL_NAME),
                Arc::new(move |stream, connection| {
                    let service = service.clone();
                    Box::pin(async move { service.handle_push(stream, connection).await })
                }),
                StreamHandlerOptions { max_inbound_streams: 1, ..Default::default() },
            )
            .await?;

        let service = self.clone();
        tokio::spawn(service.run());

        Ok(())
    }

    /// Service loop: identify new connections, push on self changes.
    async fn run(self) {
        tracing::debug!(target: LOG_TARGET, "starting identify event loop");

        let mut events = self.inner.bus.subscribe();

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = self.inner.shutdown.cancelled() => return,
            };

            match event {
                Ok(Meshp2pEvent::ConnectionEstablished { connection }) => {
                    let service = self.clone();
                    tokio::spawn(async move { service.identify_connection(connection).await });
                }
                Ok(Meshp2pEvent::LocalPeerUpdated { .. }) => {
                    let service = self.clone();
                    tokio::spawn(async move { service.push_to_peers().await });
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(target: LOG_TARGET, missed, "identify lagged behind the event bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Run the outbound half of identify on a fresh connection.
    async fn identify_connection(&self, connection: Arc<Connection>) {
        let peer = connection.peer();

        let result = match tokio::time::timeout(
            self.inner.config.timeout,
            self.request_identify(&connection),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        };

        match result {
            Ok(info) => {
                tracing::trace!(target: LOG_TARGET, ?peer, "peer identified");
                self.inner.bus.emit(Meshp2pEvent::PeerIdentified { info: Arc::new(info) });
            }
            // A proven identity mismatch is the one identify failure that
            // kills the connection.
            Err(Error::InvalidPeer) => {
                tracing::warn!(target: LOG_TARGET, ?peer, "identify proved peer id mismatch, aborting");
                connection.abort();
            }
            Err(error) => {
                tracing::debug!(target: LOG_TARGET, ?peer, ?error, "identify failed");
            }
        }
    }

    async fn request_identify(&self, connection: &Arc<Connection>) -> crate::Result<IdentifyInfo> {
        let mut stream = connection.new_stream(&[ProtocolName::from(PROTOCOL_NAME)]).await?;

        let payload =
            codec::read_length_prefixed(&mut stream, self.inner.config.max_message_size).await?;
        let _ = stream.close().await;

        let message = schema::Identify::decode(payload.as_slice())?;
        self.process_message(connection, message).await
    }

    /// Validate a received identify message and merge it into the peer
    /// store.
    async fn process_message(
        &self,
        connection: &Arc<Connection>,
        message: schema::Identify,
    ) -> crate::Result<IdentifyInfo> {
        let inner = &self.inner;
        let peer = connection.peer();

        let key_bytes = message.public_key.ok_or(Error::MissingPublicKey)?;
        let public_key = PublicKey::from_protobuf_encoding(&key_bytes)?;
        let derived = public_key.to_peer_id();

        if derived != peer || derived == inner.local_peer {
            return Err(Error::InvalidPeer);
        }

        // A signed record must be by the connection's peer. It wins only if
        // its sequence number beats the stored record.
        let mut record = None;
        if let Some(envelope) = message.signed_peer_record {
            let parsed = PeerRecord::from_envelope(&envelope)?;
            if parsed.peer != peer {
                return Err(Error::InvalidPeer);
            }

            let stored_seq = inner
                .peer_store
                .get(&peer)
                .ok()
                .and_then(|info| info.peer_record_envelope)
                .and_then(|stored| peer_store::record_seq(&stored));

            let wins = stored_seq.map_or(true, |stored| parsed.seq > stored);
            record = Some((parsed, envelope, wins));
        }

        let listen_addresses: Vec<Multiaddr> = message
            .listen_addrs
            .into_iter()
            .filter_map(|bytes| {
                let address = Multiaddr::try_from(bytes).ok()?;
                if address.is_empty() {
                    return None;
                }
                // A trailing peer id must be the sender's.
                match crate::addresses::peer_id_from_address(&address) {
                    Ok(Some(id)) if id != peer => None,
                    Ok(_) => Some(address),
                    Err(_) => None,
                }
            })
            .collect();

        let protocols: Vec<ProtocolName> =
            message.protocols.into_iter().map(ProtocolName::from).collect();

        // Addresses from a winning record are certified; otherwise the
        // uncertified listen addresses are used.
        let multiaddrs: Vec<AddressUpdate> = match &record {
            Some((parsed, _, true)) => parsed
                .addresses
                .iter()
                .map(|address| AddressUpdate { multiaddr: address.clone(), is_certified: true })
                .collect(),
            _ => listen_addresses
                .iter()
                .map(|address| AddressUpdate { multiaddr: address.clone(), is_certified: false })
                .collect(),
        };

        let mut metadata = Vec::new();
        if let Some(agent_version) = &message.agent_version {
            metadata.push((
                METADATA_AGENT_VERSION.to_string(),
                Some(agent_version.clone().into_bytes()),
            ));
        }
        if let Some(protocol_version) = &message.protocol_version {
            metadata.push((
                METADATA_PROTOCOL_VERSION.to_string(),
                Some(protocol_version.clone().into_bytes()),
            ));
        }

        inner
            .peer_store
            .merge(
                peer,
                PeerUpdate {
                    multiaddrs: Some(multiaddrs),
                    protocols: Some(protocols.clone()),
                    metadata: Some(metadata),
                    tags: None,
                    peer_record_envelope: record
                        .as_ref()
                        .filter(|(_, _, wins)| *wins)
                        .map(|(_, envelope, _)| envelope.clone()),
                    public_key: Some(public_key.clone()),
                },
            )
            .await?;

        inner.registrar.on_peer_protocols_updated(peer, &protocols, connection);

        // Feed the observed address, stripped of any peer id suffix, to the
        // address manager; confirm once enough distinct peers agree.
        let observed_address = message
            .observed_addr
            .and_then(|bytes| Multiaddr::try_from(bytes).ok())
            .filter(|address| !address.is_empty())
            .map(|address| strip_peer_id(&address));

        if let Some(observed) = &observed_address {
            inner.address_manager.add_observed_addr(observed.clone());

            let confirmations = {
                let mut reporters = inner.observed_reporters.lock();
                let entry = reporters.entry(observed.to_string()).or_default();
                entry.insert(peer);
                entry.len()
            };
            if confirmations >= OBSERVED_CONFIRMATIONS {
                inner.address_manager.confirm_observed_addr(observed);
            }
        }

        Ok(IdentifyInfo {
            peer,
            connection: connection.id(),
            protocol_version: message.protocol_version,
            agent_version: message.agent_version,
            public_key,
            listen_addresses,
            observed_address,
            protocols,
            signed_peer_record: record.map(|(parsed, _, _)| parsed),
        })
    }

    /// Answer an inbound identify request with our own state.
    async fn respond(&self, mut stream: Stream, connection: Arc<Connection>) {
        let message = self.build_message(connection.remote_address());

        let mut payload = Vec::with_capacity(message.encoded_len());
        message.encode(&mut payload).expect("buffer to have sufficient capacity");

        match tokio::time::timeout(
            self.inner.config.timeout,
            codec::write_length_prefixed(&mut stream, &payload),
        )
        .await
        {
            Ok(Ok(())) => {
                let _ = stream.close().await;
            }
            Ok(Err(error)) => {
                tracing::debug!(
                    target: LOG_TARGET,
                    peer = ?connection.peer(),
                    ?error,
                    "failed to send identify response",
                );
            }
            Err(_) => {
                tracing::debug!(
                    target: LOG_TARGET,
                    peer = ?connection.peer(),
                    "timed out sending identify response",
                );
                stream.reset();
            }
        }
    }

    /// Apply a pushed identify message.
    async fn handle_push(&self, mut stream: Stream, connection: Arc<Connection>) {
        let payload =
            match codec::read_length_prefixed(&mut stream, self.inner.config.max_message_size)
                .await
            {
                Ok(payload) => payload,
                Err(error) => {
                    tracing::debug!(target: LOG_TARGET, ?error, "failed to read identify push");
                    stream.reset();
                    return;
                }
            };
        let _ = stream.close().await;

        let message = match schema::Identify::decode(payload.as_slice()) {
            Ok(message) => message,
            Err(error) => {
                tracing::debug!(target: LOG_TARGET, ?error, "undecodable identify push");
                return;
            }
        };

        match self.process_message(&connection, message).await {
            Ok(info) => {
                self.inner.bus.emit(Meshp2pEvent::PeerIdentified { info: Arc::new(info) });
            }
            Err(Error::InvalidPeer) => connection.abort(),
            Err(error) => {
                tracing::debug!(target: LOG_TARGET, ?error, "failed to apply identify push");
            }
        }
    }

    /// Push the current self state to every connected peer that supports
    /// the push protocol.
    async fn push_to_peers(&self) {
        let inner = &self.inner;

        for (peer, connections) in inner.connections.get_connections_map() {
            let supports_push = inner
                .peer_store
                .get(&peer)
                .map(|info| info.protocols.iter().any(|protocol| protocol.as_str() == PUSH_PROTOCOL_NAME))
                .unwrap_or(false);
            if !supports_push {
                continue;
            }

            let Some(connection) = connections
                .into_iter()
                .find(|connection| connection.status() == crate::connection::ConnectionStatus::Open)
            else {
                continue;
            };

            let service = self.clone();
            tokio::spawn(async move {
                let message = service.build_message(connection.remote_address());
                let mut payload = Vec::with_capacity(message.encoded_len());
                message.encode(&mut payload).expect("buffer to have sufficient capacity");

                let push = async {
                    let mut stream = connection
                        .new_stream(&[ProtocolName::from(PUSH_PROTOCOL_NAME)])
                        .await?;
                    codec::write_length_prefixed(&mut stream, &payload).await?;
                    let _ = stream.close().await;
                    Ok::<_, Error>(())
                };

                // A timed-out push stream is dropped mid-flight, which
                // resets it rather than closing gracefully.
                match tokio::time::timeout(service.inner.config.timeout, push).await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        tracing::debug!(target: LOG_TARGET, ?peer, ?error, "identify push failed");
                    }
                    Err(_) => {
                        tracing::debug!(target: LOG_TARGET, ?peer, "identify push timed out");
                    }
                }
            });
        }
    }

    /// Build our identify message for a peer we see at `remote_address`.
    fn build_message(&self, remote_address: &Multiaddr) -> schema::Identify {
        let inner = &self.inner;

        let addresses: Vec<Multiaddr> = inner
            .address_manager
            .get_addresses()
            .iter()
            .map(strip_peer_id)
            .collect();

        let record = PeerRecord::new(inner.local_peer, self.next_record_seq(), addresses.clone());

        schema::Identify {
            public_key: Some(PublicKey::Ed25519(inner.keypair.public()).to_protobuf_encoding()),
            listen_addrs: addresses.iter().map(|address| address.to_vec()).collect(),
            protocols: inner
                .registrar
                .get_protocols()
                .iter()
                .map(|protocol| protocol.to_string())
                .collect(),
            observed_addr: Some(remote_address.to_vec()),
            protocol_version: Some(inner.config.protocol_version.clone()),
            agent_version: Some(inner.config.agent_version.clone()),
            signed_peer_record: Some(record.seal(&inner.keypair)),
        }
    }

    /// Next record sequence number: wall clock, but strictly increasing.
    fn next_record_seq(&self) -> u64 {
        let mut current = self.inner.record_seq.load(Ordering::SeqCst);
        loop {
            let next = std::cmp::max(current + 1, now_millis());
            match self.inner.record_seq.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is past the unix epoch; qed")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_seq_is_strictly_increasing() {
        let seq = AtomicU64::new(now_millis());

        let mut previous = 0;
        for _ in 0..1000 {
            let mut current = seq.load(Ordering::SeqCst);
            let next = loop {
                let next = std::cmp::max(current + 1, now_millis());
                match seq.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(_) => break next,
                    Err(actual) => current = actual,
                }
            };

            assert!(next > previous);
            previous = next;
        }
    }
}
