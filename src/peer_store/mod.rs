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

//! Persistent store of everything known about remote peers.
//!
//! Each entry holds a peer's addresses (with certification flags and
//! dial-outcome timestamps), supported protocols, binary metadata, tags and
//! the latest signed peer record. Mutations go through a partial-update DSL
//! (`save`/`patch`/`merge`); every state change emits a peer-update event
//! carrying the previous state so consumers can compute deltas.

use crate::{
    bus::{EventBus, Meshp2pEvent},
    crypto::PublicKey,
    error::Error,
    peer_id::PeerId,
    schema,
    types::protocol::ProtocolName,
};

use multiaddr::Multiaddr;
use parking_lot::RwLock;
use prost::Message;

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

pub use datastore::{Datastore, MemoryDatastore};

pub mod datastore;

/// Logging target for the file.
const LOG_TARGET: &str = "meshp2p::peer-store";

/// Datastore key prefix for peer entries.
const KEY_PREFIX: &str = "/peers/";

/// Metadata key under which the remote's agent version is stored.
pub const METADATA_AGENT_VERSION: &str = "AgentVersion";

/// Metadata key under which the remote's protocol version is stored.
pub const METADATA_PROTOCOL_VERSION: &str = "ProtocolVersion";

/// Largest allowed tag value.
const MAX_TAG_VALUE: u8 = 100;

/// One known address of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    /// The address itself.
    pub multiaddr: Multiaddr,

    /// Whether the address came from a verified signed peer record.
    pub is_certified: bool,

    /// Unix millis of the last successful dial over this address.
    pub last_success: Option<u64>,

    /// Unix millis of the last failed dial over this address.
    pub last_failure: Option<u64>,
}

impl From<Multiaddr> for AddressEntry {
    fn from(multiaddr: Multiaddr) -> Self {
        AddressEntry {
            multiaddr,
            is_certified: false,
            last_success: None,
            last_failure: None,
        }
    }
}

/// Point-in-time snapshot of a peer-store entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    /// Peer ID.
    pub peer_id: PeerId,

    /// Known addresses, deduplicated by string form.
    pub addresses: Vec<AddressEntry>,

    /// Protocols the peer supports, sorted and deduplicated.
    pub protocols: Vec<ProtocolName>,

    /// Binary metadata keyed by short strings.
    pub metadata: HashMap<String, Vec<u8>>,

    /// Tags with unexpired TTLs, sorted by name.
    pub tags: Vec<(String, u8)>,

    /// Latest accepted signed peer record, as raw envelope bytes.
    pub peer_record_envelope: Option<Vec<u8>>,

    /// The peer's public key, if known.
    pub public_key: Option<PublicKey>,
}

impl PeerInfo {
    /// Sum of all visible tag values.
    pub fn tag_sum(&self) -> u32 {
        self.tags.iter().map(|(_, value)| *value as u32).sum()
    }

    /// Whether the peer carries the given tag.
    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|(tag, _)| tag == name)
    }
}

/// Address carried by a partial update.
#[derive(Debug, Clone)]
pub struct AddressUpdate {
    /// The address.
    pub multiaddr: Multiaddr,

    /// Whether the address is certified by a signed record.
    pub is_certified: bool,
}

impl From<Multiaddr> for AddressUpdate {
    fn from(multiaddr: Multiaddr) -> Self {
        AddressUpdate { multiaddr, is_certified: false }
    }
}

/// Tag value with an optional time-to-live.
#[derive(Debug, Clone, Default)]
pub struct TagOptions {
    /// Tag value, `0..=100`.
    pub value: u8,

    /// Optional TTL after which the tag is no longer visible.
    pub ttl: Option<Duration>,
}

/// Partial update applied with [`PeerStore::save`], [`PeerStore::patch`] or
/// [`PeerStore::merge`].
#[derive(Debug, Clone, Default)]
pub struct PeerUpdate {
    /// Addresses to set or add.
    pub multiaddrs: Option<Vec<AddressUpdate>>,

    /// Protocols to set or add.
    pub protocols: Option<Vec<ProtocolName>>,

    /// Metadata entries to set (`Some`) or remove (`None`).
    pub metadata: Option<Vec<(String, Option<Vec<u8>>)>>,

    /// Tags to set or add.
    pub tags: Option<Vec<(String, TagOptions)>>,

    /// Signed peer record envelope to store.
    pub peer_record_envelope: Option<Vec<u8>>,

    /// The peer's public key.
    pub public_key: Option<PublicKey>,
}

/// In-memory form of one stored peer.
#[derive(Debug, Clone, Default)]
struct StoredPeer {
    addresses: Vec<AddressEntry>,
    protocols: BTreeSet<ProtocolName>,
    metadata: HashMap<String, Vec<u8>>,
    tags: HashMap<String, TagEntry>,
    peer_record_envelope: Option<Vec<u8>>,
    record_seq: Option<u64>,
    public_key: Option<PublicKey>,
}

#[derive(Debug, Clone)]
struct TagEntry {
    value: u8,
    expires_at: Option<Instant>,
}

impl TagEntry {
    fn expired(&self) -> bool {
        self.expires_at.map_or(false, |at| at <= Instant::now())
    }
}

/// The peer store.
#[derive(Clone)]
pub struct PeerStore {
    inner: Arc<PeerStoreInner>,
}

struct PeerStoreInner {
    peers: RwLock<HashMap<PeerId, StoredPeer>>,
    datastore: Arc<dyn Datastore>,
    bus: EventBus,
    /// Serializes mutation + persistence so per-peer events fire in mutation
    /// order.
    write_gate: tokio::sync::Mutex<()>,
}

impl PeerStore {
    /// Create a peer store, loading any entries persisted in `datastore`.
    pub async fn new(datastore: Arc<dyn Datastore>, bus: EventBus) -> crate::Result<Self> {
        let mut peers = HashMap::new();

        for (key, value) in datastore.query(KEY_PREFIX.as_bytes()).await? {
            let encoded_peer = &key[KEY_PREFIX.len()..];
            let Ok(peer) = std::str::from_utf8(encoded_peer)
                .map_err(|_| ())
                .and_then(|s| s.parse::<PeerId>().map_err(|_| ()))
            else {
                tracing::warn!(target: LOG_TARGET, ?key, "skipping undecodable peer-store key");
                continue;
            };

            match decode_stored_peer(&value) {
                Ok(stored) => {
                    peers.insert(peer, stored);
                }
                Err(error) => {
                    tracing::warn!(target: LOG_TARGET, ?peer, ?error, "skipping undecodable peer-store entry");
                }
            }
        }

        tracing::debug!(target: LOG_TARGET, peers = peers.len(), "peer store loaded");

        Ok(Self {
            inner: Arc::new(PeerStoreInner {
                peers: RwLock::new(peers),
                datastore,
                bus,
                write_gate: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Get a snapshot of `peer`.
    ///
    /// `Error::NotFound` is the routine outcome for unknown peers.
    pub fn get(&self, peer: &PeerId) -> crate::Result<PeerInfo> {
        self.inner
            .peers
            .read()
            .get(peer)
            .map(|stored| stored.to_info(*peer))
            .ok_or(Error::NotFound)
    }

    /// Check whether `peer` is known.
    pub fn has(&self, peer: &PeerId) -> bool {
        self.inner.peers.read().contains_key(peer)
    }

    /// Snapshot of all peers matching `filter`.
    pub fn all<F: Fn(&PeerInfo) -> bool>(&self, filter: F) -> Vec<PeerInfo> {
        self.inner
            .peers
            .read()
            .iter()
            .map(|(peer, stored)| stored.to_info(*peer))
            .filter(|info| filter(info))
            .collect()
    }

    /// Replace the whole entry for `peer`.
    pub async fn save(&self, peer: PeerId, update: PeerUpdate) -> crate::Result<PeerInfo> {
        self.mutate(peer, move |_| apply_update(StoredPeer::default(), update, UpdateMode::Replace))
            .await
    }

    /// Replace only the fields present in `update`.
    pub async fn patch(&self, peer: PeerId, update: PeerUpdate) -> crate::Result<PeerInfo> {
        self.mutate(peer, move |existing| {
            apply_update(existing.cloned().unwrap_or_default(), update, UpdateMode::Replace)
        })
        .await
    }

    /// Union the fields present in `update` into the entry.
    ///
    /// Addresses and protocols are unioned, metadata is last-wins per key and
    /// the signed peer record is kept only if its sequence number dominates
    /// the stored one.
    pub async fn merge(&self, peer: PeerId, update: PeerUpdate) -> crate::Result<PeerInfo> {
        self.mutate(peer, move |existing| {
            apply_update(existing.cloned().unwrap_or_default(), update, UpdateMode::Merge)
        })
        .await
    }

    /// Forget everything about `peer`.
    pub async fn delete(&self, peer: PeerId) -> crate::Result<()> {
        let _gate = self.inner.write_gate.lock().await;

        self.inner.peers.write().remove(&peer);
        self.inner.datastore.delete(&key_for(&peer)).await
    }

    /// Tag `peer` with `name`.
    pub async fn tag_peer(
        &self,
        peer: PeerId,
        name: &str,
        options: TagOptions,
    ) -> crate::Result<()> {
        if options.value > MAX_TAG_VALUE {
            return Err(Error::InvalidParameters(format!(
                "tag value {} exceeds maximum of {MAX_TAG_VALUE}",
                options.value
            )));
        }

        let name = name.to_string();
        self.mutate(peer, move |existing| {
            let mut stored = existing.cloned().unwrap_or_default();
            stored.tags.insert(
                name,
                TagEntry {
                    value: options.value,
                    expires_at: options.ttl.map(|ttl| Instant::now() + ttl),
                },
            );
            Ok(stored)
        })
        .await?;

        Ok(())
    }

    /// Remove the tag `name` from `peer`.
    pub async fn untag_peer(&self, peer: PeerId, name: &str) -> crate::Result<()> {
        let name = name.to_string();
        self.mutate(peer, move |existing| {
            let mut stored = existing.cloned().unwrap_or_default();
            stored.tags.remove(&name);
            Ok(stored)
        })
        .await?;

        Ok(())
    }

    /// Get the unexpired tags of `peer`.
    pub fn get_tags(&self, peer: &PeerId) -> crate::Result<Vec<(String, u8)>> {
        Ok(self.get(peer)?.tags)
    }

    /// Record the outcome of dialing `peer` on `address`.
    pub async fn record_dial_outcome(
        &self,
        peer: PeerId,
        address: Multiaddr,
        success: bool,
    ) -> crate::Result<()> {
        self.mutate(peer, move |existing| {
            let mut stored = existing.cloned().unwrap_or_default();
            let now = now_millis();

            let entry = match stored
                .addresses
                .iter_mut()
                .find(|entry| entry.multiaddr == address)
            {
                Some(entry) => entry,
                None => {
                    stored.addresses.push(AddressEntry::from(address.clone()));
                    stored.addresses.last_mut().expect("entry was just pushed; qed")
                }
            };

            if success {
                entry.last_success = Some(now);
            } else {
                entry.last_failure = Some(now);
            }

            Ok(stored)
        })
        .await?;

        Ok(())
    }

    /// Apply a mutation, persist the result and emit update events.
    async fn mutate<F>(&self, peer: PeerId, mutation: F) -> crate::Result<PeerInfo>
    where
        F: FnOnce(Option<&StoredPeer>) -> crate::Result<StoredPeer>,
    {
        let _gate = self.inner.write_gate.lock().await;

        let (previous, current, stored) = {
            let mut peers = self.inner.peers.write();

            // Expired tags are invisible to readers; drop them for good on
            // the next write.
            let existing = peers.get(&peer).cloned().map(|mut stored| {
                stored.tags.retain(|_, tag| !tag.expired());
                stored
            });

            let previous = existing.as_ref().map(|stored| Arc::new(stored.to_info(peer)));
            let mut next = mutation(existing.as_ref())?;
            normalize_addresses(&mut next.addresses);

            let current = Arc::new(next.to_info(peer));
            peers.insert(peer, next.clone());

            (previous, current, next)
        };

        self.inner
            .datastore
            .put(key_for(&peer), encode_stored_peer(&stored))
            .await?;

        let changed = previous.as_ref().map_or(true, |previous| **previous != *current);
        if changed {
            if previous.is_none() {
                self.inner.bus.emit(Meshp2pEvent::PeerDiscovered { peer: current.clone() });
            }
            self.inner.bus.emit(Meshp2pEvent::PeerUpdated {
                current: current.clone(),
                previous,
            });
        }

        Ok((*current).clone())
    }
}

enum UpdateMode {
    Replace,
    Merge,
}

fn apply_update(
    mut stored: StoredPeer,
    update: PeerUpdate,
    mode: UpdateMode,
) -> crate::Result<StoredPeer> {
    if let Some(multiaddrs) = update.multiaddrs {
        let incoming = multiaddrs.into_iter().map(|update| AddressEntry {
            multiaddr: update.multiaddr,
            is_certified: update.is_certified,
            last_success: None,
            last_failure: None,
        });

        match mode {
            UpdateMode::Replace => stored.addresses = incoming.collect(),
            UpdateMode::Merge => stored.addresses.extend(incoming),
        }
    }

    if let Some(protocols) = update.protocols {
        match mode {
            UpdateMode::Replace => stored.protocols = protocols.into_iter().collect(),
            UpdateMode::Merge => stored.protocols.extend(protocols),
        }
    }

    if let Some(metadata) = update.metadata {
        if matches!(mode, UpdateMode::Replace) {
            stored.metadata.clear();
        }
        for (key, value) in metadata {
            match value {
                Some(value) => {
                    stored.metadata.insert(key, value);
                }
                None => {
                    stored.metadata.remove(&key);
                }
            }
        }
    }

    if let Some(tags) = update.tags {
        if matches!(mode, UpdateMode::Replace) {
            stored.tags.clear();
        }
        for (name, options) in tags {
            if options.value > MAX_TAG_VALUE {
                return Err(Error::InvalidParameters(format!(
                    "tag value {} exceeds maximum of {MAX_TAG_VALUE}",
                    options.value
                )));
            }
            stored.tags.insert(
                name,
                TagEntry {
                    value: options.value,
                    expires_at: options.ttl.map(|ttl| Instant::now() + ttl),
                },
            );
        }
    }

    if let Some(envelope) = update.peer_record_envelope {
        let seq = record_seq(&envelope);

        let dominated = match (mode, stored.record_seq, seq) {
            (UpdateMode::Replace, _, _) => false,
            (UpdateMode::Merge, Some(stored_seq), Some(incoming)) => incoming < stored_seq,
            (UpdateMode::Merge, Some(_), None) => true,
            (UpdateMode::Merge, None, _) => false,
        };

        if !dominated {
            stored.peer_record_envelope = Some(envelope);
            stored.record_seq = seq;
        }
    }

    if let Some(public_key) = update.public_key {
        stored.public_key = Some(public_key);
    }

    Ok(stored)
}

/// Deduplicate addresses by string form, keeping the strongest certification
/// flag and the freshest timestamps.
fn normalize_addresses(addresses: &mut Vec<AddressEntry>) {
    let mut merged: Vec<AddressEntry> = Vec::with_capacity(addresses.len());

    for entry in addresses.drain(..) {
        match merged.iter_mut().find(|existing| existing.multiaddr == entry.multiaddr) {
            Some(existing) => {
                existing.is_certified |= entry.is_certified;
                existing.last_success = existing.last_success.max(entry.last_success);
                existing.last_failure = existing.last_failure.max(entry.last_failure);
            }
            None => merged.push(entry),
        }
    }

    merged.sort_by(|a, b| {
        let (a, b): (&[u8], &[u8]) = (a.multiaddr.as_ref(), b.multiaddr.as_ref());
        a.cmp(b)
    });
    *addresses = merged;
}

/// Extract the sequence number from an envelope without verifying it.
pub(crate) fn record_seq(envelope: &[u8]) -> Option<u64> {
    let envelope = schema::Envelope::decode(envelope).ok()?;
    let payload = schema::PeerRecord::decode(envelope.payload.as_slice()).ok()?;
    Some(payload.seq)
}

impl StoredPeer {
    fn to_info(&self, peer_id: PeerId) -> PeerInfo {
        let mut tags: Vec<(String, u8)> = self
            .tags
            .iter()
            .filter(|(_, tag)| !tag.expired())
            .map(|(name, tag)| (name.clone(), tag.value))
            .collect();
        tags.sort();

        PeerInfo {
            peer_id,
            addresses: self.addresses.clone(),
            protocols: self.protocols.iter().cloned().collect(),
            metadata: self.metadata.clone(),
            tags,
            peer_record_envelope: self.peer_record_envelope.clone(),
            public_key: self.public_key.clone(),
        }
    }
}

fn key_for(peer: &PeerId) -> Vec<u8> {
    let mut key = KEY_PREFIX.as_bytes().to_vec();
    key.extend_from_slice(peer.to_string().as_bytes());
    key
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is past the unix epoch; qed")
        .as_millis() as u64
}

fn encode_stored_peer(stored: &StoredPeer) -> Vec<u8> {
    let now = Instant::now();

    let entry = schema::PeerEntry {
        addresses: stored
            .addresses
            .iter()
            .map(|address| schema::StoredAddress {
                multiaddr: address.multiaddr.to_vec(),
                is_certified: address.is_certified,
                last_success: address.last_success,
                last_failure: address.last_failure,
            })
            .collect(),
        protocols: stored.protocols.iter().map(|protocol| protocol.to_string()).collect(),
        metadata: stored
            .metadata
            .iter()
            .map(|(key, value)| schema::MetadataEntry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect(),
        tags: stored
            .tags
            .iter()
            .filter(|(_, tag)| !tag.expired())
            .map(|(name, tag)| schema::StoredTag {
                name: name.clone(),
                value: tag.value as u32,
                expires_at_millis: tag.expires_at.map(|at| {
                    now_millis().saturating_add(at.saturating_duration_since(now).as_millis() as u64)
                }),
            })
            .collect(),
        peer_record_envelope: stored.peer_record_envelope.clone(),
        public_key: stored.public_key.as_ref().map(|key| key.to_protobuf_encoding()),
    };

    let mut bytes = Vec::with_capacity(entry.encoded_len());
    entry.encode(&mut bytes).expect("buffer to have sufficient capacity");
    bytes
}

fn decode_stored_peer(bytes: &[u8]) -> crate::Result<StoredPeer> {
    let entry = schema::PeerEntry::decode(bytes)?;
    let now = now_millis();

    let peer_record_envelope = entry.peer_record_envelope;
    let record_seq = peer_record_envelope.as_deref().and_then(record_seq);

    Ok(StoredPeer {
        addresses: entry
            .addresses
            .into_iter()
            .filter_map(|address| {
                Some(AddressEntry {
                    multiaddr: Multiaddr::try_from(address.multiaddr).ok()?,
                    is_certified: address.is_certified,
                    last_success: address.last_success,
                    last_failure: address.last_failure,
                })
            })
            .collect(),
        protocols: entry
            .protocols
            .into_iter()
            .map(ProtocolName::from)
            .collect(),
        metadata: entry
            .metadata
            .into_iter()
            .map(|metadata| (metadata.key, metadata.value))
            .collect(),
        tags: entry
            .tags
            .into_iter()
            .filter(|tag| tag.expires_at_millis.map_or(true, |at| at > now))
            .map(|tag| {
                let expires_at = tag
                    .expires_at_millis
                    .map(|at| Instant::now() + Duration::from_millis(at - now));
                (
                    tag.name,
                    TagEntry {
                        value: tag.value.min(MAX_TAG_VALUE as u32) as u8,
                        expires_at,
                    },
                )
            })
            .collect(),
        peer_record_envelope,
        record_seq,
        public_key: entry
            .public_key
            .and_then(|key| PublicKey::from_protobuf_encoding(&key).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::ed25519::Keypair, record::PeerRecord};

    async fn store() -> (PeerStore, EventBus) {
        let bus = EventBus::new(64);
        let store = PeerStore::new(Arc::new(MemoryDatastore::default()), bus.clone())
            .await
            .unwrap();
        (store, bus)
    }

    #[tokio::test]
    async fn unknown_peer_is_not_found() {
        let (store, _bus) = store().await;

        match store.get(&PeerId::random()) {
            Err(Error::NotFound) => {}
            result => panic!("expected not found, got {result:?}"),
        }
    }

    #[tokio::test]
    async fn merge_unions_and_deduplicates_addresses() {
        let (store, _bus) = store().await;
        let peer = PeerId::random();
        let address: Multiaddr = "/memory/1".parse().unwrap();

        store
            .merge(
                peer,
                PeerUpdate {
                    multiaddrs: Some(vec![address.clone().into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // Same address again, this time certified.
        let info = store
            .merge(
                peer,
                PeerUpdate {
                    multiaddrs: Some(vec![AddressUpdate {
                        multiaddr: address.clone(),
                        is_certified: true,
                    }]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(info.addresses.len(), 1);
        assert!(info.addresses[0].is_certified);
    }

    #[tokio::test]
    async fn first_insertion_emits_discovery_then_update() {
        let (store, bus) = store().await;
        let mut rx = bus.subscribe();
        let peer = PeerId::random();

        store
            .merge(
                peer,
                PeerUpdate {
                    protocols: Some(vec!["/echo/1.0.0".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            Meshp2pEvent::PeerDiscovered { peer: info } => assert_eq!(info.peer_id, peer),
            event => panic!("unexpected event: {event:?}"),
        }
        match rx.recv().await.unwrap() {
            Meshp2pEvent::PeerUpdated { current, previous } => {
                assert_eq!(current.peer_id, peer);
                assert!(previous.is_none());
            }
            event => panic!("unexpected event: {event:?}"),
        }
    }

    #[tokio::test]
    async fn stored_record_seq_never_decreases() {
        let (store, _bus) = store().await;
        let keypair = Keypair::generate();
        let peer = crate::crypto::PublicKey::Ed25519(keypair.public()).to_peer_id();
        let address: Multiaddr = "/memory/1".parse().unwrap();

        let newer = PeerRecord::new(peer, 10, vec![address.clone()]).seal(&keypair);
        let older = PeerRecord::new(peer, 3, vec![address]).seal(&keypair);

        store
            .merge(
                peer,
                PeerUpdate { peer_record_envelope: Some(newer.clone()), ..Default::default() },
            )
            .await
            .unwrap();

        let info = store
            .merge(peer, PeerUpdate { peer_record_envelope: Some(older), ..Default::default() })
            .await
            .unwrap();

        assert_eq!(info.peer_record_envelope, Some(newer));
    }

    #[tokio::test]
    async fn expired_tags_are_invisible() {
        let (store, _bus) = store().await;
        let peer = PeerId::random();

        store
            .tag_peer(
                peer,
                "short-lived",
                TagOptions { value: 50, ttl: Some(Duration::from_millis(20)) },
            )
            .await
            .unwrap();
        store.tag_peer(peer, "permanent", TagOptions { value: 10, ttl: None }).await.unwrap();

        assert_eq!(store.get_tags(&peer).unwrap().len(), 2);

        tokio::time::sleep(Duration::from_millis(40)).await;

        let tags = store.get_tags(&peer).unwrap();
        assert_eq!(tags, vec![("permanent".to_string(), 10)]);
        assert_eq!(store.get(&peer).unwrap().tag_sum(), 10);
    }

    #[tokio::test]
    async fn tag_value_above_limit_is_rejected() {
        let (store, _bus) = store().await;

        match store
            .tag_peer(PeerId::random(), "too-big", TagOptions { value: 101, ttl: None })
            .await
        {
            Err(Error::InvalidParameters(_)) => {}
            result => panic!("expected invalid parameters, got {result:?}"),
        }
    }

    #[tokio::test]
    async fn entries_survive_reload_from_datastore() {
        let datastore = Arc::new(MemoryDatastore::default());
        let bus = EventBus::new(64);
        let peer = PeerId::random();

        {
            let store = PeerStore::new(datastore.clone(), bus.clone()).await.unwrap();
            store
                .merge(
                    peer,
                    PeerUpdate {
                        multiaddrs: Some(vec!["/memory/1".parse::<Multiaddr>().unwrap().into()]),
                        protocols: Some(vec!["/echo/1.0.0".into()]),
                        metadata: Some(vec![(
                            METADATA_AGENT_VERSION.to_string(),
                            Some(b"meshp2p/0.1.0".to_vec()),
                        )]),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let reloaded = PeerStore::new(datastore, bus).await.unwrap();
        let info = reloaded.get(&peer).unwrap();

        assert_eq!(info.addresses.len(), 1);
        assert_eq!(info.protocols, vec!["/echo/1.0.0".into()]);
        assert_eq!(
            info.metadata.get(METADATA_AGENT_VERSION).map(Vec::as_slice),
            Some(&b"meshp2p/0.1.0"[..]),
        );
    }

    #[tokio::test]
    async fn patch_replaces_only_named_fields() {
        let (store, _bus) = store().await;
        let peer = PeerId::random();

        store
            .save(
                peer,
                PeerUpdate {
                    multiaddrs: Some(vec!["/memory/1".parse::<Multiaddr>().unwrap().into()]),
                    protocols: Some(vec!["/echo/1.0.0".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let info = store
            .patch(
                peer,
                PeerUpdate {
                    protocols: Some(vec!["/other/1.0.0".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(info.protocols, vec!["/other/1.0.0".into()]);
        // Addresses were not part of the patch.
        assert_eq!(info.addresses.len(), 1);
    }
}
