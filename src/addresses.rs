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

//! Tracking of the node's own addresses.
//!
//! Known self-addresses fall into three partitions: listen addresses bound by
//! transports, announce addresses configured as advertisement overrides, and
//! observed addresses learned from remote peers. An observed address joins
//! the advertised set only once it has been confirmed. Changes to the
//! advertised set are debounced before the self peer-store entry is patched
//! and a self-update event fires.

use crate::{
    bus::{EventBus, Meshp2pEvent},
    error::{AddressError, Error},
    peer_id::PeerId,
    peer_store::{PeerStore, PeerUpdate},
};

use indexmap::IndexMap;
use multiaddr::{Multiaddr, Protocol};
use multihash::Multihash;
use parking_lot::RwLock;

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

/// Logging target for the file.
const LOG_TARGET: &str = "meshp2p::address-manager";

/// Coalescing window for self-update announcements.
const SELF_UPDATE_DEBOUNCE: Duration = Duration::from_secs(1);

/// User-supplied filter applied to the advertised address set.
pub type AnnounceFilter = Arc<dyn Fn(Vec<Multiaddr>) -> Vec<Multiaddr> + Send + Sync>;

/// Manager of the node's own addresses.
#[derive(Clone)]
pub struct AddressManager {
    inner: Arc<AddressManagerInner>,
}

struct AddressManagerInner {
    local_peer: PeerId,

    /// Listen addresses, shared with the transport manager which maintains
    /// them as listeners come and go.
    listen: Arc<RwLock<HashSet<Multiaddr>>>,

    /// Configured announce overrides.
    announce: Vec<Multiaddr>,

    /// Filter applied last to the advertised set.
    announce_filter: Option<AnnounceFilter>,

    /// Addresses remote peers observed us at.
    observed: RwLock<IndexMap<Multiaddr, ObservedAddress>>,

    /// Cap on the observed set.
    max_observed: usize,

    /// IP-to-domain rewrites applied to advertised addresses.
    dns_mappings: RwLock<HashMap<String, Vec<IpAddr>>>,

    peer_store: PeerStore,
    bus: EventBus,

    /// Bumped on every advertised-set change; the debounce task publishes
    /// only if its generation is still current after the window.
    update_generation: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct ObservedAddress {
    confident: bool,
}

impl AddressManager {
    /// Create a new address manager.
    pub fn new(
        local_peer: PeerId,
        listen: Arc<RwLock<HashSet<Multiaddr>>>,
        announce: Vec<Multiaddr>,
        announce_filter: Option<AnnounceFilter>,
        max_observed: usize,
        peer_store: PeerStore,
        bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(AddressManagerInner {
                local_peer,
                listen,
                announce,
                announce_filter,
                observed: RwLock::new(IndexMap::new()),
                max_observed,
                dns_mappings: RwLock::new(HashMap::new()),
                peer_store,
                bus,
                update_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Addresses transports are currently listening on.
    pub fn get_listen_addrs(&self) -> Vec<Multiaddr> {
        self.inner.listen.read().iter().cloned().collect()
    }

    /// Configured announce overrides.
    pub fn get_announce_addrs(&self) -> Vec<Multiaddr> {
        self.inner.announce.clone()
    }

    /// Addresses remote peers observed us at, confirmed or not.
    pub fn get_observed_addrs(&self) -> Vec<Multiaddr> {
        self.inner.observed.read().keys().cloned().collect()
    }

    /// Record an address a remote peer observed us at.
    ///
    /// New addresses start unconfirmed. The set is capped; additions beyond
    /// the cap are dropped.
    pub fn add_observed_addr(&self, address: Multiaddr) {
        let address = strip_peer_id(&address);
        let mut observed = self.inner.observed.write();

        if observed.contains_key(&address) {
            return;
        }
        if observed.len() >= self.inner.max_observed {
            tracing::trace!(target: LOG_TARGET, ?address, "observed address set is full");
            return;
        }

        tracing::debug!(target: LOG_TARGET, ?address, "new observed address");
        observed.insert(address, ObservedAddress { confident: false });
    }

    /// Mark an observed address as externally confirmed.
    ///
    /// A transition to confirmed changes the advertised set and schedules a
    /// self-update.
    pub fn confirm_observed_addr(&self, address: &Multiaddr) {
        let address = strip_peer_id(address);
        let transitioned = {
            let mut observed = self.inner.observed.write();
            match observed.get_mut(&address) {
                Some(entry) if entry.confident => false,
                Some(entry) => {
                    entry.confident = true;
                    true
                }
                None => {
                    if observed.len() >= self.inner.max_observed {
                        return;
                    }
                    observed.insert(address.clone(), ObservedAddress { confident: true });
                    true
                }
            }
        };

        if transitioned {
            tracing::debug!(target: LOG_TARGET, ?address, "observed address confirmed");
            self.schedule_self_update();
        }
    }

    /// Remove an observed address.
    pub fn remove_observed_addr(&self, address: &Multiaddr) {
        let address = strip_peer_id(address);
        let removed = self.inner.observed.write().shift_remove(&address);

        if matches!(removed, Some(ObservedAddress { confident: true })) {
            self.schedule_self_update();
        }
    }

    /// The set of addresses the node advertises.
    ///
    /// Announce overrides replace listen addresses when configured; confirmed
    /// observed addresses are always included. Non-path entries get the local
    /// peer ID appended.
    pub fn get_addresses(&self) -> Vec<Multiaddr> {
        let mut addresses = if self.inner.announce.is_empty() {
            self.get_listen_addrs()
        } else {
            self.inner.announce.clone()
        };

        addresses.extend(
            self.inner
                .observed
                .read()
                .iter()
                .filter(|(_, entry)| entry.confident)
                .map(|(address, _)| address.clone()),
        );

        let mappings = self.inner.dns_mappings.read();
        let mut seen = HashSet::new();
        let mut result = Vec::with_capacity(addresses.len());

        for address in addresses {
            let address = apply_dns_mappings(address, &mappings);
            let address = if is_path_address(&address) {
                address
            } else {
                ensure_peer_id(strip_peer_id(&address), &self.inner.local_peer)
            };

            if seen.insert(address.to_string()) {
                result.push(address);
            }
        }

        match &self.inner.announce_filter {
            Some(filter) => filter(result),
            None => result,
        }
    }

    /// Map `domain` to a set of IP addresses for advertisement rewriting.
    pub fn add_dns_mapping(&self, domain: String, ips: Vec<IpAddr>) {
        self.inner.dns_mappings.write().insert(domain, ips);
        self.schedule_self_update();
    }

    /// Remove a DNS mapping.
    pub fn remove_dns_mapping(&self, domain: &str) {
        if self.inner.dns_mappings.write().remove(domain).is_some() {
            self.schedule_self_update();
        }
    }

    /// Notify the manager that transports started or stopped listening.
    pub fn on_listen_addresses_changed(&self) {
        self.schedule_self_update();
    }

    /// Debounce-publish the advertised set into the self peer-store entry.
    fn schedule_self_update(&self) {
        let generation = self.inner.update_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = self.inner.clone();
        let manager = self.clone();

        tokio::spawn(async move {
            tokio::time::sleep(SELF_UPDATE_DEBOUNCE).await;

            // A newer change restarted the window.
            if inner.update_generation.load(Ordering::SeqCst) != generation {
                return;
            }

            let addresses = manager.get_addresses();
            tracing::trace!(target: LOG_TARGET, ?addresses, "publishing self addresses");

            match inner
                .peer_store
                .patch(
                    inner.local_peer,
                    PeerUpdate {
                        multiaddrs: Some(addresses.into_iter().map(Into::into).collect()),
                        ..Default::default()
                    },
                )
                .await
            {
                Ok(info) => inner.bus.emit(Meshp2pEvent::LocalPeerUpdated { peer: Arc::new(info) }),
                Err(error) => {
                    tracing::warn!(target: LOG_TARGET, ?error, "failed to patch self peer entry");
                }
            }
        });
    }
}

/// Whether the address is a path form that must not carry a peer ID suffix.
pub(crate) fn is_path_address(address: &Multiaddr) -> bool {
    address.iter().any(|protocol| matches!(protocol, Protocol::Unix(_)))
}

/// Drop a trailing `/p2p/<peer>` component, if any.
pub(crate) fn strip_peer_id(address: &Multiaddr) -> Multiaddr {
    address
        .iter()
        .take_while(|protocol| !matches!(protocol, Protocol::P2p(_)))
        .collect()
}

/// Append `/p2p/<peer>` unless the address already ends in a peer ID.
pub(crate) fn ensure_peer_id(address: Multiaddr, peer: &PeerId) -> Multiaddr {
    match address.iter().last() {
        Some(Protocol::P2p(_)) => address,
        _ => address.with(Protocol::P2p(Multihash::from(*peer))),
    }
}

/// Extract the peer ID from a trailing `/p2p` component.
pub(crate) fn peer_id_from_address(address: &Multiaddr) -> crate::Result<Option<PeerId>> {
    match address.iter().last() {
        Some(Protocol::P2p(multihash)) => PeerId::from_multihash(multihash)
            .map(Some)
            .map_err(|_| Error::AddressError(AddressError::InvalidPeerId)),
        _ => Ok(None),
    }
}

/// Rewrite the IP component to a mapped DNS name, if one matches.
fn apply_dns_mappings(address: Multiaddr, mappings: &HashMap<String, Vec<IpAddr>>) -> Multiaddr {
    if mappings.is_empty() {
        return address;
    }

    let mut iter = address.iter();
    let replacement = match iter.next() {
        Some(Protocol::Ip4(ip)) => mappings
            .iter()
            .find(|(_, ips)| ips.contains(&IpAddr::V4(ip)))
            .map(|(domain, _)| Protocol::Dns4(domain.clone().into())),
        Some(Protocol::Ip6(ip)) => mappings
            .iter()
            .find(|(_, ips)| ips.contains(&IpAddr::V6(ip)))
            .map(|(domain, _)| Protocol::Dns6(domain.clone().into())),
        _ => None,
    };

    match replacement {
        Some(first) => {
            let mut rewritten = Multiaddr::empty();
            rewritten.push(first);
            for protocol in iter {
                rewritten.push(protocol);
            }
            rewritten
        }
        None => address,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_store::MemoryDatastore;

    async fn manager() -> (AddressManager, Arc<RwLock<HashSet<Multiaddr>>>, EventBus, PeerId) {
        let bus = EventBus::new(64);
        let peer_store = PeerStore::new(Arc::new(MemoryDatastore::default()), bus.clone())
            .await
            .unwrap();
        let listen = Arc::new(RwLock::new(HashSet::new()));
        let local_peer = PeerId::random();
        let manager = AddressManager::new(
            local_peer,
            listen.clone(),
            Vec::new(),
            None,
            8,
            peer_store,
            bus.clone(),
        );

        (manager, listen, bus, local_peer)
    }

    #[tokio::test]
    async fn observed_address_advertised_only_once_confirmed() {
        let (manager, _listen, _bus, local_peer) = manager().await;
        let address: Multiaddr = "/ip4/192.0.2.1/tcp/4001".parse().unwrap();

        manager.add_observed_addr(address.clone());
        assert!(manager.get_addresses().is_empty());

        manager.confirm_observed_addr(&address);
        let advertised = manager.get_addresses();

        assert_eq!(advertised.len(), 1);
        assert_eq!(
            advertised[0],
            address.with(Protocol::P2p(Multihash::from(local_peer)))
        );
    }

    #[tokio::test]
    async fn announce_addresses_override_listen_addresses() {
        let bus = EventBus::new(64);
        let peer_store = PeerStore::new(Arc::new(MemoryDatastore::default()), bus.clone())
            .await
            .unwrap();
        let listen = Arc::new(RwLock::new(HashSet::from_iter([
            "/memory/1".parse::<Multiaddr>().unwrap()
        ])));
        let announce: Multiaddr = "/ip4/203.0.113.5/tcp/4001".parse().unwrap();
        let manager = AddressManager::new(
            PeerId::random(),
            listen,
            vec![announce.clone()],
            None,
            8,
            peer_store,
            bus,
        );

        let advertised = manager.get_addresses();
        assert_eq!(advertised.len(), 1);
        assert!(advertised[0].to_string().starts_with("/ip4/203.0.113.5/tcp/4001"));
    }

    #[tokio::test]
    async fn observed_addresses_are_capped() {
        let (manager, _listen, _bus, _local_peer) = manager().await;

        for port in 0..20u16 {
            manager.add_observed_addr(format!("/ip4/192.0.2.1/tcp/{port}").parse().unwrap());
        }

        assert_eq!(manager.get_observed_addrs().len(), 8);
    }

    #[tokio::test]
    async fn dns_mapping_rewrites_matching_ip() {
        let (manager, listen, _bus, _local_peer) = manager().await;
        listen.write().insert("/ip4/203.0.113.5/tcp/4001".parse().unwrap());

        manager.add_dns_mapping("node.example.com".to_string(), vec!["203.0.113.5".parse().unwrap()]);

        let advertised = manager.get_addresses();
        assert!(advertised[0].to_string().starts_with("/dns4/node.example.com/tcp/4001"));
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_debounces_into_one_self_update() {
        let (manager, _listen, bus, _local_peer) = manager().await;
        let mut rx = bus.subscribe();

        manager.add_observed_addr("/ip4/192.0.2.1/tcp/1".parse().unwrap());
        manager.add_observed_addr("/ip4/192.0.2.1/tcp/2".parse().unwrap());
        manager.confirm_observed_addr(&"/ip4/192.0.2.1/tcp/1".parse().unwrap());
        manager.confirm_observed_addr(&"/ip4/192.0.2.1/tcp/2".parse().unwrap());

        // Both confirmations fall inside one debounce window.
        let mut self_updates = 0;
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Ok(Meshp2pEvent::LocalPeerUpdated { peer })) => {
                    self_updates += 1;
                    assert_eq!(peer.addresses.len(), 2);
                }
                Ok(Ok(_)) => {}
                _ => break,
            }
        }

        assert_eq!(self_updates, 1);
    }
}
