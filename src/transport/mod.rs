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

//! Transport abstraction and dispatch.
//!
//! The transport manager owns the registered transports and routes each dial
//! or listen request to the transport claiming the address. Raw inbound
//! connections are forwarded over a channel; the node applies its inbound
//! limits before upgrading them.

use crate::{
    bus::{EventBus, Meshp2pEvent},
    error::{AddressError, Error},
};

use multiaddr::Multiaddr;
use parking_lot::RwLock;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc::Sender,
};
use tokio_util::sync::CancellationToken;

use std::{collections::HashSet, sync::Arc};

pub mod memory;

/// Logging target for the file.
const LOG_TARGET: &str = "meshp2p::transport";

/// A raw byte-stream connection produced by a transport.
pub trait RawConnection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawConnection for T {}

/// A transport capable of dialing and listening on some address family.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Short tag identifying the transport, e.g. `memory`.
    fn tag(&self) -> &'static str;

    /// Whether this transport can dial `address`.
    fn can_dial(&self, address: &Multiaddr) -> bool;

    /// Dial `address`.
    ///
    /// The dial must stop and release its resources when `abort` fires.
    async fn dial(
        &self,
        address: Multiaddr,
        abort: CancellationToken,
    ) -> crate::Result<Box<dyn RawConnection>>;

    /// Start listening on `address`.
    async fn listen(&self, address: Multiaddr) -> crate::Result<Box<dyn TransportListener>>;
}

/// An active listener of a transport.
#[async_trait::async_trait]
pub trait TransportListener: Send {
    /// The resolved local address, with wildcard ports filled in.
    fn local_address(&self) -> Multiaddr;

    /// Wait for the next inbound raw connection.
    async fn accept(&mut self) -> crate::Result<(Box<dyn RawConnection>, Multiaddr)>;
}

/// A raw inbound connection awaiting upgrade.
pub struct InboundRawConnection {
    /// The raw byte stream.
    pub io: Box<dyn RawConnection>,

    /// Address the connection arrived on.
    pub local_address: Multiaddr,

    /// Address of the dialing side.
    pub remote_address: Multiaddr,
}

/// Owner and dispatcher of the registered transports.
pub struct TransportManager {
    transports: Vec<Arc<dyn Transport>>,

    /// Addresses currently bound by listeners. Shared with the address
    /// manager.
    listen_addresses: Arc<RwLock<HashSet<Multiaddr>>>,
}

impl TransportManager {
    /// Create a new manager over `transports`.
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> crate::Result<Self> {
        if transports.is_empty() {
            return Err(Error::TransportsRequired);
        }

        Ok(Self {
            transports,
            listen_addresses: Arc::new(RwLock::new(HashSet::new())),
        })
    }

    /// Shared handle to the live listen-address set.
    pub fn listen_addresses(&self) -> Arc<RwLock<HashSet<Multiaddr>>> {
        self.listen_addresses.clone()
    }

    /// Find the transport claiming `address`.
    pub fn transport_for(&self, address: &Multiaddr) -> Option<Arc<dyn Transport>> {
        self.transports.iter().find(|transport| transport.can_dial(address)).cloned()
    }

    /// Whether any registered transport can dial `address`.
    pub fn supports(&self, address: &Multiaddr) -> bool {
        self.transport_for(address).is_some()
    }

    /// Whether `address` is one of our own listen addresses.
    pub fn is_listen_address(&self, address: &Multiaddr) -> bool {
        let stripped = crate::addresses::strip_peer_id(address);
        self.listen_addresses
            .read()
            .iter()
            .any(|listen| crate::addresses::strip_peer_id(listen) == stripped)
    }

    /// Dial `address` over the matching transport.
    pub async fn dial(
        &self,
        address: Multiaddr,
        abort: CancellationToken,
    ) -> crate::Result<Box<dyn RawConnection>> {
        let transport = self
            .transport_for(&address)
            .ok_or_else(|| Error::AddressError(AddressError::TransportNotSupported(address.clone())))?;

        tracing::trace!(
            target: LOG_TARGET,
            ?address,
            transport = transport.tag(),
            "dial remote peer",
        );

        transport.dial(address, abort).await
    }

    /// Bind listeners for `addresses` and forward accepted raw connections to
    /// `inbound_tx` until `shutdown` fires.
    pub async fn listen(
        &self,
        addresses: Vec<Multiaddr>,
        inbound_tx: Sender<InboundRawConnection>,
        shutdown: CancellationToken,
        bus: EventBus,
    ) -> crate::Result<()> {
        for address in addresses {
            let transport = self.transport_for(&address).ok_or_else(|| {
                Error::AddressError(AddressError::TransportNotSupported(address.clone()))
            })?;

            let mut listener = transport.listen(address.clone()).await?;
            let local_address = listener.local_address();

            tracing::debug!(
                target: LOG_TARGET,
                address = ?local_address,
                transport = transport.tag(),
                "transport listening",
            );

            self.listen_addresses.write().insert(local_address.clone());
            bus.emit(Meshp2pEvent::ListenerReady { address: local_address.clone() });

            let inbound_tx = inbound_tx.clone();
            let shutdown = shutdown.clone();
            let bus = bus.clone();
            let listen_addresses = self.listen_addresses.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((io, remote_address)) => {
                                let inbound = InboundRawConnection {
                                    io,
                                    local_address: local_address.clone(),
                                    remote_address,
                                };
                                if inbound_tx.send(inbound).await.is_err() {
                                    break;
                                }
                            }
                            Err(error) => {
                                tracing::warn!(
                                    target: LOG_TARGET,
                                    address = ?local_address,
                                    ?error,
                                    "listener failed",
                                );
                                break;
                            }
                        },
                        _ = shutdown.cancelled() => break,
                    }
                }

                listen_addresses.write().remove(&local_address);
                bus.emit(Meshp2pEvent::ListenerClosed { address: local_address });
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{memory::MemoryHub, *};

    #[test]
    fn manager_requires_at_least_one_transport() {
        match TransportManager::new(Vec::new()) {
            Err(Error::TransportsRequired) => {}
            result => panic!("expected transports-required error, got {:?}", result.is_ok()),
        }
    }

    #[tokio::test]
    async fn dial_over_unclaimed_address_fails() {
        let hub = MemoryHub::default();
        let manager =
            TransportManager::new(vec![Arc::new(memory::MemoryTransport::new(hub)) as _]).unwrap();

        let result = manager
            .dial("/ip4/127.0.0.1/tcp/8888".parse().unwrap(), CancellationToken::new())
            .await;

        assert!(matches!(
            result.map(drop),
            Err(Error::AddressError(AddressError::TransportNotSupported(_)))
        ));
    }

    #[tokio::test]
    async fn accepted_connections_are_forwarded() {
        let hub = MemoryHub::default();
        let manager =
            TransportManager::new(vec![Arc::new(memory::MemoryTransport::new(hub.clone())) as _])
                .unwrap();
        let (inbound_tx, mut inbound_rx) = tokio::sync::mpsc::channel(4);
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();

        manager
            .listen(
                vec!["/memory/0".parse().unwrap()],
                inbound_tx,
                CancellationToken::new(),
                bus,
            )
            .await
            .unwrap();

        let listen_address = match events.recv().await.unwrap() {
            Meshp2pEvent::ListenerReady { address } => address,
            event => panic!("unexpected event: {event:?}"),
        };
        assert!(manager.is_listen_address(&listen_address));

        let _dialed =
            manager.dial(listen_address.clone(), CancellationToken::new()).await.unwrap();
        let inbound = inbound_rx.recv().await.unwrap();

        assert_eq!(inbound.local_address, listen_address);
    }
}
