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

//! Typed intra-node event bus.
//!
//! Components publish to one broadcast channel; any number of service loops
//! subscribe. Emission is a synchronous enqueue in the emitter's turn, so
//! per-emitter ordering is preserved. Subscribers that must await fan out to
//! their own tasks.

use crate::{
    connection::Connection, peer_id::PeerId, peer_store::PeerInfo,
    protocol::identify::IdentifyInfo, types::ConnectionId,
};

use multiaddr::Multiaddr;
use tokio::sync::broadcast;

use std::sync::Arc;

/// Logging target for the file.
const LOG_TARGET: &str = "meshp2p::bus";

/// Events emitted by the node.
#[derive(Debug, Clone)]
pub enum Meshp2pEvent {
    /// A connection finished upgrading and entered the inventory.
    ConnectionEstablished {
        /// The opened connection.
        connection: Arc<Connection>,
    },

    /// A connection reached its terminal state.
    ConnectionClosed {
        /// Remote peer ID.
        peer: PeerId,

        /// Connection ID.
        connection: ConnectionId,
    },

    /// A peer-store entry changed.
    PeerUpdated {
        /// State after the mutation.
        current: Arc<PeerInfo>,

        /// State before the mutation; `None` for the first insertion.
        previous: Option<Arc<PeerInfo>>,
    },

    /// A peer was seen for the first time.
    PeerDiscovered {
        /// The newly inserted entry.
        peer: Arc<PeerInfo>,
    },

    /// Identify completed on a connection.
    PeerIdentified {
        /// The full identify result.
        info: Arc<IdentifyInfo>,
    },

    /// The local node's advertised addresses or protocols changed.
    LocalPeerUpdated {
        /// Self peer-store entry after the change.
        peer: Arc<PeerInfo>,
    },

    /// A transport started listening.
    ListenerReady {
        /// Listen address.
        address: Multiaddr,
    },

    /// A transport listener closed.
    ListenerClosed {
        /// Listen address.
        address: Multiaddr,
    },
}

/// The node's event bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Meshp2pEvent>,
}

impl EventBus {
    /// Create a new bus with room for `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<Meshp2pEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`.
    ///
    /// Items are `Err` only when the subscriber lagged behind and events were
    /// dropped.
    pub fn event_stream(
        &self,
    ) -> tokio_stream::wrappers::BroadcastStream<Meshp2pEvent> {
        tokio_stream::wrappers::BroadcastStream::new(self.tx.subscribe())
    }

    /// Publish an event to all current subscribers.
    pub fn emit(&self, event: Meshp2pEvent) {
        tracing::trace!(target: LOG_TARGET, ?event, "emit event");

        // An error only means there is no subscriber right now.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_all_subscribers_in_order() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let address1: Multiaddr = "/memory/1".parse().unwrap();
        let address2: Multiaddr = "/memory/2".parse().unwrap();

        bus.emit(Meshp2pEvent::ListenerReady { address: address1.clone() });
        bus.emit(Meshp2pEvent::ListenerClosed { address: address2.clone() });

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                Meshp2pEvent::ListenerReady { address } => assert_eq!(address, address1),
                event => panic!("unexpected event: {event:?}"),
            }
            match rx.recv().await.unwrap() {
                Meshp2pEvent::ListenerClosed { address } => assert_eq!(address, address2),
                event => panic!("unexpected event: {event:?}"),
            }
        }
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_a_no_op() {
        let bus = EventBus::new(16);
        bus.emit(Meshp2pEvent::ListenerReady { address: "/memory/1".parse().unwrap() });
    }

    #[tokio::test]
    async fn event_stream_yields_events() {
        use futures::StreamExt;

        let bus = EventBus::new(16);
        let mut stream = bus.event_stream();

        let address: Multiaddr = "/memory/1".parse().unwrap();
        bus.emit(Meshp2pEvent::ListenerReady { address: address.clone() });

        match stream.next().await.unwrap().unwrap() {
            Meshp2pEvent::ListenerReady { address: received } => assert_eq!(received, address),
            event => panic!("unexpected event: {event:?}"),
        }
    }
}
