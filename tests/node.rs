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

//! Two-node scenarios over the in-memory transport.

use meshp2p::{
    config::{Config, ConfigBuilder},
    connection::manager::ConnectionLimits,
    crypto::ed25519::Keypair,
    mux::mplex::Mplex,
    peer_store::{AddressUpdate, PeerUpdate, TagOptions},
    protocol::identify::{PROTOCOL_NAME as IDENTIFY, PUSH_PROTOCOL_NAME as IDENTIFY_PUSH},
    registrar::StreamHandlerOptions,
    security::plaintext::PlainText,
    transport::{
        memory::{MemoryHub, MemoryTransport},
        RawConnection, Transport, TransportListener,
    },
    Meshp2p, Meshp2pEvent,
};

use multiaddr::Multiaddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn node_config(hub: MemoryHub) -> Config {
    node_config_with_limits(hub, ConnectionLimits::default())
}

fn node_config_with_limits(hub: MemoryHub, limits: ConnectionLimits) -> Config {
    let keypair = Keypair::generate();

    ConfigBuilder::new()
        .with_transport(Arc::new(MemoryTransport::new(hub)))
        .with_security(Arc::new(PlainText::new(keypair.clone())))
        .with_muxer(Arc::new(Mplex))
        .with_keypair(keypair)
        .with_listen_address("/memory/0".parse().unwrap())
        .with_connection_limits(limits)
        .build()
}

async fn started_node(hub: MemoryHub) -> Meshp2p {
    let mut node = Meshp2p::new(node_config(hub)).await.unwrap();
    node.start().await.unwrap();
    node
}

/// Scenario A: dialing our own peer ID is rejected and leaves no pending
/// dial behind.
#[tokio::test]
async fn dial_self_is_rejected() {
    init_logging();

    let node = started_node(MemoryHub::default()).await;

    match node.dial(*node.local_peer_id()).await {
        Err(error) => assert_eq!(error.code(), "ERR_DIALED_SELF"),
        Ok(_) => panic!("dial to self succeeded"),
    }

    assert!(node.connection_manager().get_dial_queue().is_empty());
}

/// Scenario B: a dial is followed by identify, which populates the dialer's
/// peer store with the remote's protocols.
#[tokio::test]
async fn identify_runs_on_new_connections() {
    init_logging();

    let hub = MemoryHub::default();
    let node1 = started_node(hub.clone()).await;
    let node2 = started_node(hub).await;
    let mut events = node1.subscribe();

    let address = node2.listen_addresses().pop().unwrap();
    let connection = node1.dial(address).await.unwrap();
    assert_eq!(connection.peer(), *node2.local_peer_id());

    // Identify completes shortly after connection:open.
    let info = loop {
        match tokio::time::timeout(Duration::from_millis(200), events.recv())
            .await
            .expect("identify to finish within 200ms")
            .unwrap()
        {
            Meshp2pEvent::PeerIdentified { info } => break info,
            _ => {}
        }
    };

    assert_eq!(info.peer, *node2.local_peer_id());
    assert!(info.signed_peer_record.is_some());

    let stored = node1.peer_store().get(node2.local_peer_id()).unwrap();
    for protocol in [IDENTIFY, IDENTIFY_PUSH] {
        assert!(
            stored.protocols.iter().any(|stored| stored.as_str() == protocol),
            "missing {protocol} in stored protocols: {:?}",
            stored.protocols,
        );
    }

    // Identify carried a valid signed record, so at least one stored
    // address is certified.
    assert!(stored.addresses.iter().any(|address| address.is_certified));
}

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
    ) -> meshp2p::Result<Box<dyn RawConnection>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.inner.dial(address, abort).await
    }

    async fn listen(&self, address: Multiaddr) -> meshp2p::Result<Box<dyn TransportListener>> {
        self.inner.listen(address).await
    }
}

/// Scenario C: ten concurrent dials to the same peer share one underlying
/// dial and resolve with the same connection.
#[tokio::test]
async fn concurrent_dials_deduplicate() {
    init_logging();

    let hub = MemoryHub::default();
    let dials = Arc::new(AtomicUsize::new(0));
    let keypair = Keypair::generate();

    let config = ConfigBuilder::new()
        .with_transport(Arc::new(CountingTransport {
            inner: MemoryTransport::new(hub.clone()),
            dials: dials.clone(),
        }))
        .with_security(Arc::new(PlainText::new(keypair.clone())))
        .with_muxer(Arc::new(Mplex))
        .with_keypair(keypair)
        .build();

    let mut node1 = Meshp2p::new(config).await.unwrap();
    node1.start().await.unwrap();
    let node2 = started_node(hub).await;

    let remote_peer = *node2.local_peer_id();
    node1
        .peer_store()
        .merge(
            remote_peer,
            PeerUpdate {
                multiaddrs: Some(vec![AddressUpdate {
                    multiaddr: node2.listen_addresses().pop().unwrap(),
                    is_certified: false,
                }]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let node1 = Arc::new(node1);
    let mut calls = Vec::new();
    for _ in 0..10 {
        let node = node1.clone();
        calls.push(tokio::spawn(async move { node.dial(remote_peer).await }));
    }

    let mut connections = Vec::new();
    for call in calls {
        connections.push(call.await.unwrap().unwrap());
    }

    let first = connections[0].id();
    assert!(connections.iter().all(|connection| connection.id() == first));
    assert_eq!(dials.load(Ordering::SeqCst), 1, "transport dialed more than once");
}

/// Scenario D: when the third connection breaches `max_connections = 2`, the
/// lowest-tag-sum connection among the previous ones is pruned.
#[tokio::test]
async fn pruning_follows_tag_order() {
    init_logging();

    let hub = MemoryHub::default();
    let mut listener = Meshp2p::new(node_config_with_limits(
        hub.clone(),
        ConnectionLimits {
            max_connections: 2,
            min_connections: 0,
            ..Default::default()
        },
    ))
    .await
    .unwrap();
    listener.start().await.unwrap();
    let address = listener.listen_addresses().pop().unwrap();

    let peer1 = started_node(hub.clone()).await;
    let peer2 = started_node(hub.clone()).await;
    let peer3 = started_node(hub).await;

    let _connection1 = peer1.dial(address.clone()).await.unwrap();
    let _connection2 = peer2.dial(address.clone()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(listener.connection_manager().connection_count(), 2);

    listener
        .peer_store()
        .tag_peer(*peer1.local_peer_id(), "valued", TagOptions { value: 80, ttl: None })
        .await
        .unwrap();
    listener
        .peer_store()
        .tag_peer(*peer2.local_peer_id(), "barely", TagOptions { value: 10, ttl: None })
        .await
        .unwrap();

    let _connection3 = peer3.dial(address).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(listener.connection_manager().connection_count(), 2);
    assert!(
        !listener
            .connection_manager()
            .get_connections(Some(peer1.local_peer_id()))
            .is_empty(),
        "high-value connection was pruned",
    );
    assert!(
        listener
            .connection_manager()
            .get_connections(Some(peer2.local_peer_id()))
            .is_empty(),
        "low-value connection survived",
    );
}

/// Scenario E: the second inbound stream over a protocol capped at one
/// inbound stream is reset.
#[tokio::test]
async fn inbound_stream_cap_resets_excess_streams() {
    init_logging();

    let hub = MemoryHub::default();
    let node1 = started_node(hub.clone()).await;
    let node2 = started_node(hub).await;

    // An echo handler that keeps its stream open.
    node1
        .handle(
            "/echo/1.0.0".into(),
            Arc::new(|mut stream, _connection| {
                Box::pin(async move {
                    let mut buffer = [0u8; 4];
                    while stream.read_exact(&mut buffer).await.is_ok() {
                        if stream.write_all(&buffer).await.is_err() {
                            break;
                        }
                    }
                })
            }),
            StreamHandlerOptions { max_inbound_streams: 1, ..Default::default() },
        )
        .await
        .unwrap();

    let connection = node2.dial(node1.listen_addresses().pop().unwrap()).await.unwrap();

    let mut stream1 = connection.new_stream(&["/echo/1.0.0".into()]).await.unwrap();
    stream1.write_all(b"ping").await.unwrap();
    let mut buffer = [0u8; 4];
    stream1.read_exact(&mut buffer).await.unwrap();
    assert_eq!(&buffer, b"ping");

    // Second stream negotiates but is reset by the cap.
    let mut stream2 = connection.new_stream(&["/echo/1.0.0".into()]).await.unwrap();
    stream2.write_all(b"ping").await.unwrap();

    let mut buffer = [0u8; 4];
    let error = tokio::time::timeout(Duration::from_secs(5), stream2.read_exact(&mut buffer))
        .await
        .expect("reset to arrive")
        .unwrap_err();
    assert_eq!(error.kind(), std::io::ErrorKind::ConnectionReset);

    // The first stream is still usable.
    stream1.write_all(b"pong").await.unwrap();
    let mut buffer = [0u8; 4];
    stream1.read_exact(&mut buffer).await.unwrap();
    assert_eq!(&buffer, b"pong");
}

/// Scenario F: registering a new protocol pushes the updated identify state
/// to connected peers.
#[tokio::test]
async fn handle_triggers_identify_push() {
    init_logging();

    let hub = MemoryHub::default();
    let node1 = started_node(hub.clone()).await;
    let node2 = started_node(hub).await;
    let mut events1 = node1.subscribe();
    let mut events2 = node2.subscribe();

    node1.dial(node2.listen_addresses().pop().unwrap()).await.unwrap();

    // Wait until identify has completed in both directions: node1 must know
    // node2 supports push, node2 must have seen node1 at all.
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events1.recv())
            .await
            .expect("identify to complete")
            .unwrap()
        {
            Meshp2pEvent::PeerIdentified { info } if info.peer == *node2.local_peer_id() => break,
            _ => {}
        }
    }
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events2.recv())
            .await
            .expect("identify to complete")
            .unwrap()
        {
            Meshp2pEvent::PeerIdentified { info } if info.peer == *node1.local_peer_id() => break,
            _ => {}
        }
    }

    node1
        .handle(
            "/foo/1.0.0".into(),
            Arc::new(|_stream, _connection| Box::pin(async {})),
            StreamHandlerOptions::default(),
        )
        .await
        .unwrap();

    // The push lands within half a second.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(500);
    loop {
        if let Ok(info) = node2.peer_store().get(node1.local_peer_id()) {
            if info.protocols.iter().any(|protocol| protocol.as_str() == "/foo/1.0.0") {
                break;
            }
        }

        assert!(
            tokio::time::Instant::now() < deadline,
            "push did not arrive within 500ms",
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Ping measures a round-trip over a fresh or existing connection.
#[tokio::test]
async fn ping_measures_round_trip() {
    init_logging();

    let hub = MemoryHub::default();
    let node1 = started_node(hub.clone()).await;
    let node2 = started_node(hub).await;

    let rtt = node1.ping(node2.listen_addresses().pop().unwrap()).await.unwrap();
    assert!(rtt < Duration::from_secs(1));
}

/// Stopping a node aborts its pending dials.
#[tokio::test]
async fn stop_aborts_pending_dials() {
    init_logging();

    let hub = MemoryHub::default();
    let mut node = Meshp2p::new(node_config(hub.clone())).await.unwrap();
    node.start().await.unwrap();

    // A listener that accepts raw connections but never upgrades, leaving
    // the dial hanging until shutdown.
    let silent = MemoryTransport::new(hub);
    let _listener = silent.listen("/memory/900".parse().unwrap()).await.unwrap();

    let handle = {
        let address: Multiaddr = "/memory/900".parse().unwrap();
        let connection_manager = node.connection_manager().clone();
        tokio::spawn(async move {
            connection_manager.open_connection(address, Default::default()).await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    node.stop().await.unwrap();

    match tokio::time::timeout(Duration::from_secs(2), handle).await {
        Ok(Ok(Err(error))) => assert_eq!(error.code(), "ERR_ABORTED"),
        other => panic!("expected aborted dial, got {other:?}"),
    }
}
