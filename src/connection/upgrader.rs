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

//! Connection upgrade pipeline.
//!
//! A raw transport byte stream becomes an authenticated, multiplexed
//! connection in three steps: optional pre-protection, a negotiated security
//! handshake yielding the remote identity, and a negotiated stream muxer.
//! The connection gater is consulted after accept, after encryption and
//! after the full upgrade; any denial aborts the upgrade. A failed upgrade
//! releases the raw connection before returning.

use crate::{
    connection::Connection,
    error::Error,
    gater::ConnectionGater,
    multistream,
    mux::StreamMuxerFactory,
    peer_id::PeerId,
    registrar::Registrar,
    security::{ConnectionProtector, ConnectionSecurity, SecuredConnection},
    transport::RawConnection,
    types::{protocol::ProtocolName, ConnectionId, Direction},
};

use multiaddr::Multiaddr;
use tokio::sync::mpsc::Sender;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// Logging target for the file.
const LOG_TARGET: &str = "meshp2p::upgrader";

/// The connection upgrader.
#[derive(Clone)]
pub struct Upgrader {
    inner: Arc<UpgraderInner>,
}

struct UpgraderInner {
    local_peer: PeerId,
    security: Vec<Arc<dyn ConnectionSecurity>>,
    muxers: Vec<Arc<dyn StreamMuxerFactory>>,
    protector: Option<Arc<dyn ConnectionProtector>>,
    gater: Arc<dyn ConnectionGater>,
    registrar: Registrar,
    inbound_upgrade_timeout: Duration,
    next_connection_id: AtomicUsize,

    /// Channel over which connections report their close to the connection
    /// manager.
    closed_tx: Sender<(PeerId, ConnectionId)>,
}

impl Upgrader {
    /// Create a new upgrader.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_peer: PeerId,
        security: Vec<Arc<dyn ConnectionSecurity>>,
        muxers: Vec<Arc<dyn StreamMuxerFactory>>,
        protector: Option<Arc<dyn ConnectionProtector>>,
        gater: Arc<dyn ConnectionGater>,
        registrar: Registrar,
        inbound_upgrade_timeout: Duration,
        closed_tx: Sender<(PeerId, ConnectionId)>,
    ) -> crate::Result<Self> {
        if security.is_empty() {
            return Err(Error::ConnEncryptionRequired);
        }
        if muxers.is_empty() {
            return Err(Error::MuxerUnavailable);
        }

        Ok(Self {
            inner: Arc::new(UpgraderInner {
                local_peer,
                security,
                muxers,
                protector,
                gater,
                registrar,
                inbound_upgrade_timeout,
                next_connection_id: AtomicUsize::new(0),
                closed_tx,
            }),
        })
    }

    /// Upgrade an outbound raw connection.
    ///
    /// `expected_peer` is enforced against the authenticated identity.
    pub async fn upgrade_outbound(
        &self,
        raw: Box<dyn RawConnection>,
        remote_address: Multiaddr,
        expected_peer: Option<PeerId>,
    ) -> crate::Result<Arc<Connection>> {
        self.upgrade(raw, remote_address, Direction::Outbound, expected_peer, false).await
    }

    /// Upgrade an inbound raw connection, bounded by the inbound-upgrade
    /// timeout.
    pub async fn upgrade_inbound(
        &self,
        raw: Box<dyn RawConnection>,
        remote_address: Multiaddr,
    ) -> crate::Result<Arc<Connection>> {
        if self.inner.gater.deny_inbound_connection(&remote_address).await {
            return Err(Error::ConnectionIntercepted);
        }

        match tokio::time::timeout(
            self.inner.inbound_upgrade_timeout,
            self.upgrade(raw, remote_address.clone(), Direction::Inbound, None, false),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(
                    target: LOG_TARGET,
                    address = ?remote_address,
                    "inbound upgrade timed out",
                );
                Err(Error::Timeout)
            }
        }
    }

    async fn upgrade(
        &self,
        raw: Box<dyn RawConnection>,
        remote_address: Multiaddr,
        direction: Direction,
        expected_peer: Option<PeerId>,
        transient: bool,
    ) -> crate::Result<Arc<Connection>> {
        let inner = &self.inner;

        let raw = match &inner.protector {
            Some(protector) => protector.protect(raw).await?,
            None => raw,
        };

        // Security negotiation and handshake.
        let security_names: Vec<ProtocolName> =
            inner.security.iter().map(|security| security.protocol()).collect();

        let (io, security_protocol) = match direction {
            Direction::Outbound => multistream::dialer_select(raw, &security_names).await,
            Direction::Inbound => multistream::listener_select(raw, &security_names).await,
        }
        .map_err(|error| Error::EncryptionFailed(error.to_string()))?;

        let security = inner
            .security
            .iter()
            .find(|security| security.protocol() == security_protocol)
            .expect("negotiated protocol came from the configured set; qed")
            .clone();

        let SecuredConnection { io, peer, public_key: _ } = match direction {
            Direction::Outbound => security.secure_outbound(io, expected_peer).await?,
            Direction::Inbound => security.secure_inbound(io, expected_peer).await?,
        };

        if let Some(expected) = expected_peer {
            if expected != peer {
                return Err(Error::InvalidPeer);
            }
        }
        if peer == inner.local_peer {
            return Err(Error::InvalidPeer);
        }

        let denied = match direction {
            Direction::Outbound =>
                inner.gater.deny_outbound_connection(&peer, &remote_address).await,
            Direction::Inbound =>
                inner.gater.deny_inbound_encrypted_connection(&peer, &remote_address).await,
        };
        if denied {
            return Err(Error::ConnectionIntercepted);
        }

        // Muxer negotiation.
        let muxer_names: Vec<ProtocolName> =
            inner.muxers.iter().map(|muxer| muxer.protocol()).collect();

        let (io, muxer_protocol) = match direction {
            Direction::Outbound => multistream::dialer_select(io, &muxer_names).await,
            Direction::Inbound => multistream::listener_select(io, &muxer_names).await,
        }
        .map_err(|_| Error::MuxerUnavailable)?;

        let muxer_factory = inner
            .muxers
            .iter()
            .find(|muxer| muxer.protocol() == muxer_protocol)
            .expect("negotiated protocol came from the configured set; qed")
            .clone();

        let (muxer, incoming) = muxer_factory.create_stream_muxer(io, direction);

        let denied = match direction {
            Direction::Outbound =>
                inner.gater.deny_outbound_upgraded_connection(&peer, &remote_address).await,
            Direction::Inbound =>
                inner.gater.deny_inbound_upgraded_connection(&peer, &remote_address).await,
        };
        if denied {
            muxer.abort();
            return Err(Error::ConnectionIntercepted);
        }

        let id = ConnectionId::from(inner.next_connection_id.fetch_add(1, Ordering::Relaxed));

        tracing::debug!(
            target: LOG_TARGET,
            connection = %id,
            ?peer,
            ?direction,
            %security_protocol,
            %muxer_protocol,
            "connection upgraded",
        );

        Ok(Connection::spawn(
            id,
            peer,
            remote_address,
            direction,
            security_protocol,
            muxer_protocol,
            transient,
            muxer,
            incoming,
            inner.registrar.clone(),
            inner.closed_tx.clone(),
        ))
    }
}
