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

//! Authenticated, multiplexed connections and their streams.

use crate::{
    error::Error,
    multistream,
    mux::{MuxedStream, MuxerHandle},
    peer_id::PeerId,
    registrar::{Registrar, StreamReservation},
    types::{protocol::ProtocolName, ConnectionId, Direction, StreamId},
};

use multiaddr::Multiaddr;
use parking_lot::RwLock;
use tokio::sync::mpsc::{Receiver, Sender};

use std::{
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

pub mod dial_queue;
pub mod manager;
pub mod upgrader;

/// Logging target for the file.
const LOG_TARGET: &str = "meshp2p::connection";

/// Lifecycle state of a connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Upgrade finished, streams can be opened.
    Open,

    /// Graceful close in progress.
    Closing,

    /// Terminal state.
    Closed,
}

/// State of one half of a stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamState {
    /// Half is usable.
    Ready,

    /// Half was closed locally.
    Closed,

    /// Stream was reset, both halves are dead.
    Reset,
}

/// A connection to exactly one remote peer.
pub struct Connection {
    id: ConnectionId,
    peer: PeerId,
    remote_address: Multiaddr,
    direction: Direction,
    security_protocol: ProtocolName,
    muxer_protocol: ProtocolName,
    transient: bool,
    opened_at: Instant,
    status: RwLock<ConnectionStatus>,
    muxer: MuxerHandle,
    registrar: Registrar,
    streams: RwLock<nohash_hasher::IntMap<StreamId, ProtocolName>>,
    closed_tx: Sender<(PeerId, ConnectionId)>,
}

impl Connection {
    /// Wrap an upgraded connection and start dispatching its inbound
    /// streams.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: ConnectionId,
        peer: PeerId,
        remote_address: Multiaddr,
        direction: Direction,
        security_protocol: ProtocolName,
        muxer_protocol: ProtocolName,
        transient: bool,
        muxer: MuxerHandle,
        mut incoming: Receiver<MuxedStream>,
        registrar: Registrar,
        closed_tx: Sender<(PeerId, ConnectionId)>,
    ) -> Arc<Connection> {
        let connection = Arc::new(Connection {
            id,
            peer,
            remote_address,
            direction,
            security_protocol,
            muxer_protocol,
            transient,
            opened_at: Instant::now(),
            status: RwLock::new(ConnectionStatus::Open),
            muxer,
            registrar: registrar.clone(),
            streams: RwLock::new(nohash_hasher::IntMap::default()),
            closed_tx,
        });

        let weak = Arc::downgrade(&connection);
        tokio::spawn(async move {
            while let Some(muxed) = incoming.recv().await {
                let Some(connection) = weak.upgrade() else { break };
                let registrar = registrar.clone();

                tokio::spawn(async move {
                    registrar.dispatch_inbound(connection, muxed).await;
                });
            }

            // The muxer ended, either through close() or because the remote
            // went away.
            if let Some(connection) = weak.upgrade() {
                connection.mark_closed().await;
            }
        });

        connection
    }

    /// Connection ID, unique within the node.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The remote peer.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Address the remote was reached at or arrived from.
    pub fn remote_address(&self) -> &Multiaddr {
        &self.remote_address
    }

    /// Who opened the connection.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Label of the negotiated security method.
    pub fn security_protocol(&self) -> &ProtocolName {
        &self.security_protocol
    }

    /// Label of the negotiated stream muxer.
    pub fn muxer_protocol(&self) -> &ProtocolName {
        &self.muxer_protocol
    }

    /// Whether the connection is data/duration limited.
    pub fn transient(&self) -> bool {
        self.transient
    }

    /// When the connection finished upgrading.
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Current lifecycle status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    /// Snapshot of the currently open streams.
    pub fn streams(&self) -> Vec<(StreamId, ProtocolName)> {
        self.streams.read().iter().map(|(id, protocol)| (*id, protocol.clone())).collect()
    }

    /// Open a new stream, negotiating one of `candidates` in order.
    pub async fn new_stream(self: &Arc<Self>, candidates: &[ProtocolName]) -> crate::Result<Stream> {
        if self.status() != ConnectionStatus::Open {
            return Err(Error::ConnectionClosed);
        }

        let muxed = self.muxer.open_stream().await?;
        let (io, protocol) = multistream::dialer_select(muxed, candidates).await?;

        // A failed reservation drops the negotiated stream, resetting it.
        let reservation = self.registrar.reserve_outbound(self, protocol.clone())?;

        tracing::trace!(
            target: LOG_TARGET,
            peer = ?self.peer,
            %protocol,
            "outbound stream opened",
        );

        Ok(Stream::new(io, protocol, Direction::Outbound, reservation, self))
    }

    /// Gracefully close the connection, ending all streams first.
    pub async fn close(&self) -> crate::Result<()> {
        {
            let mut status = self.status.write();
            match *status {
                ConnectionStatus::Closed | ConnectionStatus::Closing => return Ok(()),
                ConnectionStatus::Open => *status = ConnectionStatus::Closing,
            }
        }

        tracing::debug!(target: LOG_TARGET, peer = ?self.peer, connection = %self.id, "closing connection");

        self.muxer.close().await?;
        self.mark_closed().await;

        Ok(())
    }

    /// Abort immediately, best effort.
    pub fn abort(&self) {
        tracing::debug!(target: LOG_TARGET, peer = ?self.peer, connection = %self.id, "aborting connection");

        self.muxer.abort();

        let transitioned = {
            let mut status = self.status.write();
            let transitioned = *status != ConnectionStatus::Closed;
            *status = ConnectionStatus::Closed;
            transitioned
        };

        if transitioned {
            let _ = self.closed_tx.try_send((self.peer, self.id));
        }
    }

    /// Enter the terminal state and notify the connection manager once.
    async fn mark_closed(&self) {
        let transitioned = {
            let mut status = self.status.write();
            let transitioned = *status != ConnectionStatus::Closed;
            *status = ConnectionStatus::Closed;
            transitioned
        };

        if transitioned {
            self.streams.write().clear();
            let _ = self.closed_tx.send((self.peer, self.id)).await;
        }
    }

    fn track_stream(&self, id: StreamId, protocol: ProtocolName) {
        self.streams.write().insert(id, protocol);
    }

    fn untrack_stream(&self, id: StreamId) {
        self.streams.write().remove(&id);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("remote_address", &self.remote_address)
            .field("direction", &self.direction)
            .field("status", &self.status())
            .field("transient", &self.transient)
            .finish()
    }
}

/// A negotiated stream bound to a connection.
///
/// Close semantics are half-close: shutting down the write side sends FIN,
/// closing the read side discards further inbound bytes and
/// [`Stream::reset`] aborts both halves.
pub struct Stream {
    io: MuxedStream,
    protocol: ProtocolName,
    direction: Direction,
    read_state: StreamState,
    write_state: StreamState,
    reservation: Option<StreamReservation>,
}

impl Stream {
    pub(crate) fn new(
        io: MuxedStream,
        protocol: ProtocolName,
        direction: Direction,
        reservation: StreamReservation,
        connection: &Arc<Connection>,
    ) -> Self {
        connection.track_stream(io.id(), protocol.clone());

        Self {
            io,
            protocol,
            direction,
            read_state: StreamState::Ready,
            write_state: StreamState::Ready,
            reservation: Some(reservation),
        }
    }

    /// Stream ID, unique within the connection.
    pub fn id(&self) -> StreamId {
        self.io.id()
    }

    /// The negotiated protocol.
    pub fn protocol(&self) -> &ProtocolName {
        &self.protocol
    }

    /// Who opened the stream.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// State of the read half.
    pub fn read_state(&self) -> StreamState {
        self.read_state
    }

    /// State of the write half.
    pub fn write_state(&self) -> StreamState {
        self.write_state
    }

    /// Gracefully close both halves.
    pub async fn close(&mut self) -> crate::Result<()> {
        self.close_write().await?;
        self.close_read();
        self.release();
        Ok(())
    }

    /// Close the write half, sending FIN.
    pub async fn close_write(&mut self) -> crate::Result<()> {
        if self.write_state == StreamState::Ready {
            tokio::io::AsyncWriteExt::shutdown(&mut self.io).await?;
            self.write_state = StreamState::Closed;
        }
        Ok(())
    }

    /// Close the read half; further inbound bytes are discarded.
    pub fn close_read(&mut self) {
        if self.read_state == StreamState::Ready {
            self.io.close_read();
            self.read_state = StreamState::Closed;
        }
    }

    /// Abort both halves and signal the remote peer.
    pub fn reset(&mut self) {
        self.io.reset();
        self.read_state = StreamState::Reset;
        self.write_state = StreamState::Reset;
        self.release();
    }

    fn release(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            if let Some(connection) = reservation.connection_ref().upgrade() {
                connection.untrack_stream(self.io.id());
            }
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.release();
    }
}

impl tokio::io::AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.io).poll_shutdown(cx) {
            Poll::Ready(Ok(())) => {
                this.write_state = StreamState::Closed;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.io.id())
            .field("protocol", &self.protocol)
            .field("direction", &self.direction)
            .finish()
    }
}
