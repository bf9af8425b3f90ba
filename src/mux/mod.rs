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

//! Stream-multiplexer abstraction.
//!
//! A muxer carves one raw connection into many half-closeable streams. The
//! muxer itself runs as a background task; users hold a [`MuxerHandle`] for
//! opening streams and a receiver of inbound streams.

use crate::{
    error::Error,
    transport::RawConnection,
    types::{protocol::ProtocolName, Direction, StreamId},
};

use bytes::Bytes;
use tokio::sync::{
    mpsc::{Receiver, Sender},
    oneshot,
};
use tokio_util::sync::{CancellationToken, PollSender};

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

pub mod mplex;

/// Identity of a stream inside the muxer: which side opened it and the raw
/// per-opener counter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) struct StreamKey {
    /// Whether the local side opened the stream.
    pub local: bool,

    /// Raw stream counter of the opener.
    pub raw_id: u64,
}

impl StreamKey {
    /// Stream ID unique within the connection regardless of opener.
    fn stream_id(&self) -> StreamId {
        StreamId::from((self.raw_id as usize) << 1 | usize::from(!self.local))
    }
}

/// Factory producing muxers over upgraded connections.
pub trait StreamMuxerFactory: Send + Sync {
    /// Protocol name used during muxer negotiation.
    fn protocol(&self) -> ProtocolName;

    /// Multiplex `io`, spawning the muxer's background task.
    ///
    /// Returns a handle for opening streams and the channel of inbound
    /// streams. The channel closing means the connection is gone.
    fn create_stream_muxer(
        &self,
        io: Box<dyn RawConnection>,
        direction: Direction,
    ) -> (MuxerHandle, Receiver<MuxedStream>);
}

/// Commands accepted by a muxer task.
pub(crate) enum MuxerCommand {
    /// Open a new outbound stream.
    OpenStream {
        reply: oneshot::Sender<crate::Result<MuxedStream>>,
    },

    /// Gracefully close the muxer and the connection under it.
    Close {
        reply: oneshot::Sender<()>,
    },

    /// Tear everything down immediately.
    Abort,
}

/// Commands streams send to their muxer task.
#[derive(Debug)]
pub(crate) enum StreamCommand {
    /// Write a chunk on the stream.
    Data { key: StreamKey, bytes: Bytes },

    /// Half-close the write side (FIN).
    CloseWrite { key: StreamKey },

    /// Abort both halves and signal the remote.
    Reset { key: StreamKey },
}

/// Events a muxer task delivers to a stream's read half.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// Inbound data chunk.
    Data(Bytes),

    /// The remote reset the stream.
    Reset,
}

/// Handle for interacting with a running muxer task.
#[derive(Clone)]
pub struct MuxerHandle {
    cmd_tx: Sender<MuxerCommand>,
    closed: CancellationToken,
}

impl MuxerHandle {
    pub(crate) fn new(cmd_tx: Sender<MuxerCommand>, closed: CancellationToken) -> Self {
        Self { cmd_tx, closed }
    }

    /// Open a new outbound stream.
    pub async fn open_stream(&self) -> crate::Result<MuxedStream> {
        let (reply, rx) = oneshot::channel();

        self.cmd_tx
            .send(MuxerCommand::OpenStream { reply })
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Gracefully close the muxer, ending all streams.
    pub async fn close(&self) -> crate::Result<()> {
        let (reply, rx) = oneshot::channel();

        if self.cmd_tx.send(MuxerCommand::Close { reply }).await.is_err() {
            // Task already gone, nothing left to close.
            return Ok(());
        }

        let _ = rx.await;
        Ok(())
    }

    /// Abort immediately, best effort.
    pub fn abort(&self) {
        let _ = self.cmd_tx.try_send(MuxerCommand::Abort);
    }

    /// Token cancelled when the muxer task exits for any reason.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// One multiplexed stream.
///
/// Read and write halves close independently: shutting down the write side
/// sends FIN, dropping the read side discards further inbound data and
/// [`MuxedStream::reset`] aborts both halves. Dropping the stream without a
/// clean shutdown counts as a reset.
pub struct MuxedStream {
    id: StreamId,
    key: StreamKey,
    direction: Direction,
    read_rx: Receiver<StreamEvent>,
    pending: Option<Bytes>,
    eof: bool,
    writer: PollSender<StreamCommand>,
    reset_tx: Sender<StreamCommand>,
    write_closed: bool,
    reset_sent: bool,
}

impl MuxedStream {
    pub(crate) fn new(
        key: StreamKey,
        direction: Direction,
        read_rx: Receiver<StreamEvent>,
        stream_cmd_tx: Sender<StreamCommand>,
    ) -> Self {
        Self {
            id: key.stream_id(),
            key,
            direction,
            read_rx,
            pending: None,
            eof: false,
            writer: PollSender::new(stream_cmd_tx.clone()),
            reset_tx: stream_cmd_tx,
            write_closed: false,
            reset_sent: false,
        }
    }

    /// Stream ID, unique within the connection.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Who opened the stream.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Close the read half locally; buffered and future inbound data is
    /// discarded.
    pub fn close_read(&mut self) {
        self.read_rx.close();
        self.pending = None;
        self.eof = true;
    }

    /// Abort both halves and signal the remote peer.
    pub fn reset(&mut self) {
        if !self.reset_sent {
            self.reset_sent = true;
            self.write_closed = true;
            self.read_rx.close();
            let _ = self.reset_tx.try_send(StreamCommand::Reset { key: self.key });
        }
    }
}

impl tokio::io::AsyncRead for MuxedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if let Some(chunk) = this.pending.as_mut() {
                let n = std::cmp::min(chunk.len(), buf.remaining());
                buf.put_slice(&chunk[..n]);
                let _ = chunk.split_to(n);
                if chunk.is_empty() {
                    this.pending = None;
                }
                return Poll::Ready(Ok(()));
            }

            if this.eof {
                return Poll::Ready(Ok(()));
            }

            match this.read_rx.poll_recv(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(StreamEvent::Data(bytes))) => {
                    if !bytes.is_empty() {
                        this.pending = Some(bytes);
                    }
                }
                Poll::Ready(Some(StreamEvent::Reset)) => {
                    this.eof = true;
                    return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
                }
                Poll::Ready(None) => {
                    this.eof = true;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl tokio::io::AsyncWrite for MuxedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        match this.writer.poll_reserve(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Ready(Ok(())) => {
                let bytes = Bytes::copy_from_slice(buf);
                this.writer
                    .send_item(StreamCommand::Data { key: this.key, bytes })
                    .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
                Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Chunks are flushed by the muxer task as they drain.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.write_closed {
            return Poll::Ready(Ok(()));
        }

        match this.writer.poll_reserve(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Ready(Ok(())) => {
                this.writer
                    .send_item(StreamCommand::CloseWrite { key: this.key })
                    .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
                this.write_closed = true;
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl Drop for MuxedStream {
    fn drop(&mut self) {
        // A stream dropped without a clean shutdown aborts, mirroring what
        // the remote would observe from a crashed handler.
        if !self.write_closed && !self.reset_sent {
            let _ = self.reset_tx.try_send(StreamCommand::Reset { key: self.key });
        }
    }
}

impl std::fmt::Debug for MuxedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxedStream")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .finish()
    }
}
