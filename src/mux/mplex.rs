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

//! Mplex-framing stream muxer.
//!
//! Frames are `varint((id << 3) | flag) || varint(len) || payload`. Each side
//! numbers the streams it opens; the flag encodes whether a frame concerns a
//! stream the sender initiated or received.

use crate::{
    mux::{
        MuxedStream, MuxerCommand, MuxerHandle, StreamCommand, StreamEvent, StreamKey,
        StreamMuxerFactory,
    },
    transport::RawConnection,
    types::{protocol::ProtocolName, Direction},
};

use bytes::{Buf, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio_util::{
    codec::{Decoder, Encoder, Framed},
    sync::CancellationToken,
};

use std::collections::HashMap;

/// Logging target for the file.
const LOG_TARGET: &str = "meshp2p::mux::mplex";

/// Protocol name used during muxer negotiation.
const PROTOCOL_NAME: &str = "/mplex/6.7.0";

/// Largest accepted frame payload.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Per-stream inbound buffer, in frames.
const STREAM_CHANNEL_SIZE: usize = 64;

const NEW_STREAM: u8 = 0;
const MSG_RECEIVER: u8 = 1;
const MSG_INITIATOR: u8 = 2;
const CLOSE_RECEIVER: u8 = 3;
const CLOSE_INITIATOR: u8 = 4;
const RESET_RECEIVER: u8 = 5;
const RESET_INITIATOR: u8 = 6;

/// Mplex muxer factory.
#[derive(Debug, Default)]
pub struct Mplex;

impl StreamMuxerFactory for Mplex {
    fn protocol(&self) -> ProtocolName {
        ProtocolName::from(PROTOCOL_NAME)
    }

    fn create_stream_muxer(
        &self,
        io: Box<dyn RawConnection>,
        direction: Direction,
    ) -> (MuxerHandle, Receiver<MuxedStream>) {
        let (cmd_tx, cmd_rx) = channel(64);
        let (incoming_tx, incoming_rx) = channel(64);
        let (stream_cmd_tx, stream_cmd_rx) = channel(256);
        let closed = CancellationToken::new();

        tokio::spawn(mux_loop(
            io,
            direction,
            cmd_rx,
            stream_cmd_rx,
            stream_cmd_tx,
            incoming_tx,
            closed.clone(),
        ));

        (MuxerHandle::new(cmd_tx, closed), incoming_rx)
    }
}

struct Frame {
    raw_id: u64,
    flag: u8,
    data: Bytes,
}

struct MplexCodec;

impl Decoder for MplexCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (header, header_len) = match try_varint(src) {
            Some(decoded) => decoded,
            None => return Ok(None),
        };
        let (len, len_len) = match try_varint(&src[header_len..]) {
            Some(decoded) => decoded,
            None => return Ok(None),
        };

        let len = len as usize;
        if len > MAX_FRAME_SIZE {
            return Err(std::io::ErrorKind::InvalidData.into());
        }

        let frame_start = header_len + len_len;
        if src.len() < frame_start + len {
            src.reserve(frame_start + len - src.len());
            return Ok(None);
        }

        src.advance(frame_start);
        let data = src.split_to(len).freeze();

        Ok(Some(Frame {
            raw_id: header >> 3,
            flag: (header & 0x07) as u8,
            data,
        }))
    }
}

impl Encoder<Frame> for MplexCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut buffer = unsigned_varint::encode::u64_buffer();

        dst.extend_from_slice(unsigned_varint::encode::u64(
            frame.raw_id << 3 | frame.flag as u64,
            &mut buffer,
        ));
        dst.extend_from_slice(unsigned_varint::encode::u64(frame.data.len() as u64, &mut buffer));
        dst.extend_from_slice(&frame.data);

        Ok(())
    }
}

/// Decode a varint from the start of `src` without consuming on a partial
/// read.
fn try_varint(src: &[u8]) -> Option<(u64, usize)> {
    match unsigned_varint::decode::u64(src) {
        Ok((value, rest)) => Some((value, src.len() - rest.len())),
        Err(_) => None,
    }
}

async fn mux_loop(
    io: Box<dyn RawConnection>,
    direction: Direction,
    mut cmd_rx: Receiver<MuxerCommand>,
    mut stream_cmd_rx: Receiver<StreamCommand>,
    stream_cmd_tx: Sender<StreamCommand>,
    incoming_tx: Sender<MuxedStream>,
    closed: CancellationToken,
) {
    tracing::trace!(target: LOG_TARGET, ?direction, "muxer started");

    let mut framed = Framed::new(io, MplexCodec);
    let mut streams: HashMap<StreamKey, Sender<StreamEvent>> = HashMap::new();
    let mut next_raw_id = 0u64;

    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(MuxerCommand::OpenStream { reply }) => {
                    let key = StreamKey { local: true, raw_id: next_raw_id };
                    next_raw_id += 1;

                    let frame = Frame { raw_id: key.raw_id, flag: NEW_STREAM, data: Bytes::new() };
                    if framed.send(frame).await.is_err() {
                        let _ = reply.send(Err(crate::error::Error::ConnectionClosed));
                        break;
                    }

                    let (event_tx, event_rx) = channel(STREAM_CHANNEL_SIZE);
                    streams.insert(key, event_tx);
                    let _ = reply.send(Ok(MuxedStream::new(
                        key,
                        Direction::Outbound,
                        event_rx,
                        stream_cmd_tx.clone(),
                    )));
                }
                Some(MuxerCommand::Close { reply }) => {
                    let _ = framed.close().await;
                    let _ = reply.send(());
                    break;
                }
                Some(MuxerCommand::Abort) | None => break,
            },
            command = stream_cmd_rx.recv() => match command {
                Some(StreamCommand::Data { key, bytes }) => {
                    let flag = if key.local { MSG_INITIATOR } else { MSG_RECEIVER };
                    if framed.send(Frame { raw_id: key.raw_id, flag, data: bytes }).await.is_err() {
                        break;
                    }
                }
                Some(StreamCommand::CloseWrite { key }) => {
                    let flag = if key.local { CLOSE_INITIATOR } else { CLOSE_RECEIVER };
                    if framed.send(Frame { raw_id: key.raw_id, flag, data: Bytes::new() }).await.is_err() {
                        break;
                    }
                }
                Some(StreamCommand::Reset { key }) => {
                    streams.remove(&key);
                    let flag = if key.local { RESET_INITIATOR } else { RESET_RECEIVER };
                    if framed.send(Frame { raw_id: key.raw_id, flag, data: Bytes::new() }).await.is_err() {
                        break;
                    }
                }
                // The muxer holds its own sender, so the channel cannot close.
                None => break,
            },
            frame = framed.next() => match frame {
                Some(Ok(frame)) => {
                    if !handle_frame(frame, &mut streams, &stream_cmd_tx, &incoming_tx).await {
                        break;
                    }
                }
                Some(Err(error)) => {
                    tracing::debug!(target: LOG_TARGET, ?error, "frame decode failed");
                    break;
                }
                None => {
                    tracing::trace!(target: LOG_TARGET, "connection closed by remote");
                    break;
                }
            },
        }
    }

    closed.cancel();
}

/// Returns `false` when the muxer must shut down.
async fn handle_frame(
    frame: Frame,
    streams: &mut HashMap<StreamKey, Sender<StreamEvent>>,
    stream_cmd_tx: &Sender<StreamCommand>,
    incoming_tx: &Sender<MuxedStream>,
) -> bool {
    match frame.flag {
        NEW_STREAM => {
            let key = StreamKey { local: false, raw_id: frame.raw_id };
            let (event_tx, event_rx) = channel(STREAM_CHANNEL_SIZE);
            streams.insert(key, event_tx);

            let stream = MuxedStream::new(key, Direction::Inbound, event_rx, stream_cmd_tx.clone());
            if incoming_tx.send(stream).await.is_err() {
                return false;
            }
        }
        MSG_INITIATOR | MSG_RECEIVER => {
            // A frame the remote sent as initiator concerns a stream it
            // opened, which is a remote stream from our perspective.
            let key = StreamKey { local: frame.flag == MSG_RECEIVER, raw_id: frame.raw_id };
            if let Some(event_tx) = streams.get(&key) {
                let _ = event_tx.send(StreamEvent::Data(frame.data)).await;
            }
        }
        CLOSE_INITIATOR | CLOSE_RECEIVER => {
            let key = StreamKey { local: frame.flag == CLOSE_RECEIVER, raw_id: frame.raw_id };
            // Dropping the sender delivers EOF once buffered data drains.
            streams.remove(&key);
        }
        RESET_INITIATOR | RESET_RECEIVER => {
            let key = StreamKey { local: frame.flag == RESET_RECEIVER, raw_id: frame.raw_id };
            if let Some(event_tx) = streams.remove(&key) {
                let _ = event_tx.try_send(StreamEvent::Reset);
            }
        }
        flag => {
            tracing::debug!(target: LOG_TARGET, flag, "unknown frame flag");
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn muxer_pair() -> (
        (MuxerHandle, Receiver<MuxedStream>),
        (MuxerHandle, Receiver<MuxedStream>),
    ) {
        let (dialer_io, listener_io) = tokio::io::duplex(256 * 1024);
        let dialer = Mplex.create_stream_muxer(Box::new(dialer_io), Direction::Outbound);
        let listener = Mplex.create_stream_muxer(Box::new(listener_io), Direction::Inbound);
        (dialer, listener)
    }

    #[tokio::test]
    async fn streams_carry_data_both_ways() {
        let ((dialer, _), (_listener, mut listener_incoming)) = muxer_pair();

        let mut outbound = dialer.open_stream().await.unwrap();
        outbound.write_all(b"hello").await.unwrap();

        let mut inbound = listener_incoming.recv().await.unwrap();
        let mut buffer = [0u8; 5];
        inbound.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"hello");

        inbound.write_all(b"world").await.unwrap();
        let mut buffer = [0u8; 5];
        outbound.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"world");
    }

    #[tokio::test]
    async fn write_shutdown_delivers_eof_after_data() {
        let ((dialer, _), (_listener, mut listener_incoming)) = muxer_pair();

        let mut outbound = dialer.open_stream().await.unwrap();
        outbound.write_all(b"fin").await.unwrap();
        outbound.shutdown().await.unwrap();

        let mut inbound = listener_incoming.recv().await.unwrap();
        let mut buffer = Vec::new();
        inbound.read_to_end(&mut buffer).await.unwrap();
        assert_eq!(buffer, b"fin");
    }

    #[tokio::test]
    async fn reset_is_observed_by_the_remote() {
        let ((dialer, _), (_listener, mut listener_incoming)) = muxer_pair();

        let mut outbound = dialer.open_stream().await.unwrap();
        outbound.write_all(b"x").await.unwrap();

        let mut inbound = listener_incoming.recv().await.unwrap();
        let mut buffer = [0u8; 1];
        inbound.read_exact(&mut buffer).await.unwrap();

        outbound.reset();

        let mut buffer = [0u8; 1];
        let error = inbound.read_exact(&mut buffer).await.unwrap_err();
        assert_eq!(error.kind(), std::io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn concurrent_streams_are_isolated() {
        let ((dialer, _), (_listener, mut listener_incoming)) = muxer_pair();

        let mut streams = Vec::new();
        for i in 0..4u8 {
            let mut stream = dialer.open_stream().await.unwrap();
            stream.write_all(&[i]).await.unwrap();
            streams.push(stream);
        }

        let mut seen = Vec::new();
        let mut inbound_streams = Vec::new();
        for _ in 0..4 {
            let mut inbound = listener_incoming.recv().await.unwrap();
            let mut buffer = [0u8; 1];
            inbound.read_exact(&mut buffer).await.unwrap();
            seen.push(buffer[0]);
            inbound_streams.push(inbound);
        }

        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn muxer_close_ends_incoming_streams() {
        let ((dialer, _), (_listener, mut listener_incoming)) = muxer_pair();

        dialer.close().await.unwrap();

        assert!(listener_incoming.recv().await.is_none());
    }
}
