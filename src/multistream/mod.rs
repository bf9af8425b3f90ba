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

//! Protocol-selection sub-protocol.
//!
//! A length-prefixed line protocol that negotiates the next protocol over any
//! byte stream. The dialer proposes candidates in order; the listener echoes
//! the first one it supports or answers `na`. A fixed version line is
//! exchanged when a stream starts speaking the protocol. Used both for muxer
//! selection during connection upgrade and for per-stream protocol selection
//! afterwards.

use crate::{
    codec,
    error::{Error, NegotiationError},
    types::protocol::ProtocolName,
};

use bytes::{Buf, BytesMut};
use smallvec::SmallVec;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

/// Logging target for the file.
const LOG_TARGET: &str = "meshp2p::multistream";

/// Version line exchanged on every new (sub)stream.
const HEADER_LINE: &str = "/multistream/1.0.0";

/// "Not available" control token.
const NA: &str = "na";

/// "List supported protocols" control token.
const LS: &str = "ls";

/// Maximum length of a single negotiation message.
const MAX_MESSAGE_SIZE: usize = 1024;

/// Propose `candidates` in order and return the protocol the listener chose.
///
/// Fails with [`Error::UnsupportedProtocol`] if the listener rejects every
/// candidate.
pub async fn dialer_select<S>(
    mut io: S,
    candidates: &[ProtocolName],
) -> crate::Result<(S, ProtocolName)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut candidates = candidates.iter();
    let Some(first) = candidates.next() else {
        return Err(Error::UnsupportedProtocol(None));
    };

    // Header and first proposal are pipelined into one flush.
    write_lines(&mut io, &[HEADER_LINE, first.as_str()]).await?;

    let header = read_line(&mut io).await?;
    if header != HEADER_LINE {
        return Err(NegotiationError::VersionMismatch.into());
    }

    let mut proposed = first.clone();
    loop {
        let response = read_line(&mut io).await?;

        if response == proposed.as_str() {
            tracing::trace!(target: LOG_TARGET, protocol = %proposed, "dialer: protocol negotiated");
            return Ok((io, proposed));
        }

        if response != NA {
            return Err(NegotiationError::StateMismatch.into());
        }

        match candidates.next() {
            Some(next) => {
                proposed = next.clone();
                write_lines(&mut io, &[proposed.as_str()]).await?;
            }
            None => {
                tracing::trace!(target: LOG_TARGET, "dialer: no candidate accepted");
                return Err(Error::UnsupportedProtocol(Some(proposed)));
            }
        }
    }
}

/// Mirror side of [`dialer_select`]: answer proposals against `supported`.
///
/// Replies `na` to unknown proposals and serves `ls` queries with the
/// supported list.
pub async fn listener_select<S>(
    mut io: S,
    supported: &[ProtocolName],
) -> crate::Result<(S, ProtocolName)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_lines(&mut io, &[HEADER_LINE]).await?;

    let header = read_line(&mut io).await?;
    if header != HEADER_LINE {
        return Err(NegotiationError::VersionMismatch.into());
    }

    loop {
        let proposal = read_line(&mut io).await?;

        if proposal == LS {
            write_protocol_list(&mut io, supported).await?;
            continue;
        }

        match supported.iter().find(|protocol| protocol.as_str() == proposal) {
            Some(protocol) => {
                write_lines(&mut io, &[protocol.as_str()]).await?;
                tracing::trace!(target: LOG_TARGET, %protocol, "listener: protocol negotiated");
                return Ok((io, protocol.clone()));
            }
            None => {
                tracing::trace!(target: LOG_TARGET, %proposal, "listener: unsupported proposal");
                write_lines(&mut io, &[NA]).await?;
            }
        }
    }
}

/// Optimistic 0-RTT variant of [`dialer_select`] for a single candidate.
///
/// The proposal is sent without waiting for the listener's answer and the
/// protocol is treated as accepted. The confirmation is consumed lazily on
/// the first read; a rejecting listener surfaces as
/// [`Error::UnsupportedProtocol`] there.
pub async fn lazy_select<S>(
    mut io: S,
    protocol: ProtocolName,
) -> crate::Result<(LazyNegotiated<S>, ProtocolName)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_lines(&mut io, &[HEADER_LINE, protocol.as_str()]).await?;

    Ok((LazyNegotiated::new(io, protocol.clone()), protocol))
}

/// Stream returned by [`lazy_select`].
///
/// Writes pass straight through; reads first consume the negotiation
/// confirmation.
pub struct LazyNegotiated<S> {
    io: S,
    protocol: ProtocolName,
    state: LazyState,
    buffer: BytesMut,
}

enum LazyState {
    /// Version line not read yet.
    AwaitingHeader,

    /// Version line read, echo of the proposal not read yet.
    AwaitingConfirmation,

    /// Negotiation finished, remaining bytes are application data.
    Negotiated,

    /// Listener rejected the proposal.
    Failed,
}

impl<S> LazyNegotiated<S> {
    fn new(io: S, protocol: ProtocolName) -> Self {
        Self {
            io,
            protocol,
            state: LazyState::AwaitingHeader,
            buffer: BytesMut::new(),
        }
    }

    /// The optimistically selected protocol.
    pub fn protocol(&self) -> &ProtocolName {
        &self.protocol
    }
}

impl<S: AsyncRead + Unpin> LazyNegotiated<S> {
    /// Drive the negotiation until confirmed, parsing buffered lines first.
    fn poll_negotiated(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            match self.state {
                LazyState::Negotiated => return Poll::Ready(Ok(())),
                LazyState::Failed =>
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "protocol rejected by remote",
                    ))),
                _ => {}
            }

            // Parse complete lines already buffered before reading more.
            while let Some(line) = take_buffered_line(&mut self.buffer)? {
                match self.state {
                    LazyState::AwaitingHeader if line == HEADER_LINE => {
                        self.state = LazyState::AwaitingConfirmation;
                    }
                    LazyState::AwaitingHeader =>
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "unexpected negotiation header",
                        ))),
                    LazyState::AwaitingConfirmation if line == self.protocol.as_str() => {
                        self.state = LazyState::Negotiated;
                        return Poll::Ready(Ok(()));
                    }
                    LazyState::AwaitingConfirmation => {
                        self.state = LazyState::Failed;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::Unsupported,
                            "protocol rejected by remote",
                        )));
                    }
                    LazyState::Negotiated | LazyState::Failed => unreachable!("states handled above"),
                }
            }

            let mut scratch = [0u8; 256];
            let mut read_buf = ReadBuf::new(&mut scratch);
            match Pin::new(&mut self.io).poll_read(cx, &mut read_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                Poll::Ready(Ok(())) if read_buf.filled().is_empty() =>
                    return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into())),
                Poll::Ready(Ok(())) => self.buffer.extend_from_slice(read_buf.filled()),
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for LazyNegotiated<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match this.poll_negotiated(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
            Poll::Ready(Ok(())) => {}
        }

        // Serve bytes that arrived together with the confirmation first.
        if !this.buffer.is_empty() {
            let n = std::cmp::min(this.buffer.len(), buf.remaining());
            buf.put_slice(&this.buffer[..n]);
            this.buffer.advance(n);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for LazyNegotiated<S> {
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
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

/// Try to extract one complete varint-framed line from `buffer`.
fn take_buffered_line(buffer: &mut BytesMut) -> io::Result<Option<String>> {
    let (len, remaining) = match unsigned_varint::decode::usize(&buffer[..]) {
        Ok(decoded) => decoded,
        Err(unsigned_varint::decode::Error::Insufficient) => return Ok(None),
        Err(_) => return Err(io::ErrorKind::InvalidData.into()),
    };

    if len > MAX_MESSAGE_SIZE {
        return Err(io::ErrorKind::InvalidData.into());
    }
    if remaining.len() < len {
        return Ok(None);
    }

    let prefix_len = buffer.len() - remaining.len();
    buffer.advance(prefix_len);
    let mut line = buffer.split_to(len);

    match line.last() {
        Some(b'\n') => {
            line.truncate(len - 1);
            String::from_utf8(line.to_vec())
                .map(Some)
                .map_err(|_| io::ErrorKind::InvalidData.into())
        }
        _ => Err(io::ErrorKind::InvalidData.into()),
    }
}

/// Read a single negotiation line, stripping the trailing newline.
async fn read_line<S>(io: &mut S) -> crate::Result<String>
where
    S: AsyncRead + Unpin,
{
    let len = codec::read_varint(io).await?;
    if len == 0 || len > MAX_MESSAGE_SIZE {
        return Err(NegotiationError::MessageTooLarge.into());
    }

    let mut line = vec![0u8; len];
    io.read_exact(&mut line).await.map_err(|_| Error::ConnectionEnded)?;

    if line.pop() != Some(b'\n') {
        return Err(NegotiationError::ParseError.into());
    }

    String::from_utf8(line).map_err(|_| NegotiationError::ParseError.into())
}

/// Write one or more negotiation lines in a single flush.
async fn write_lines<S>(io: &mut S, lines: &[&str]) -> crate::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut message = SmallVec::<[u8; 128]>::new();
    let mut varint = unsigned_varint::encode::usize_buffer();

    for line in lines {
        message.extend_from_slice(unsigned_varint::encode::usize(line.len() + 1, &mut varint));
        message.extend_from_slice(line.as_bytes());
        message.push(b'\n');
    }

    io.write_all(&message).await?;
    io.flush().await?;

    Ok(())
}

/// Answer an `ls` query: one message containing every supported name as a
/// varint-framed line.
async fn write_protocol_list<S>(io: &mut S, supported: &[ProtocolName]) -> crate::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut payload = Vec::new();
    let mut varint = unsigned_varint::encode::usize_buffer();

    for protocol in supported {
        payload
            .extend_from_slice(unsigned_varint::encode::usize(protocol.as_str().len() + 1, &mut varint));
        payload.extend_from_slice(protocol.as_str().as_bytes());
        payload.push(b'\n');
    }
    payload.push(b'\n');

    let mut message = Vec::with_capacity(payload.len() + 4);
    message.extend_from_slice(unsigned_varint::encode::usize(payload.len(), &mut varint));
    message.extend_from_slice(&payload);

    io.write_all(&message).await?;
    io.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocols(names: &[&'static str]) -> Vec<ProtocolName> {
        names.iter().map(|name| ProtocolName::from(*name)).collect()
    }

    #[tokio::test]
    async fn first_common_protocol_wins() {
        let (dialer, listener) = tokio::io::duplex(1024);

        let dialer = tokio::spawn(async move {
            dialer_select(dialer, &protocols(&["/echo/2.0.0", "/echo/1.0.0"])).await
        });
        let listener =
            tokio::spawn(
                async move { listener_select(listener, &protocols(&["/echo/1.0.0"])).await },
            );

        let (_, chosen_dialer) = dialer.await.unwrap().unwrap();
        let (_, chosen_listener) = listener.await.unwrap().unwrap();

        assert_eq!(chosen_dialer.as_str(), "/echo/1.0.0");
        assert_eq!(chosen_listener.as_str(), "/echo/1.0.0");
    }

    #[tokio::test]
    async fn no_common_protocol_fails_dialer() {
        let (dialer, listener) = tokio::io::duplex(1024);

        let dialer =
            tokio::spawn(
                async move { dialer_select(dialer, &protocols(&["/echo/1.0.0"])).await },
            );
        let listener = tokio::spawn(async move {
            // Listener keeps serving until the dialer hangs up.
            let _ = listener_select(listener, &protocols(&["/other/1.0.0"])).await;
        });

        match dialer.await.unwrap() {
            Err(Error::UnsupportedProtocol(Some(protocol))) =>
                assert_eq!(protocol.as_str(), "/echo/1.0.0"),
            result => panic!("expected unsupported protocol, got {result:?}"),
        }

        listener.abort();
    }

    #[tokio::test]
    async fn lazy_select_happy_path_carries_data() {
        let (dialer, listener) = tokio::io::duplex(1024);

        let dialer = tokio::spawn(async move {
            let (mut negotiated, _) = lazy_select(dialer, ProtocolName::from("/echo/1.0.0"))
                .await
                .unwrap();

            // First application write goes out before any confirmation.
            negotiated.write_all(b"ping").await.unwrap();
            negotiated.flush().await.unwrap();

            let mut response = [0u8; 4];
            negotiated.read_exact(&mut response).await.unwrap();
            response
        });

        let listener = tokio::spawn(async move {
            let (mut io, _) = listener_select(listener, &protocols(&["/echo/1.0.0"])).await.unwrap();

            let mut request = [0u8; 4];
            io.read_exact(&mut request).await.unwrap();
            io.write_all(&request).await.unwrap();
            io.flush().await.unwrap();

            // Keep the listener half open until the dialer read the echo.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        });

        assert_eq!(&dialer.await.unwrap(), b"ping");
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn lazy_select_rejection_surfaces_on_first_read() {
        let (dialer, listener) = tokio::io::duplex(1024);

        let dialer = tokio::spawn(async move {
            let (mut negotiated, _) = lazy_select(dialer, ProtocolName::from("/echo/1.0.0"))
                .await
                .unwrap();

            let mut response = [0u8; 4];
            negotiated.read_exact(&mut response).await.map(|_| ())
        });

        let listener = tokio::spawn(async move {
            let _ = listener_select(listener, &protocols(&["/other/1.0.0"])).await;
        });

        let error = dialer.await.unwrap().unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::Unsupported);

        listener.abort();
    }

    #[test]
    fn select_and_handle_agree_on_first_common_element() {
        fn property(dialer_set: Vec<u8>, listener_set: Vec<u8>) -> bool {
            let dialer_protocols: Vec<ProtocolName> = dialer_set
                .iter()
                .map(|id| ProtocolName::from(format!("/proto/{}", id % 8)))
                .collect();
            let listener_protocols: Vec<ProtocolName> = listener_set
                .iter()
                .map(|id| ProtocolName::from(format!("/proto/{}", id % 8)))
                .collect();

            let expected = dialer_protocols
                .iter()
                .find(|protocol| listener_protocols.contains(protocol))
                .cloned();

            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
                .block_on(async move {
                    let (dialer, listener) = tokio::io::duplex(4096);

                    let listener_protocols_clone = listener_protocols.clone();
                    let listener_task = tokio::spawn(async move {
                        listener_select(listener, &listener_protocols_clone).await
                    });
                    let dialer_result = dialer_select(dialer, &dialer_protocols).await;

                    match expected {
                        Some(protocol) => {
                            let (_, chosen) = dialer_result.unwrap();
                            let (_, listener_chosen) = listener_task.await.unwrap().unwrap();
                            chosen == protocol && listener_chosen == protocol
                        }
                        None => {
                            listener_task.abort();
                            matches!(dialer_result, Err(Error::UnsupportedProtocol(_)))
                        }
                    }
                })
        }

        quickcheck::quickcheck(property as fn(Vec<u8>, Vec<u8>) -> bool);
    }
}
