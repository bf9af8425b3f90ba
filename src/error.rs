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

//! Error types emitted by the node.
//!
//! Every user-visible variant carries a stable string code ([`Error::code()`])
//! so callers can match on errors without depending on the Rust type names.

use crate::{peer_id::PeerId, types::protocol::ProtocolName};

use multiaddr::Multiaddr;

use std::sync::Arc;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Node was configured without any transport.
    #[error("at least one transport is required")]
    TransportsRequired,

    /// Node was configured without any connection encryption method.
    #[error("at least one connection encryption method is required")]
    ConnEncryptionRequired,

    /// Private network is enforced but no protector was supplied.
    #[error("private network protector is required")]
    ProtectorRequired,

    /// Local node tried to dial itself.
    #[error("tried to dial self")]
    DialedSelf,

    /// No dialable address remained after resolution and filtering.
    #[error("no valid addresses for peer {0:?}")]
    NoValidAddresses(Option<PeerId>),

    /// Peer advertised more addresses than the configured dial limit.
    #[error("too many addresses to dial: {got} > {limit}")]
    TooManyAddresses { got: usize, limit: usize },

    /// Connection gater denied dialing the peer.
    #[error("dial to {0} denied by connection gater")]
    PeerDialIntercepted(PeerId),

    /// Transport failed to establish the connection.
    #[error("transport failed to dial {address}: {error}")]
    TransportDialFailed { address: Multiaddr, error: String },

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Security handshake failed.
    #[error("encryption handshake failed: {0}")]
    EncryptionFailed(String),

    /// No common stream multiplexer with the remote peer.
    #[error("no stream multiplexer available")]
    MuxerUnavailable,

    /// Connection gater denied the connection during upgrade.
    #[error("connection denied by connection gater")]
    ConnectionIntercepted,

    /// Remote closed the connection mid-exchange.
    #[error("connection ended unexpectedly")]
    ConnectionEnded,

    /// Malformed or over-size protocol message.
    #[error("invalid protocol message: {0}")]
    InvalidMessage(String),

    /// Identify message did not carry a public key.
    #[error("public key missing from identify message")]
    MissingPublicKey,

    /// Authenticated peer identity did not match expectations.
    #[error("remote peer identity is invalid or unexpected")]
    InvalidPeer,

    /// None of the proposed protocols is supported by the remote.
    #[error("protocol not supported: {0:?}")]
    UnsupportedProtocol(Option<ProtocolName>),

    /// Stream was reset by the remote peer.
    #[error("stream reset")]
    StreamReset,

    /// Per-protocol inbound stream cap exceeded.
    #[error("too many inbound streams for protocol {0}")]
    TooManyInboundStreams(ProtocolName),

    /// Per-protocol outbound stream cap exceeded.
    #[error("too many outbound streams for protocol {0}")]
    TooManyOutboundStreams(ProtocolName),

    /// Protocol did not opt in to running on a data/duration-limited
    /// connection.
    #[error("protocol {0} does not run on transient connections")]
    TransientConnection(ProtocolName),

    /// Connection is closed or closing.
    #[error("connection closed")]
    ConnectionClosed,

    /// Requested entity does not exist.
    ///
    /// Routine control-flow outcome for unknown peers, never a fault.
    #[error("not found")]
    NotFound,

    /// Caller supplied invalid parameters.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Address could not be interpreted.
    #[error(transparent)]
    AddressError(#[from] AddressError),

    /// Protocol negotiation failed.
    #[error(transparent)]
    NegotiationError(#[from] NegotiationError),

    /// All racing dial attempts failed.
    #[error("all dial attempts failed: {0:?}")]
    DialAggregate(Vec<Arc<Error>>),

    /// Error of a dial shared between concurrent callers.
    #[error(transparent)]
    SharedDial(Arc<Error>),

    /// Operation was aborted by the caller or node shutdown.
    #[error("operation aborted")]
    Aborted,

    /// Internal channel to a background task was closed.
    #[error("essential task closed")]
    EssentialTaskClosed,

    /// I/O error from the underlying resource.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Address interpretation errors.
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    /// Address contains a protocol component the node cannot handle.
    #[error("invalid protocol in address")]
    InvalidProtocol,

    /// Trailing `/p2p` component does not parse as a peer ID.
    #[error("peer id is invalid")]
    InvalidPeerId,

    /// Address references a transport that is not registered.
    #[error("transport not supported for {0}")]
    TransportNotSupported(Multiaddr),

    /// DNS component failed to resolve.
    #[error("failed to resolve dns address")]
    DnsResolutionFailed,
}

/// Protocol-select negotiation errors.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// Remote sent a message that violates the negotiation state machine.
    #[error("unexpected negotiation message")]
    StateMismatch,

    /// Remote spoke a different negotiation protocol version.
    #[error("unsupported negotiation version")]
    VersionMismatch,

    /// Message could not be parsed.
    #[error("failed to parse negotiation message")]
    ParseError,

    /// Negotiation message exceeded the maximum frame size.
    #[error("negotiation message too large")]
    MessageTooLarge,
}

impl Error {
    /// Stable string code for this error.
    ///
    /// Codes match across implementations in other languages and are safe to
    /// use for equality matching; the `Display` text is not.
    pub fn code(&self) -> &'static str {
        match self {
            Error::TransportsRequired => "ERR_TRANSPORTS_REQUIRED",
            Error::ConnEncryptionRequired => "ERR_CONN_ENCRYPTION_REQUIRED",
            Error::ProtectorRequired => "ERR_PROTECTOR_REQUIRED",
            Error::DialedSelf => "ERR_DIALED_SELF",
            Error::NoValidAddresses(_) => "ERR_NO_VALID_ADDRESSES",
            Error::TooManyAddresses { .. } => "ERR_TOO_MANY_ADDRESSES",
            Error::PeerDialIntercepted(_) => "ERR_PEER_DIAL_INTERCEPTED",
            Error::TransportDialFailed { .. } => "ERR_TRANSPORT_DIAL_FAILED",
            Error::Timeout => "ERR_TIMEOUT",
            Error::EncryptionFailed(_) => "ERR_ENCRYPTION_FAILED",
            Error::MuxerUnavailable => "ERR_MUXER_UNAVAILABLE",
            Error::ConnectionIntercepted => "ERR_CONNECTION_INTERCEPTED",
            Error::ConnectionEnded => "ERR_CONNECTION_ENDED",
            Error::InvalidMessage(_) => "ERR_INVALID_MESSAGE",
            Error::MissingPublicKey => "ERR_MISSING_PUBLIC_KEY",
            Error::InvalidPeer => "ERR_INVALID_PEER",
            Error::UnsupportedProtocol(_) => "ERR_UNSUPPORTED_PROTOCOL",
            Error::StreamReset => "ERR_STREAM_RESET",
            Error::TooManyInboundStreams(_) => "ERR_TOO_MANY_INBOUND_STREAMS",
            Error::TooManyOutboundStreams(_) => "ERR_TOO_MANY_OUTBOUND_STREAMS",
            Error::TransientConnection(_) => "ERR_TRANSIENT_CONNECTION",
            Error::ConnectionClosed => "ERR_CONNECTION_CLOSED",
            Error::NotFound => "ERR_NOT_FOUND",
            Error::InvalidParameters(_) => "ERR_INVALID_PARAMETERS",
            Error::AddressError(AddressError::TransportNotSupported(_)) =>
                "ERR_TRANSPORT_UNAVAILABLE",
            Error::AddressError(_) => "ERR_INVALID_MULTIADDR",
            Error::NegotiationError(_) => "ERR_UNSUPPORTED_PROTOCOL",
            Error::DialAggregate(_) => "ERR_DIAL_FAILED",
            Error::SharedDial(inner) => inner.code(),
            Error::Aborted => "ERR_ABORTED",
            Error::EssentialTaskClosed => "ERR_TASK_CLOSED",
            Error::Io(_) => "ERR_IO",
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::EssentialTaskClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::EssentialTaskClosed
    }
}

impl From<prost::DecodeError> for Error {
    fn from(error: prost::DecodeError) -> Self {
        Error::InvalidMessage(error.to_string())
    }
}
