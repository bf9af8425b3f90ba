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

//! Connection security abstraction.

use crate::{crypto::PublicKey, peer_id::PeerId, transport::RawConnection, types::protocol::ProtocolName};

pub mod plaintext;

/// Result of a successful security handshake.
pub struct SecuredConnection {
    /// The protected byte stream.
    pub io: Box<dyn RawConnection>,

    /// Authenticated remote peer ID.
    pub peer: PeerId,

    /// The remote's public key.
    pub public_key: PublicKey,
}

/// A connection encryption method negotiated during upgrade.
#[async_trait::async_trait]
pub trait ConnectionSecurity: Send + Sync {
    /// Protocol name used during security negotiation.
    fn protocol(&self) -> ProtocolName;

    /// Run the handshake as the dialing side.
    ///
    /// `expected_peer` is the peer the caller believes it is dialing; a
    /// mismatch with the authenticated identity fails the handshake.
    async fn secure_outbound(
        &self,
        io: Box<dyn RawConnection>,
        expected_peer: Option<PeerId>,
    ) -> crate::Result<SecuredConnection>;

    /// Run the handshake as the listening side.
    async fn secure_inbound(
        &self,
        io: Box<dyn RawConnection>,
        expected_peer: Option<PeerId>,
    ) -> crate::Result<SecuredConnection>;
}

/// Pre-protection transform applied to raw connections before any
/// negotiation, e.g. a private-network XOR stream.
#[async_trait::async_trait]
pub trait ConnectionProtector: Send + Sync {
    /// Wrap `io` into its protected form.
    async fn protect(&self, io: Box<dyn RawConnection>) -> crate::Result<Box<dyn RawConnection>>;
}
