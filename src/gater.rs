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

//! Connection gating policy hooks.

use crate::peer_id::PeerId;

use multiaddr::Multiaddr;

/// Policy hooks consulted at each stage of establishing a connection.
///
/// Every predicate answers `true` to deny. The default implementation allows
/// everything.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ConnectionGater: Send + Sync {
    /// Deny dialing `peer` at all, before addresses are resolved.
    async fn deny_dial_peer(&self, _peer: &PeerId) -> bool {
        false
    }

    /// Deny dialing a specific address of a peer.
    async fn deny_dial_multiaddr(&self, _address: &Multiaddr) -> bool {
        false
    }

    /// Deny an inbound connection right after the transport accepted it.
    async fn deny_inbound_connection(&self, _address: &Multiaddr) -> bool {
        false
    }

    /// Deny an outbound connection after the security handshake.
    async fn deny_outbound_connection(&self, _peer: &PeerId, _address: &Multiaddr) -> bool {
        false
    }

    /// Deny an inbound connection after the security handshake.
    async fn deny_inbound_encrypted_connection(&self, _peer: &PeerId, _address: &Multiaddr) -> bool {
        false
    }

    /// Deny an inbound connection after the full upgrade.
    async fn deny_inbound_upgraded_connection(&self, _peer: &PeerId, _address: &Multiaddr) -> bool {
        false
    }

    /// Deny an outbound connection after the full upgrade.
    async fn deny_outbound_upgraded_connection(&self, _peer: &PeerId, _address: &Multiaddr) -> bool {
        false
    }

    /// Filter the addresses a peer may be dialed on.
    async fn filter_multiaddr_for_peer(&self, _peer: &PeerId, _address: &Multiaddr) -> bool {
        true
    }
}

/// Gater that allows everything.
#[derive(Debug, Default)]
pub struct AllowAll;

#[async_trait::async_trait]
impl ConnectionGater for AllowAll {}
