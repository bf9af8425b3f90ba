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

//! Public-key-exchange security upgrade.
//!
//! Both sides send their peer ID and public key in one protobuf message and
//! verify that the two match. The channel is authenticated, not encrypted;
//! production deployments plug in a real handshake through the
//! [`ConnectionSecurity`] trait instead.

use crate::{
    codec,
    crypto::{ed25519::Keypair, PublicKey},
    error::Error,
    peer_id::PeerId,
    schema,
    security::{ConnectionSecurity, SecuredConnection},
    transport::RawConnection,
    types::protocol::ProtocolName,
};

use prost::Message;

/// Logging target for the file.
const LOG_TARGET: &str = "meshp2p::security::plaintext";

/// Protocol name used during security negotiation.
const PROTOCOL_NAME: &str = "/plaintext/2.0.0";

/// Maximum size of the exchange message.
const MAX_EXCHANGE_SIZE: usize = 1024;

/// The plaintext security upgrade.
pub struct PlainText {
    keypair: Keypair,
}

impl PlainText {
    /// Create a new plaintext upgrade authenticating as `keypair`.
    pub fn new(keypair: Keypair) -> Self {
        Self { keypair }
    }

    async fn exchange(
        &self,
        mut io: Box<dyn RawConnection>,
        expected_peer: Option<PeerId>,
    ) -> crate::Result<SecuredConnection> {
        let local_public = PublicKey::Ed25519(self.keypair.public());
        let local_exchange = schema::Exchange {
            id: Some(local_public.to_peer_id().to_bytes()),
            pubkey: Some(schema::PublicKey {
                r#type: schema::KeyType::Ed25519 as i32,
                data: self.keypair.public().to_bytes().to_vec(),
            }),
        };

        let mut message = Vec::with_capacity(local_exchange.encoded_len());
        local_exchange.encode(&mut message).expect("buffer to have sufficient capacity");
        codec::write_length_prefixed(&mut io, &message).await?;

        let remote_message = codec::read_length_prefixed(&mut io, MAX_EXCHANGE_SIZE)
            .await
            .map_err(|error| match error {
                Error::ConnectionEnded => Error::ConnectionEnded,
                error => Error::EncryptionFailed(error.to_string()),
            })?;
        let remote_exchange = schema::Exchange::decode(remote_message.as_slice())
            .map_err(|error| Error::EncryptionFailed(error.to_string()))?;

        let remote_key = remote_exchange.pubkey.ok_or(Error::MissingPublicKey)?;
        let mut key_bytes = Vec::with_capacity(remote_key.encoded_len());
        remote_key.encode(&mut key_bytes).expect("buffer to have sufficient capacity");
        let public_key = PublicKey::from_protobuf_encoding(&key_bytes)
            .map_err(|error| Error::EncryptionFailed(error.to_string()))?;

        let peer = public_key.to_peer_id();

        let claimed = remote_exchange
            .id
            .as_deref()
            .map(PeerId::from_bytes)
            .transpose()
            .map_err(|error| Error::EncryptionFailed(error.to_string()))?;
        if claimed != Some(peer) {
            tracing::debug!(target: LOG_TARGET, ?claimed, derived = ?peer, "peer id does not match key");
            return Err(Error::InvalidPeer);
        }

        if let Some(expected) = expected_peer {
            if expected != peer {
                tracing::debug!(target: LOG_TARGET, ?expected, actual = ?peer, "unexpected remote peer");
                return Err(Error::InvalidPeer);
            }
        }

        tracing::trace!(target: LOG_TARGET, ?peer, "handshake complete");

        Ok(SecuredConnection { io, peer, public_key })
    }
}

#[async_trait::async_trait]
impl ConnectionSecurity for PlainText {
    fn protocol(&self) -> ProtocolName {
        ProtocolName::from(PROTOCOL_NAME)
    }

    async fn secure_outbound(
        &self,
        io: Box<dyn RawConnection>,
        expected_peer: Option<PeerId>,
    ) -> crate::Result<SecuredConnection> {
        self.exchange(io, expected_peer).await
    }

    async fn secure_inbound(
        &self,
        io: Box<dyn RawConnection>,
        expected_peer: Option<PeerId>,
    ) -> crate::Result<SecuredConnection> {
        self.exchange(io, expected_peer).await
    }
}
