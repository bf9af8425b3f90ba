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

//! Signed peer records.
//!
//! A peer record is a `(peer id, sequence number, addresses)` tuple sealed
//! inside an envelope signed with the peer's private key. Receivers keep only
//! the record with the highest sequence number per peer; addresses carried in
//! a verified record are considered certified.

use crate::{
    crypto::{ed25519::Keypair, PublicKey},
    error::Error,
    peer_id::PeerId,
    schema,
};

use multiaddr::Multiaddr;
use prost::Message;

/// Signature domain separator for peer records.
const DOMAIN: &str = "libp2p-peer-record";

/// Multicodec identifying the peer-record payload type.
const PAYLOAD_TYPE: [u8; 2] = [0x03, 0x01];

/// An unsealed peer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Peer the record describes.
    pub peer: PeerId,

    /// Monotonically increasing sequence number.
    pub seq: u64,

    /// Addresses the peer claims to be reachable at.
    pub addresses: Vec<Multiaddr>,
}

impl PeerRecord {
    /// Create a new record.
    pub fn new(peer: PeerId, seq: u64, addresses: Vec<Multiaddr>) -> Self {
        Self { peer, seq, addresses }
    }

    /// Seal the record into a signed envelope.
    ///
    /// `keypair` must be the keypair of [`PeerRecord::peer`].
    pub fn seal(&self, keypair: &Keypair) -> Vec<u8> {
        let payload = schema::PeerRecord {
            peer_id: self.peer.to_bytes(),
            seq: self.seq,
            addresses: self
                .addresses
                .iter()
                .map(|address| schema::AddressInfo {
                    multiaddr: address.to_vec(),
                })
                .collect(),
        };

        let mut payload_bytes = Vec::with_capacity(payload.encoded_len());
        payload.encode(&mut payload_bytes).expect("buffer to have sufficient capacity");

        let signature = keypair.sign(&signing_buffer(&payload_bytes));

        let envelope = schema::Envelope {
            public_key: Some(schema::PublicKey {
                r#type: schema::KeyType::Ed25519 as i32,
                data: keypair.public().to_bytes().to_vec(),
            }),
            payload_type: PAYLOAD_TYPE.to_vec(),
            payload: payload_bytes,
            signature,
        };

        let mut bytes = Vec::with_capacity(envelope.encoded_len());
        envelope.encode(&mut bytes).expect("buffer to have sufficient capacity");
        bytes
    }

    /// Open a sealed envelope, verifying the signature and that the embedded
    /// peer ID matches the signing key.
    pub fn from_envelope(bytes: &[u8]) -> crate::Result<PeerRecord> {
        let envelope = schema::Envelope::decode(bytes)?;

        if envelope.payload_type != PAYLOAD_TYPE {
            return Err(Error::InvalidMessage("unexpected envelope payload type".to_string()));
        }

        let key = envelope.public_key.ok_or(Error::MissingPublicKey)?;
        let mut key_bytes = Vec::with_capacity(key.encoded_len());
        key.encode(&mut key_bytes).expect("buffer to have sufficient capacity");
        let public = PublicKey::from_protobuf_encoding(&key_bytes)?;

        if !public.verify(&signing_buffer(&envelope.payload), &envelope.signature) {
            return Err(Error::InvalidMessage("envelope signature is invalid".to_string()));
        }

        let payload = schema::PeerRecord::decode(envelope.payload.as_slice())?;
        let peer = PeerId::from_bytes(&payload.peer_id)?;

        if peer != public.to_peer_id() {
            return Err(Error::InvalidPeer);
        }

        let addresses = payload
            .addresses
            .into_iter()
            .filter_map(|info| Multiaddr::try_from(info.multiaddr).ok())
            .collect();

        Ok(PeerRecord {
            peer,
            seq: payload.seq,
            addresses,
        })
    }
}

/// Build the domain-separated buffer that is signed.
///
/// Layout: `varint(len(domain)) || domain || varint(len(payload_type)) ||
/// payload_type || varint(len(payload)) || payload`.
fn signing_buffer(payload: &[u8]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(DOMAIN.len() + PAYLOAD_TYPE.len() + payload.len() + 12);
    let mut varint = unsigned_varint::encode::usize_buffer();

    for chunk in [DOMAIN.as_bytes(), &PAYLOAD_TYPE[..], payload] {
        buffer.extend_from_slice(unsigned_varint::encode::usize(chunk.len(), &mut varint));
        buffer.extend_from_slice(chunk);
    }

    buffer
}
