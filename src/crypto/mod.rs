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

//! Cryptographic keys used for peer identity.

use crate::{error::Error, peer_id::PeerId, schema};

use prost::Message;

pub mod ed25519;

/// Public key of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// Ed25519 public key.
    Ed25519(ed25519::PublicKey),
}

impl PublicKey {
    /// Verify `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match self {
            PublicKey::Ed25519(key) => key.verify(message, signature),
        }
    }

    /// Encode the key as the canonical protobuf envelope.
    pub fn to_protobuf_encoding(&self) -> Vec<u8> {
        let key = match self {
            PublicKey::Ed25519(key) => schema::PublicKey {
                r#type: schema::KeyType::Ed25519 as i32,
                data: key.to_bytes().to_vec(),
            },
        };

        let mut buf = Vec::with_capacity(key.encoded_len());
        key.encode(&mut buf).expect("buffer to have sufficient capacity");
        buf
    }

    /// Decode a key from the canonical protobuf envelope.
    pub fn from_protobuf_encoding(bytes: &[u8]) -> crate::Result<Self> {
        let key = schema::PublicKey::decode(bytes)?;

        match schema::KeyType::from_i32(key.r#type) {
            Some(schema::KeyType::Ed25519) => Ok(PublicKey::Ed25519(
                ed25519::PublicKey::from_bytes(&key.data)?,
            )),
            _ => Err(Error::InvalidMessage(format!(
                "unsupported key type: {}",
                key.r#type
            ))),
        }
    }

    /// Derive the peer ID of this key.
    pub fn to_peer_id(&self) -> PeerId {
        PeerId::from_public_key(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protobuf_encoding_roundtrip() {
        let keypair = ed25519::Keypair::generate();
        let public = PublicKey::Ed25519(keypair.public());

        let encoded = public.to_protobuf_encoding();
        let decoded = PublicKey::from_protobuf_encoding(&encoded).unwrap();

        assert_eq!(public, decoded);
        assert_eq!(public.to_peer_id(), decoded.to_peer_id());
    }

    #[test]
    fn signature_verifies_only_for_signer() {
        let keypair1 = ed25519::Keypair::generate();
        let keypair2 = ed25519::Keypair::generate();

        let signature = keypair1.sign(b"hello, world");

        assert!(PublicKey::Ed25519(keypair1.public()).verify(b"hello, world", &signature));
        assert!(!PublicKey::Ed25519(keypair2.public()).verify(b"hello, world", &signature));
        assert!(!PublicKey::Ed25519(keypair1.public()).verify(b"hello, world!", &signature));
    }
}
