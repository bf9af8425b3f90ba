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

//! Canonical peer identity derived from a public key.

use crate::{crypto::PublicKey, error::Error};

use multihash::{Code, Multihash, MultihashDigest};
use rand::Rng;

use std::fmt;

/// Public keys no longer than this are inlined into the peer ID verbatim.
const MAX_INLINE_KEY_LENGTH: usize = 42;

/// Multihash code for the identity hash.
const MULTIHASH_IDENTITY_CODE: u64 = 0x00;

/// Multihash code for SHA2-256.
const MULTIHASH_SHA256_CODE: u64 = 0x12;

/// Peer ID.
///
/// A multihash over the protobuf encoding of the peer's public key. Compared
/// by byte equality.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    multihash: Multihash,
}

impl PeerId {
    /// Derive a peer ID from a public key.
    pub fn from_public_key(key: &PublicKey) -> PeerId {
        let encoded = key.to_protobuf_encoding();

        let multihash = if encoded.len() <= MAX_INLINE_KEY_LENGTH {
            Code::Identity.digest(&encoded)
        } else {
            Code::Sha2_256.digest(&encoded)
        };

        PeerId { multihash }
    }

    /// Interpret a multihash as a peer ID.
    ///
    /// Returns the multihash unchanged if its code is not a valid peer ID
    /// hash function.
    pub fn from_multihash(multihash: Multihash) -> Result<PeerId, Multihash> {
        match multihash.code() {
            MULTIHASH_IDENTITY_CODE | MULTIHASH_SHA256_CODE => Ok(PeerId { multihash }),
            _ => Err(multihash),
        }
    }

    /// Parse a peer ID from its canonical byte form.
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<PeerId> {
        let multihash =
            Multihash::from_bytes(bytes).map_err(|error| Error::InvalidMessage(error.to_string()))?;

        PeerId::from_multihash(multihash)
            .map_err(|_| Error::InvalidMessage("invalid peer id hash code".to_string()))
    }

    /// Get the canonical byte form.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.multihash.to_bytes()
    }

    /// Extract the public key if it is inlined in the peer ID.
    pub fn inline_public_key(&self) -> Option<PublicKey> {
        (self.multihash.code() == MULTIHASH_IDENTITY_CODE)
            .then(|| PublicKey::from_protobuf_encoding(self.multihash.digest()).ok())
            .flatten()
    }

    /// Generate a random peer ID, for tests and ephemeral identities.
    pub fn random() -> PeerId {
        let digest: [u8; 32] = rand::thread_rng().gen();

        PeerId {
            multihash: Multihash::wrap(MULTIHASH_IDENTITY_CODE, &digest)
                .expect("digest length is within the identity hash bound; qed"),
        }
    }
}

impl From<PeerId> for Multihash {
    fn from(peer: PeerId) -> Self {
        peer.multihash
    }
}

impl AsRef<Multihash> for PeerId {
    fn as_ref(&self) -> &Multihash {
        &self.multihash
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.to_bytes()).into_string())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PeerId").field(&self.to_string()).finish()
    }
}

impl std::str::FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|error| Error::InvalidMessage(error.to_string()))?;

        PeerId::from_bytes(&bytes)
    }
}
