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

//! Ed25519 keys.

use crate::error::Error;

use ed25519_dalek::Verifier;
use rand::RngCore;
use zeroize::Zeroize;

use std::fmt;

/// Ed25519 keypair.
pub struct Keypair(ed25519_dalek::Keypair);

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);

        let secret = ed25519_dalek::SecretKey::from_bytes(&bytes)
            .expect("32 bytes is a valid ed25519 secret key length; qed");
        let public = ed25519_dalek::PublicKey::from(&secret);
        bytes.zeroize();

        Keypair(ed25519_dalek::Keypair { secret, public })
    }

    /// Construct a keypair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &mut [u8]) -> crate::Result<Self> {
        let secret = ed25519_dalek::SecretKey::from_bytes(bytes)
            .map_err(|error| Error::InvalidParameters(error.to_string()))?;
        let public = ed25519_dalek::PublicKey::from(&secret);
        bytes.zeroize();

        Ok(Keypair(ed25519_dalek::Keypair { secret, public }))
    }

    /// Sign `message` with the secret key.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let expanded = ed25519_dalek::ExpandedSecretKey::from(&self.0.secret);
        expanded.sign(message, &self.0.public).to_bytes().to_vec()
    }

    /// Get the public half of the keypair.
    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.public)
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        let secret = ed25519_dalek::SecretKey::from_bytes(self.0.secret.as_bytes())
            .expect("secret key bytes came from a valid key; qed");

        Keypair(ed25519_dalek::Keypair {
            public: self.0.public,
            secret,
        })
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair").field("public", &self.0.public).finish()
    }
}

/// Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(ed25519_dalek::PublicKey);

impl PublicKey {
    /// Verify `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        ed25519_dalek::Signature::try_from(signature)
            .map(|signature| self.0.verify(message, &signature).is_ok())
            .unwrap_or(false)
    }

    /// Get the raw key bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Construct a public key from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        ed25519_dalek::PublicKey::from_bytes(bytes)
            .map(PublicKey)
            .map_err(|error| Error::InvalidMessage(error.to_string()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", bs58::encode(self.0.to_bytes()).into_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let keypair = Keypair::generate();
        let signature = keypair.sign(b"payload");

        assert!(keypair.public().verify(b"payload", &signature));
        assert!(!keypair.public().verify(b"payload", &signature[..63]));
    }

    #[test]
    fn cloned_keypair_signs_identically() {
        let keypair = Keypair::generate();
        let clone = keypair.clone();

        assert_eq!(keypair.sign(b"payload"), clone.sign(b"payload"));
        assert_eq!(keypair.public(), clone.public());
    }
}
