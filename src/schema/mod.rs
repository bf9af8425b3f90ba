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

//! Protobuf wire schemas.
//!
//! Field numbers follow the libp2p specifications so the messages are
//! byte-compatible with other implementations.

/// Key type of a serialized public key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum KeyType {
    Rsa = 0,
    Ed25519 = 1,
    Secp256k1 = 2,
    Ecdsa = 3,
}

/// Serialized public key.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PublicKey {
    #[prost(enumeration = "KeyType", tag = "1")]
    pub r#type: i32,

    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

/// Identify message exchanged on `/ipfs/id/1.0.0` and the push variant.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Identify {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub public_key: Option<Vec<u8>>,

    #[prost(bytes = "vec", repeated, tag = "2")]
    pub listen_addrs: Vec<Vec<u8>>,

    #[prost(string, repeated, tag = "3")]
    pub protocols: Vec<String>,

    #[prost(bytes = "vec", optional, tag = "4")]
    pub observed_addr: Option<Vec<u8>>,

    #[prost(string, optional, tag = "5")]
    pub protocol_version: Option<String>,

    #[prost(string, optional, tag = "6")]
    pub agent_version: Option<String>,

    #[prost(bytes = "vec", optional, tag = "8")]
    pub signed_peer_record: Option<Vec<u8>>,
}

/// Signed envelope wrapping a typed payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    #[prost(message, optional, tag = "1")]
    pub public_key: Option<PublicKey>,

    #[prost(bytes = "vec", tag = "2")]
    pub payload_type: Vec<u8>,

    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,

    #[prost(bytes = "vec", tag = "5")]
    pub signature: Vec<u8>,
}

/// Peer record payload carried inside a signed envelope.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PeerRecord {
    #[prost(bytes = "vec", tag = "1")]
    pub peer_id: Vec<u8>,

    #[prost(uint64, tag = "2")]
    pub seq: u64,

    #[prost(message, repeated, tag = "3")]
    pub addresses: Vec<AddressInfo>,
}

/// One address inside a [`PeerRecord`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct AddressInfo {
    #[prost(bytes = "vec", tag = "1")]
    pub multiaddr: Vec<u8>,
}

/// Handshake message of the public-key-exchange security upgrade.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Exchange {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub id: Option<Vec<u8>>,

    #[prost(message, optional, tag = "2")]
    pub pubkey: Option<PublicKey>,
}

/// Persisted form of a peer-store entry.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PeerEntry {
    #[prost(message, repeated, tag = "1")]
    pub addresses: Vec<StoredAddress>,

    #[prost(string, repeated, tag = "2")]
    pub protocols: Vec<String>,

    #[prost(message, repeated, tag = "3")]
    pub metadata: Vec<MetadataEntry>,

    #[prost(message, repeated, tag = "4")]
    pub tags: Vec<StoredTag>,

    #[prost(bytes = "vec", optional, tag = "5")]
    pub peer_record_envelope: Option<Vec<u8>>,

    #[prost(bytes = "vec", optional, tag = "6")]
    pub public_key: Option<Vec<u8>>,
}

/// Persisted address with certification and liveness bookkeeping.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StoredAddress {
    #[prost(bytes = "vec", tag = "1")]
    pub multiaddr: Vec<u8>,

    #[prost(bool, tag = "2")]
    pub is_certified: bool,

    #[prost(uint64, optional, tag = "3")]
    pub last_success: Option<u64>,

    #[prost(uint64, optional, tag = "4")]
    pub last_failure: Option<u64>,
}

/// Persisted metadata entry; values are opaque bytes.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MetadataEntry {
    #[prost(string, tag = "1")]
    pub key: String,

    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// Persisted tag with an optional absolute expiry.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StoredTag {
    #[prost(string, tag = "1")]
    pub name: String,

    #[prost(uint32, tag = "2")]
    pub value: u32,

    #[prost(uint64, optional, tag = "3")]
    pub expires_at_millis: Option<u64>,
}
