//! Core chain types consumed and produced by the consensus engine.
//!
//! Transactions are opaque byte strings identified by their SHA-256 hash.
//! The block header is the unit every PrepareRequest, PrepareResponse and
//! Commit signature covers, under a per-phase domain tag.

use {
    crate::signatures::Phase,
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    solana_signature::Signature,
};

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// An opaque transaction body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    pub data: Vec<u8>,
}

impl Transaction {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }

    /// The transaction's identity.
    pub fn hash(&self) -> Hash {
        solana_sha256_hasher::hash(&self.data)
    }
}

// ---------------------------------------------------------------------------
// Block types
// ---------------------------------------------------------------------------

/// Header of a block candidate or finalized block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    /// Hash of the previous block's header.
    pub prev_hash: Hash,
    /// Merkle root over the ordered transaction hashes.
    pub merkle_root: Hash,
    /// Unix timestamp in milliseconds, chosen by the primary.
    pub timestamp: u64,
    pub nonce: u64,
    /// Block height.
    pub index: u32,
    /// Ordinal of the validator that proposed this block.
    pub primary_index: u8,
}

impl BlockHeader {
    /// Bytes covered by consensus signatures: every field, little-endian, in
    /// declaration order.
    pub fn sign_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + 32 + 32 + 8 + 8 + 4 + 1);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.prev_hash.as_ref());
        data.extend_from_slice(self.merkle_root.as_ref());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        data.extend_from_slice(&self.index.to_le_bytes());
        data.push(self.primary_index);
        data
    }

    /// Bytes a validator signs to endorse this header in `phase`.
    pub fn signing_bytes(&self, phase: Phase) -> Vec<u8> {
        let domain = phase.domain();
        let mut data = Vec::with_capacity(domain.len() + 89);
        data.extend_from_slice(domain);
        data.extend_from_slice(&self.sign_data());
        data
    }

    /// Compute the header hash.
    pub fn hash(&self) -> Hash {
        solana_sha256_hasher::hash(&self.sign_data())
    }
}

/// Multi-signature proof attached to a finalized block: the first quorum of
/// commit signatures in ordinal order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Witness {
    pub signatures: Vec<(u8, Signature)>,
}

impl Witness {
    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Ordinals that signed, in witness order.
    pub fn signers(&self) -> impl Iterator<Item = u8> + '_ {
        self.signatures.iter().map(|(index, _)| *index)
    }
}

/// A block that reached commit quorum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    /// Transactions in proposal order.
    pub transactions: Vec<Transaction>,
    pub witness: Witness,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn index(&self) -> u32 {
        self.header.index
    }
}

/// Binary SHA-256 merkle root over `hashes`.
///
/// An odd node at any level is paired with itself. The root of an empty list
/// is the default hash.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return Hash::default();
    }
    let mut level = hashes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                solana_sha256_hasher::hashv(&[left.as_ref(), right.as_ref()])
            })
            .collect();
    }
    level[0]
}
