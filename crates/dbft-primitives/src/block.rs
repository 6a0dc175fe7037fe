use crate::transaction::Transaction;
use crate::{Height, ValidatorIndex};
use alloy_primitives::{keccak256, B256};
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};

/// Header of a block under construction or finalized.
///
/// The header is what commit signatures are made over: all honest validators
/// that commit in a round must agree on these fields byte for byte.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub prev_hash: B256,
    pub merkle_root: B256,
    /// Milliseconds since the Unix epoch, clamped by the proposal rules.
    pub timestamp: u64,
    pub nonce: u64,
    /// Chain index of this block (the round height).
    pub index: Height,
    /// Index of the validator whose proposal slot produced this block.
    pub primary_index: ValidatorIndex,
}

impl BlockHeader {
    /// Canonical little-endian encoding. Commit signatures sign these bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 32 + 8 + 8 + 4 + 2);
        out.extend_from_slice(self.prev_hash.as_slice());
        out.extend_from_slice(self.merkle_root.as_slice());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&self.primary_index.to_le_bytes());
        out
    }

    pub fn hash(&self) -> B256 {
        keccak256(self.to_bytes())
    }
}

/// Multi-signature witness: commit signatures in validator-index order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    pub signatures: Vec<(ValidatorIndex, Signature)>,
}

/// A fully signed block ready for submission to the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub witness: Witness,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> B256 {
        self.header.hash()
    }

    pub fn index(&self) -> Height {
        self.header.index
    }
}

/// Merkle root over an ordered transaction hash list.
///
/// An empty list hashes to zero; odd levels duplicate the trailing node.
pub fn merkle_root(hashes: &[B256]) -> B256 {
    if hashes.is_empty() {
        return B256::ZERO;
    }
    let mut level = hashes.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1];
            level.push(last);
        }
        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks_exact(2) {
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(pair[0].as_slice());
            buf[32..].copy_from_slice(pair[1].as_slice());
            next.push(keccak256(buf));
        }
        level = next;
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> BlockHeader {
        BlockHeader {
            prev_hash: B256::repeat_byte(0x11),
            merkle_root: B256::repeat_byte(0x22),
            timestamp: 1_700_000_000_000,
            nonce: 42,
            index: 10,
            primary_index: 2,
        }
    }

    #[test]
    fn test_header_encoding_layout() {
        let h = header();
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), 86);
        assert_eq!(&bytes[..32], h.prev_hash.as_slice());
        assert_eq!(&bytes[32..64], h.merkle_root.as_slice());
        assert_eq!(&bytes[64..72], &h.timestamp.to_le_bytes());
        assert_eq!(&bytes[72..80], &h.nonce.to_le_bytes());
        assert_eq!(&bytes[80..84], &10u32.to_le_bytes());
        assert_eq!(&bytes[84..86], &2u16.to_le_bytes());
    }

    #[test]
    fn test_header_hash_is_deterministic() {
        assert_eq!(header().hash(), header().hash());

        let mut other = header();
        other.nonce += 1;
        assert_ne!(header().hash(), other.hash());
    }

    #[test]
    fn test_merkle_root_empty() {
        assert_eq!(merkle_root(&[]), B256::ZERO);
    }

    #[test]
    fn test_merkle_root_single_leaf() {
        let leaf = B256::repeat_byte(0xAB);
        assert_eq!(merkle_root(&[leaf]), leaf);
    }

    #[test]
    fn test_merkle_root_odd_count_duplicates_last() {
        let a = B256::repeat_byte(0x01);
        let b = B256::repeat_byte(0x02);
        let c = B256::repeat_byte(0x03);
        // [a, b, c] should behave like [a, b, c, c].
        assert_eq!(merkle_root(&[a, b, c]), merkle_root(&[a, b, c, c]));
    }

    #[test]
    fn test_merkle_root_is_order_sensitive() {
        let a = B256::repeat_byte(0x01);
        let b = B256::repeat_byte(0x02);
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
    }
}
