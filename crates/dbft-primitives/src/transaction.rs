use alloy_primitives::B256;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A transaction as seen by the consensus core.
///
/// Content is opaque here; only the identity, resource footprint and the
/// declared conflict set matter for proposal assembly and batch verification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Content hash, the identity used throughout the protocol.
    pub hash: B256,
    /// Serialized size in bytes, counted against the block size limit.
    pub size: usize,
    /// System fee, counted against the block fee limit.
    pub system_fee: i64,
    /// Hashes of transactions this one declares itself in conflict with.
    /// Two conflicting transactions must never land in the same block.
    pub conflicts: Vec<B256>,
}

/// Running batch-verification state for one proposal slot.
///
/// Accumulates the identities and declared conflicts of every transaction
/// admitted to the slot, plus the size/fee totals the block policy caps are
/// checked against.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VerificationContext {
    included: HashSet<B256>,
    declared_conflicts: HashSet<B256>,
    total_size: usize,
    total_system_fee: i64,
}

impl VerificationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `tx` conflicts with the transactions already admitted:
    /// either an admitted transaction declared `tx.hash`, or `tx` declares
    /// one of the admitted hashes.
    pub fn conflicts_with(&self, tx: &Transaction) -> bool {
        if self.declared_conflicts.contains(&tx.hash) {
            return true;
        }
        tx.conflicts.iter().any(|h| self.included.contains(h))
    }

    /// Admits `tx`, folding its identity, conflicts and footprint into the
    /// running state. The caller checks `conflicts_with` first.
    pub fn add_transaction(&mut self, tx: &Transaction) {
        self.included.insert(tx.hash);
        for hash in &tx.conflicts {
            self.declared_conflicts.insert(*hash);
        }
        self.total_size += tx.size;
        self.total_system_fee = self.total_system_fee.saturating_add(tx.system_fee);
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn total_system_fee(&self) -> i64 {
        self.total_system_fee
    }

    pub fn len(&self) -> usize {
        self.included.len()
    }

    pub fn is_empty(&self) -> bool {
        self.included.is_empty()
    }
}
