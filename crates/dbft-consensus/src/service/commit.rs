use super::ConsensusService;
use crate::error::ConsensusResult;
use crate::external::ServiceOutput;
use dbft_primitives::{Block, Commit, Envelope, ProposalSlot, Witness};
use ed25519_dalek::Signature;

impl ConsensusService {
    /// Records a commit. Commits are retained regardless of view — a commit
    /// observed once is never discarded within the height — but only tallied
    /// against the header its signature actually matches.
    pub(crate) fn on_commit(&mut self, envelope: Envelope, commit: Commit) -> ConsensusResult<()> {
        let origin = envelope.validator_index;
        let slot = commit.slot;
        if !self.context.store_commit(envelope, &commit) {
            tracing::debug!(origin, "commit already recorded for this validator");
            return Ok(());
        }
        tracing::info!(
            height = self.context.height(),
            view = self.context.view(),
            origin,
            ?slot,
            committed = self.context.count_committed(),
            "commit received"
        );
        self.check_commits(slot)
    }

    /// Finalization gate: `m` commit signatures verifying against one slot's
    /// header turn into a submitted block.
    pub(crate) fn check_commits(&mut self, slot: ProposalSlot) -> ConsensusResult<()> {
        if self.context.block_sent() {
            return Ok(());
        }
        let Some(header) = self.context.ensure_header(slot) else {
            return Ok(());
        };
        let header_bytes = header.to_bytes();

        let mut matching: Vec<(u16, Signature)> = Vec::new();
        for (index, record) in self.context.commits() {
            if record.slot != slot {
                continue;
            }
            let Ok(key) = self.context.validators().public_key(*index) else {
                continue;
            };
            // A retained commit from another view signed a different header
            // and simply fails this check; it stays recorded, uncounted.
            if key.verify_strict(&header_bytes, &record.signature).is_ok() {
                matching.push((*index, record.signature));
            }
        }
        if matching.len() < self.context.validators().quorum() {
            return Ok(());
        }

        let (transactions, missing) = {
            let state = self.context.slot(slot);
            let transactions: Vec<_> = state
                .tx_hashes()
                .iter()
                .filter_map(|hash| state.transactions().get(hash).cloned())
                .collect();
            (transactions, state.missing_tx_hashes())
        };
        if !missing.is_empty() {
            // Quorum exists but the body is incomplete locally; fetch and
            // retry when the transactions arrive.
            tracing::debug!(?slot, missing = missing.len(), "commit quorum ahead of local transactions");
            self.missing_transactions.extend(missing.iter().copied());
            self.emit(ServiceOutput::RequestTransactions(missing));
            return Ok(());
        }

        matching.sort_by_key(|(index, _)| *index);
        let block = Block {
            header,
            witness: Witness {
                signatures: matching,
            },
            transactions,
        };

        self.context.mark_block_sent();
        self.timer.disarm();
        tracing::info!(
            height = self.context.height(),
            view = self.context.view(),
            ?slot,
            hash = %block.hash(),
            signatures = block.witness.signatures.len(),
            "commit quorum reached; submitting block"
        );
        self.emit(ServiceOutput::SubmitBlock(block));
        Ok(())
    }
}
