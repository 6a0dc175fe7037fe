use super::ConsensusService;
use crate::error::{ConsensusError, ConsensusResult};
use crate::external::{ServiceOutput, Verdict};
use alloy_primitives::B256;
use dbft_primitives::{
    ChangeViewReason, Envelope, PrepareRequest, PrepareResponse, ProposalSlot, Transaction,
};
use std::collections::HashSet;
use std::time::Duration;

impl ConsensusService {
    /// Authors and broadcasts this node's prepare request for the slot it
    /// owns, drawing transactions from the mempool under the block limits.
    pub(crate) fn send_prepare_request(&mut self, slot: ProposalSlot) -> ConsensusResult<()> {
        let candidates = self
            .mempool
            .ordered_transactions(self.config.max_tx_per_block);

        let mut selected = Vec::new();
        let mut total_size = self.block_overhead();
        let mut total_fee: i64 = 0;
        for tx in candidates {
            if selected.len() >= self.config.max_tx_per_block {
                break;
            }
            if total_size + tx.size > self.config.max_block_size {
                break;
            }
            let fee = total_fee.saturating_add(tx.system_fee);
            if fee > self.config.max_block_system_fee {
                break;
            }
            total_size += tx.size;
            total_fee = fee;
            selected.push(tx);
        }

        let timestamp = self
            .context
            .prev_timestamp()
            .saturating_add(1)
            .max(self.now());
        let nonce = rand::random();

        let envelope = self
            .context
            .make_prepare_request(slot, timestamp, nonce, selected)?;
        if !self.persist_or_halt() {
            return Ok(());
        }

        tracing::info!(
            height = self.context.height(),
            view = self.context.view(),
            ?slot,
            tx_count = self.context.slot(slot).tx_hashes().len(),
            "broadcasting prepare request"
        );
        self.emit(ServiceOutput::Broadcast(envelope));

        // Stay live if the proposal stalls: the next tick escalates to a
        // view change alongside the backups.
        let height = self.context.height();
        let view = self.context.view();
        self.timer
            .schedule(Duration::from_millis(self.base_block_time_ms()), height, view);

        self.check_preparations(slot)
    }

    /// Handles a prepare request from the slot's primary.
    pub(crate) fn on_prepare_request(
        &mut self,
        envelope: Envelope,
        request: PrepareRequest,
    ) -> ConsensusResult<()> {
        if self.context.not_accepting_payloads() {
            tracing::debug!("prepare request ignored while view is changing");
            return Ok(());
        }
        if self.context.commit_sent() {
            return Ok(());
        }
        if envelope.view != self.context.view() {
            return Err(ConsensusError::ViewMismatch {
                current: self.context.view(),
                received: envelope.view,
            });
        }

        let slot = request.slot;
        let expected = self.context.expected_primary(slot);
        if envelope.validator_index != expected {
            return Err(ConsensusError::WrongOrigin {
                slot,
                expected,
                actual: envelope.validator_index,
            });
        }
        if self.context.slot(slot).prepare_request().is_some() {
            // One request per slot; a second one from the same primary is a
            // replay or an equivocation attempt.
            tracing::warn!(?slot, origin = envelope.validator_index, "duplicate prepare request ignored");
            return Ok(());
        }

        let lower = self.context.prev_timestamp();
        let upper = self.now().saturating_add(self.config.milliseconds_per_block);
        if request.timestamp <= lower || request.timestamp >= upper {
            return Err(ConsensusError::TimestampOutOfRange {
                timestamp: request.timestamp,
                lower,
                upper,
            });
        }

        if request.tx_hashes.len() > self.config.max_tx_per_block {
            return Err(ConsensusError::TooManyTransactions {
                count: request.tx_hashes.len(),
                limit: self.config.max_tx_per_block,
            });
        }
        let mut seen = HashSet::with_capacity(request.tx_hashes.len());
        if !request.tx_hashes.iter().all(|hash| seen.insert(*hash)) {
            return Err(ConsensusError::DuplicateTxHash);
        }

        tracing::info!(
            height = self.context.height(),
            view = self.context.view(),
            ?slot,
            origin = envelope.validator_index,
            tx_count = request.tx_hashes.len(),
            "prepare request received"
        );
        self.context.store_prepare_request(envelope, &request);
        if !self.persist_or_halt() {
            return Ok(());
        }

        // Resolve referenced transactions from the mempool; anything absent
        // is fetched from the transport.
        let mut missing: Vec<B256> = Vec::new();
        for hash in &request.tx_hashes {
            match self.mempool.lookup(hash) {
                Some(tx) => {
                    if !self.add_transaction(tx, true)? {
                        // A verification failure already escalated to a
                        // view change.
                        return Ok(());
                    }
                }
                None => missing.push(*hash),
            }
        }
        if !missing.is_empty() {
            self.missing_transactions.extend(missing.iter().copied());
            self.emit(ServiceOutput::RequestTransactions(missing));
        }

        self.check_prepare_response(slot)?;
        self.check_preparations(slot)
    }

    /// Stores a prepare response iff it acknowledges the stored request.
    pub(crate) fn on_prepare_response(
        &mut self,
        envelope: Envelope,
        response: PrepareResponse,
    ) -> ConsensusResult<()> {
        if self.context.not_accepting_payloads() {
            tracing::debug!("prepare response ignored while view is changing");
            return Ok(());
        }
        if envelope.view != self.context.view() {
            return Err(ConsensusError::ViewMismatch {
                current: self.context.view(),
                received: envelope.view,
            });
        }
        let slot = response.slot;
        if !self.context.store_prepare_response(envelope, &response) {
            tracing::debug!(?slot, "prepare response for unknown or foreign request dropped");
            return Ok(());
        }
        tracing::debug!(
            ?slot,
            responses = self.context.slot(slot).responses().len(),
            "prepare response recorded"
        );
        self.check_preparations(slot)
    }

    /// Admits a transaction into every slot that references it.
    ///
    /// Returns `Ok(false)` when admission failed and a view change was
    /// requested; the caller stops processing the current batch.
    pub(crate) fn add_transaction(&mut self, tx: Transaction, verify: bool) -> ConsensusResult<bool> {
        for slot in ProposalSlot::ALL {
            {
                let state = self.context.slot(slot);
                if !state.tx_hashes().contains(&tx.hash)
                    || state.transactions().contains_key(&tx.hash)
                {
                    continue;
                }
            }

            if self.context.slot(slot).verification().conflicts_with(&tx) {
                tracing::warn!(tx = %tx.hash, ?slot, "transaction conflicts with the proposal set");
                self.request_change_view(ChangeViewReason::TxInvalid)?;
                return Ok(false);
            }
            if verify {
                match self
                    .verifier
                    .verify(&tx, self.context.slot(slot).verification())
                {
                    Verdict::Valid => {}
                    Verdict::PolicyFail => {
                        tracing::warn!(tx = %tx.hash, ?slot, "transaction rejected by policy");
                        self.request_change_view(ChangeViewReason::TxRejectedByPolicy)?;
                        return Ok(false);
                    }
                    Verdict::Invalid => {
                        tracing::warn!(tx = %tx.hash, ?slot, "transaction failed verification");
                        self.request_change_view(ChangeViewReason::TxInvalid)?;
                        return Ok(false);
                    }
                }
            }

            self.context.install_transaction(slot, tx.clone());
            self.missing_transactions.remove(&tx.hash);

            if self.context.slot(slot).is_complete() {
                if !self.enforce_block_policy(slot)? {
                    return Ok(false);
                }
                self.check_prepare_response(slot)?;
                self.check_preparations(slot)?;
                self.check_commits(slot)?;
            }
        }
        Ok(true)
    }

    /// Broadcasts our prepare response once the slot's request is stored and
    /// every referenced transaction is in hand.
    pub(crate) fn check_prepare_response(&mut self, slot: ProposalSlot) -> ConsensusResult<()> {
        if self.context.is_watch_only()
            || self.context.response_sent(slot)
            || self.context.commit_sent()
            || self.context.view_changing()
        {
            return Ok(());
        }
        if self.context.my_slot() == Some(slot) {
            // The slot owner's request is its preparation.
            return Ok(());
        }
        if !self.context.slot(slot).is_complete() {
            return Ok(());
        }
        let envelope = self.context.make_prepare_response(slot)?;
        tracing::info!(
            height = self.context.height(),
            view = self.context.view(),
            ?slot,
            "broadcasting prepare response"
        );
        self.emit(ServiceOutput::Broadcast(envelope));
        Ok(())
    }

    /// Commit gate: a stored request, `m − 1` acknowledging responses and a
    /// fully resolved transaction set turn into our commit.
    pub(crate) fn check_preparations(&mut self, slot: ProposalSlot) -> ConsensusResult<()> {
        if self.context.block_sent() {
            return Ok(());
        }
        if self.context.commit_sent() {
            // Committed already (possibly in an earlier view): only the
            // commit tally can move this round forward.
            return self.check_commits(slot);
        }
        if self.context.is_watch_only() {
            return Ok(());
        }
        {
            let state = self.context.slot(slot);
            if state.prepare_request().is_none() || !state.is_complete() {
                return Ok(());
            }
            if state.responses().len() < self.context.validators().quorum() - 1 {
                return Ok(());
            }
        }

        let envelope = self.context.make_commit(slot)?;
        // The commit transition must hit stable storage before the commit
        // leaves the node.
        if !self.persist_or_halt() {
            return Ok(());
        }
        tracing::info!(
            height = self.context.height(),
            view = self.context.view(),
            ?slot,
            "preparation quorum reached; broadcasting commit"
        );
        self.emit(ServiceOutput::Broadcast(envelope));
        self.check_commits(slot)
    }

    /// Receive-side block policy: a fully resolved slot whose totals exceed
    /// the configured limits is rejected by a view change, not by a commit.
    fn enforce_block_policy(&mut self, slot: ProposalSlot) -> ConsensusResult<bool> {
        let (total_fee, total_size) = {
            let verification = self.context.slot(slot).verification();
            (verification.total_system_fee(), verification.total_size())
        };
        let over_fee = total_fee > self.config.max_block_system_fee;
        let over_size = total_size + self.block_overhead() > self.config.max_block_size;
        if over_fee || over_size {
            tracing::warn!(?slot, total_fee, total_size, "proposed block exceeds policy limits");
            self.request_change_view(ChangeViewReason::BlockRejectedByPolicy)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Estimated size of the header plus a full multi-signature witness.
    fn block_overhead(&self) -> usize {
        const HEADER_SIZE: usize = 86;
        const SIGNATURE_ENTRY_SIZE: usize = 66;
        HEADER_SIZE + self.context.validators().quorum() * SIGNATURE_ENTRY_SIZE
    }
}
