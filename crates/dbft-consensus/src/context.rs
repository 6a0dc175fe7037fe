use crate::error::{ConsensusError, ConsensusResult};
use crate::validator::{PrimarySelector, Role, ValidatorSet};
use alloy_primitives::B256;
use dbft_primitives::{
    merkle_root, BlockHeader, ChangeView, ChangeViewReason, Commit, ConsensusPayload, Envelope,
    Height, PrepareRequest, PrepareResponse, ProposalSlot, RecoveryMessage, RecoveryRequest,
    Transaction, ValidatorIndex, VerificationContext, View,
};
use ed25519_dalek::{Signature, Signer, SigningKey};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Per-slot proposal state: the request, the transactions it references and
/// the prepare responses acknowledging it.
#[derive(Debug, Default, Clone)]
pub struct SlotState {
    prepare_request: Option<Envelope>,
    request_hash: Option<B256>,
    tx_hashes: Vec<B256>,
    transactions: HashMap<B256, Transaction>,
    responses: HashMap<ValidatorIndex, Envelope>,
    verification: VerificationContext,
    header: Option<BlockHeader>,
}

impl SlotState {
    fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn prepare_request(&self) -> Option<&Envelope> {
        self.prepare_request.as_ref()
    }

    /// Envelope hash of the stored prepare request, the value responses must
    /// acknowledge.
    pub fn request_hash(&self) -> Option<B256> {
        self.request_hash
    }

    pub fn tx_hashes(&self) -> &[B256] {
        &self.tx_hashes
    }

    pub fn transactions(&self) -> &HashMap<B256, Transaction> {
        &self.transactions
    }

    pub fn responses(&self) -> &HashMap<ValidatorIndex, Envelope> {
        &self.responses
    }

    pub fn verification(&self) -> &VerificationContext {
        &self.verification
    }

    pub fn header(&self) -> Option<&BlockHeader> {
        self.header.as_ref()
    }

    /// True once a request is stored and every referenced transaction is
    /// resolved.
    pub fn is_complete(&self) -> bool {
        self.prepare_request.is_some() && self.transactions.len() == self.tx_hashes.len()
    }

    pub fn missing_tx_hashes(&self) -> Vec<B256> {
        self.tx_hashes
            .iter()
            .filter(|h| !self.transactions.contains_key(*h))
            .copied()
            .collect()
    }
}

/// A commit observed from (or authored by) a validator. Once recorded it is
/// never replaced within the height, across any number of view changes.
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub view: View,
    pub slot: ProposalSlot,
    pub signature: Signature,
    pub envelope: Envelope,
}

/// The latest change-view statement seen from a validator.
#[derive(Debug, Clone)]
pub struct ChangeViewRecord {
    pub new_view: View,
    pub reason: ChangeViewReason,
    pub envelope: Envelope,
}

/// Per-round consensus state for one `(height, view)` pair.
///
/// The context is exclusively owned by the service; external components only
/// ever see payload clones. All signing happens here, against the local
/// validator key.
pub struct ConsensusContext {
    height: Height,
    view: View,
    prev_hash: B256,
    prev_timestamp: u64,
    validators: ValidatorSet,
    my_index: Option<ValidatorIndex>,
    signing_key: Option<SigningKey>,
    slots: [SlotState; 2],
    commits: HashMap<ValidatorIndex, CommitRecord>,
    change_views: HashMap<ValidatorIndex, ChangeViewRecord>,
    last_seen: HashMap<ValidatorIndex, Height>,
    known_hashes: HashSet<B256>,
    request_sent_or_received: bool,
    response_sent: [bool; 2],
    commit_sent: bool,
    block_sent: bool,
    view_changing: bool,
}

impl ConsensusContext {
    /// Creates a context for the given epoch set. A node whose key is absent
    /// from the set (or which has no key) observes as watch-only.
    pub fn new(validators: ValidatorSet, signing_key: Option<SigningKey>) -> Self {
        let my_index = signing_key
            .as_ref()
            .and_then(|key| validators.index_of(&key.verifying_key()));
        Self {
            height: 0,
            view: 0,
            prev_hash: B256::ZERO,
            prev_timestamp: 0,
            validators,
            my_index,
            signing_key,
            slots: [SlotState::default(), SlotState::default()],
            commits: HashMap::new(),
            change_views: HashMap::new(),
            last_seen: HashMap::new(),
            known_hashes: HashSet::new(),
            request_sent_or_received: false,
            response_sent: [false, false],
            commit_sent: false,
            block_sent: false,
            view_changing: false,
        }
    }

    /// Enters a new height on top of the given chain tip and fully
    /// reinitializes the round state.
    pub fn start_height(&mut self, height: Height, prev_hash: B256, prev_timestamp: u64) {
        self.height = height;
        self.prev_hash = prev_hash;
        self.prev_timestamp = prev_timestamp;
        // First sighting of a validator is deemed "alive as of the previous
        // height"; silence across a full height then counts as failed.
        for index in self.validators.indices().collect::<Vec<_>>() {
            self.last_seen
                .entry(index)
                .or_insert(height.saturating_sub(1));
        }
        if let Some(index) = self.my_index {
            self.last_seen.insert(index, height);
        }
        self.reset(0);
    }

    /// Rebuilds slot state for `(height, new_view)`.
    ///
    /// Entering view 0 (a fresh height) clears everything; a view change
    /// keeps `commits` and the change-view tallies — a commit once recorded
    /// is never rescinded within a height.
    pub fn reset(&mut self, new_view: View) {
        for slot in &mut self.slots {
            slot.reset();
        }
        self.view = new_view;
        self.request_sent_or_received = false;
        self.response_sent = [false, false];
        self.view_changing = false;
        if new_view == 0 {
            self.commits.clear();
            self.change_views.clear();
            self.known_hashes.clear();
            self.commit_sent = false;
            self.block_sent = false;
        }
    }

    // ── Accessors ──

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn prev_hash(&self) -> B256 {
        self.prev_hash
    }

    pub fn prev_timestamp(&self) -> u64 {
        self.prev_timestamp
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn my_index(&self) -> Option<ValidatorIndex> {
        self.my_index
    }

    pub fn role(&self) -> Role {
        PrimarySelector::role_of(self.my_index, self.height, self.view, &self.validators)
    }

    pub fn is_watch_only(&self) -> bool {
        self.role() == Role::WatchOnly
    }

    /// Slot the local node is authorized to propose on, if any.
    pub fn my_slot(&self) -> Option<ProposalSlot> {
        self.my_index
            .and_then(|i| PrimarySelector::slot_of(i, self.height, self.view, &self.validators))
    }

    pub fn expected_primary(&self, slot: ProposalSlot) -> ValidatorIndex {
        PrimarySelector::primary_for_slot(slot, self.height, self.view, &self.validators)
    }

    pub fn slot(&self, slot: ProposalSlot) -> &SlotState {
        &self.slots[slot.index()]
    }

    pub fn commits(&self) -> &HashMap<ValidatorIndex, CommitRecord> {
        &self.commits
    }

    pub fn change_views(&self) -> &HashMap<ValidatorIndex, ChangeViewRecord> {
        &self.change_views
    }

    pub fn my_commit(&self) -> Option<&CommitRecord> {
        self.my_index.and_then(|i| self.commits.get(&i))
    }

    pub fn commit_sent(&self) -> bool {
        self.commit_sent
    }

    pub fn block_sent(&self) -> bool {
        self.block_sent
    }

    pub fn mark_block_sent(&mut self) {
        self.block_sent = true;
    }

    pub fn request_sent_or_received(&self) -> bool {
        self.request_sent_or_received
    }

    pub fn response_sent(&self, slot: ProposalSlot) -> bool {
        self.response_sent[slot.index()]
    }

    pub fn view_changing(&self) -> bool {
        self.view_changing
    }

    // ── Counters ──

    pub fn count_committed(&self) -> usize {
        self.commits.len()
    }

    /// Validators that have not been heard from since before the previous
    /// height.
    pub fn count_failed(&self) -> usize {
        self.validators
            .indices()
            .filter(|i| self.last_seen.get(i).copied().unwrap_or(0) + 1 < self.height)
            .count()
    }

    /// When true, the commit quorum can no longer be reached by view changes
    /// alone and the node must fall back to recovery.
    pub fn more_than_f_committed_or_failed(&self) -> bool {
        self.count_committed() + self.count_failed() > self.validators.fault_tolerance()
    }

    pub fn not_accepting_payloads(&self) -> bool {
        self.view_changing && !self.more_than_f_committed_or_failed()
    }

    // ── Inbound bookkeeping ──

    /// Marks a payload hash as seen. Returns false when it was already known.
    pub fn note_known(&mut self, hash: B256) -> bool {
        self.known_hashes.insert(hash)
    }

    pub fn record_seen(&mut self, origin: ValidatorIndex) {
        let entry = self.last_seen.entry(origin).or_insert(0);
        if *entry < self.height {
            *entry = self.height;
        }
    }

    pub fn store_prepare_request(&mut self, envelope: Envelope, request: &PrepareRequest) {
        let state = &mut self.slots[request.slot.index()];
        state.reset();
        state.request_hash = Some(envelope.hash());
        state.tx_hashes = request.tx_hashes.clone();
        state.prepare_request = Some(envelope);
        self.request_sent_or_received = true;
    }

    /// Stores a prepare response iff it acknowledges the stored request.
    pub fn store_prepare_response(&mut self, envelope: Envelope, response: &PrepareResponse) -> bool {
        let state = &mut self.slots[response.slot.index()];
        match state.request_hash {
            Some(hash) if hash == response.request_hash => {
                state.responses.entry(envelope.validator_index).or_insert(envelope);
                true
            }
            _ => false,
        }
    }

    /// Records a commit. The first commit from a validator wins; later ones
    /// are ignored (a commit is never rescinded within a height).
    pub fn store_commit(&mut self, envelope: Envelope, commit: &Commit) -> bool {
        let origin = envelope.validator_index;
        if self.commits.contains_key(&origin) {
            return false;
        }
        self.commits.insert(
            origin,
            CommitRecord {
                view: envelope.view,
                slot: commit.slot,
                signature: commit.signature,
                envelope,
            },
        );
        true
    }

    /// Records a change-view statement, keeping the highest target per peer.
    pub fn store_change_view(&mut self, envelope: Envelope, change_view: &ChangeView) -> bool {
        let origin = envelope.validator_index;
        if let Some(existing) = self.change_views.get(&origin) {
            if existing.new_view >= change_view.new_view {
                return false;
            }
        }
        self.change_views.insert(
            origin,
            ChangeViewRecord {
                new_view: change_view.new_view,
                reason: change_view.reason,
                envelope,
            },
        );
        true
    }

    pub fn install_transaction(&mut self, slot: ProposalSlot, tx: Transaction) {
        let state = &mut self.slots[slot.index()];
        state.verification.add_transaction(&tx);
        state.transactions.insert(tx.hash, tx);
    }

    // ── Payload authoring ──

    fn sign_payload(&mut self, payload: ConsensusPayload) -> ConsensusResult<Envelope> {
        let index = self.my_index.ok_or(ConsensusError::WatchOnly)?;
        let key = self.signing_key.as_ref().ok_or(ConsensusError::WatchOnly)?;
        let envelope = Envelope::new_signed(self.height, index, self.view, payload, key);
        self.known_hashes.insert(envelope.hash());
        self.last_seen.insert(index, self.height);
        Ok(envelope)
    }

    /// Authors a prepare request for a slot the local node owns, installing
    /// the chosen transactions into the slot.
    pub fn make_prepare_request(
        &mut self,
        slot: ProposalSlot,
        timestamp: u64,
        nonce: u64,
        transactions: Vec<Transaction>,
    ) -> ConsensusResult<Envelope> {
        let index = self.my_index.ok_or(ConsensusError::WatchOnly)?;
        if self.expected_primary(slot) != index {
            return Err(ConsensusError::NotSlotOwner { slot });
        }
        let tx_hashes: Vec<B256> = transactions.iter().map(|tx| tx.hash).collect();
        let envelope = self.sign_payload(ConsensusPayload::PrepareRequest(PrepareRequest {
            slot,
            timestamp,
            nonce,
            tx_hashes: tx_hashes.clone(),
        }))?;

        let state = &mut self.slots[slot.index()];
        state.reset();
        state.request_hash = Some(envelope.hash());
        state.tx_hashes = tx_hashes;
        state.prepare_request = Some(envelope.clone());
        for tx in transactions {
            state.verification.add_transaction(&tx);
            state.transactions.insert(tx.hash, tx);
        }
        self.request_sent_or_received = true;
        Ok(envelope)
    }

    /// Echoes the hash of the observed prepare request for a slot.
    pub fn make_prepare_response(&mut self, slot: ProposalSlot) -> ConsensusResult<Envelope> {
        let request_hash = self.slots[slot.index()]
            .request_hash
            .ok_or(ConsensusError::MissingPrepareRequest { slot })?;
        let envelope = self.sign_payload(ConsensusPayload::PrepareResponse(PrepareResponse {
            slot,
            request_hash,
        }))?;
        self.slots[slot.index()]
            .responses
            .insert(envelope.validator_index, envelope.clone());
        self.response_sent[slot.index()] = true;
        Ok(envelope)
    }

    /// Authors a change-view statement targeting `view + 1`.
    pub fn make_change_view(
        &mut self,
        reason: ChangeViewReason,
        timestamp: u64,
    ) -> ConsensusResult<Envelope> {
        let new_view = self.view.saturating_add(1);
        let envelope = self.sign_payload(ConsensusPayload::ChangeView(ChangeView {
            reason,
            new_view,
            timestamp,
        }))?;
        self.view_changing = true;
        self.change_views.insert(
            envelope.validator_index,
            ChangeViewRecord {
                new_view,
                reason,
                envelope: envelope.clone(),
            },
        );
        Ok(envelope)
    }

    /// Signs the slot's block header. Idempotent: once committed, the stored
    /// payload is returned again, never a second signature at this height.
    pub fn make_commit(&mut self, slot: ProposalSlot) -> ConsensusResult<Envelope> {
        let index = self.my_index.ok_or(ConsensusError::WatchOnly)?;
        if let Some(record) = self.commits.get(&index) {
            return Ok(record.envelope.clone());
        }
        let header = self
            .ensure_header(slot)
            .ok_or(ConsensusError::MissingPrepareRequest { slot })?;
        let key = self.signing_key.as_ref().ok_or(ConsensusError::WatchOnly)?;
        let signature = key.sign(&header.to_bytes());
        let envelope = self.sign_payload(ConsensusPayload::Commit(Commit { slot, signature }))?;
        self.commits.insert(
            index,
            CommitRecord {
                view: self.view,
                slot,
                signature,
                envelope: envelope.clone(),
            },
        );
        self.commit_sent = true;
        Ok(envelope)
    }

    pub fn make_recovery_request(&mut self, timestamp: u64) -> ConsensusResult<Envelope> {
        self.sign_payload(ConsensusPayload::RecoveryRequest(RecoveryRequest { timestamp }))
    }

    /// Bundles everything this node has observed, in validator-index order,
    /// sufficient to bootstrap a lagging peer.
    pub fn make_recovery_message(&mut self) -> ConsensusResult<Envelope> {
        let sorted = |map: Vec<(ValidatorIndex, Envelope)>| -> Vec<Envelope> {
            let mut entries = map;
            entries.sort_by_key(|(index, _)| *index);
            entries.into_iter().map(|(_, env)| env).collect()
        };

        let change_views = sorted(
            self.change_views
                .iter()
                .map(|(i, r)| (*i, r.envelope.clone()))
                .collect(),
        );
        let prepare_requests = self
            .slots
            .iter()
            .filter_map(|s| s.prepare_request.clone())
            .collect();
        let prepare_responses = sorted(
            self.slots
                .iter()
                .flat_map(|s| s.responses.iter().map(|(i, e)| (*i, e.clone())))
                .collect(),
        );
        let commits = sorted(
            self.commits
                .iter()
                .map(|(i, r)| (*i, r.envelope.clone()))
                .collect(),
        );

        self.sign_payload(ConsensusPayload::RecoveryMessage(RecoveryMessage {
            change_views,
            prepare_requests,
            prepare_responses,
            commits,
        }))
    }

    /// Builds the deterministic block header for a slot, or `None` when the
    /// slot has no prepare request yet. The header is cached on first build.
    pub fn ensure_header(&mut self, slot: ProposalSlot) -> Option<BlockHeader> {
        if self.slots[slot.index()].header.is_none() {
            let request = match self.slots[slot.index()].prepare_request.as_ref() {
                Some(envelope) => match &envelope.payload {
                    ConsensusPayload::PrepareRequest(request) => request.clone(),
                    _ => return None,
                },
                None => return None,
            };
            let header = BlockHeader {
                prev_hash: self.prev_hash,
                merkle_root: merkle_root(&request.tx_hashes),
                timestamp: request.timestamp,
                nonce: request.nonce,
                index: self.height,
                primary_index: self.expected_primary(slot),
            };
            self.slots[slot.index()].header = Some(header);
        }
        self.slots[slot.index()].header.clone()
    }

    // ── Persistence ──

    pub fn snapshot(&self) -> ContextSnapshot {
        let slot_snapshot = |state: &SlotState| SlotSnapshot {
            prepare_request: state.prepare_request.clone(),
            transactions: state.transactions.values().cloned().collect(),
            responses: state.responses.values().cloned().collect(),
        };
        ContextSnapshot {
            version: SNAPSHOT_VERSION,
            height: self.height,
            view: self.view,
            prev_hash: self.prev_hash,
            prev_timestamp: self.prev_timestamp,
            commit_sent: self.commit_sent,
            request_sent_or_received: self.request_sent_or_received,
            response_sent: self.response_sent,
            view_changing: self.view_changing,
            slots: self.slots.iter().map(slot_snapshot).collect(),
            commits: self.commits.values().map(|r| r.envelope.clone()).collect(),
            change_views: self
                .change_views
                .values()
                .map(|r| r.envelope.clone())
                .collect(),
        }
    }

    /// Restores round state from a persisted snapshot. The snapshot's
    /// envelopes are replayed into the in-memory maps; the local node's own
    /// commit, if present, re-enters the commit-sent state.
    pub fn restore(&mut self, snapshot: ContextSnapshot) {
        self.start_height(snapshot.height, snapshot.prev_hash, snapshot.prev_timestamp);
        self.view = snapshot.view;

        for slot_snapshot in snapshot.slots.into_iter().take(2) {
            let Some(envelope) = slot_snapshot.prepare_request else {
                continue;
            };
            let ConsensusPayload::PrepareRequest(request) = envelope.payload.clone() else {
                continue;
            };
            self.known_hashes.insert(envelope.hash());
            self.store_prepare_request(envelope, &request);
            for tx in slot_snapshot.transactions {
                self.install_transaction(request.slot, tx);
            }
            for envelope in slot_snapshot.responses {
                if let ConsensusPayload::PrepareResponse(response) = envelope.payload.clone() {
                    self.known_hashes.insert(envelope.hash());
                    self.store_prepare_response(envelope, &response);
                }
            }
        }

        for envelope in snapshot.commits {
            if let ConsensusPayload::Commit(commit) = envelope.payload.clone() {
                self.known_hashes.insert(envelope.hash());
                self.store_commit(envelope, &commit);
            }
        }
        for envelope in snapshot.change_views {
            if let ConsensusPayload::ChangeView(change_view) = envelope.payload.clone() {
                self.known_hashes.insert(envelope.hash());
                self.store_change_view(envelope, &change_view);
            }
        }

        self.request_sent_or_received = snapshot.request_sent_or_received;
        self.response_sent = snapshot.response_sent;
        self.view_changing = snapshot.view_changing;
        self.commit_sent = snapshot.commit_sent || self.my_commit().is_some();
    }
}

impl std::fmt::Debug for ConsensusContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusContext")
            .field("height", &self.height)
            .field("view", &self.view)
            .field("role", &self.role())
            .field("commit_sent", &self.commit_sent)
            .field("block_sent", &self.block_sent)
            .finish()
    }
}

/// Current persisted snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

/// Serialized slot state: the signed envelopes plus resolved transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub prepare_request: Option<Envelope>,
    pub transactions: Vec<Transaction>,
    pub responses: Vec<Envelope>,
}

/// Round state persisted across restarts.
///
/// Everything needed for `ConsensusContext::restore` to rebuild the slot
/// states and the commit tally. Envelopes keep their original signatures so
/// a restarted node retransmits exactly what it signed before the crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    pub height: Height,
    pub view: View,
    pub prev_hash: B256,
    pub prev_timestamp: u64,
    pub commit_sent: bool,
    pub request_sent_or_received: bool,
    pub response_sent: [bool; 2],
    pub view_changing: bool,
    pub slots: Vec<SlotSnapshot>,
    pub commits: Vec<Envelope>,
    pub change_views: Vec<Envelope>,
}

impl ContextSnapshot {
    /// Checks internal consistency, returning a description of the first
    /// violation.
    pub fn validate(&self) -> Result<(), String> {
        if self.slots.len() != 2 {
            return Err(format!("expected 2 slot snapshots, found {}", self.slots.len()));
        }
        for envelope in self.commits.iter().chain(&self.change_views) {
            if envelope.height != self.height {
                return Err(format!(
                    "envelope height {} does not match snapshot height {}",
                    envelope.height, self.height
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbft_primitives::PayloadKind;

    fn signing_key(index: u8) -> SigningKey {
        let mut bytes = [0u8; 32];
        bytes[0] = index;
        bytes[31] = 0xED;
        SigningKey::from_bytes(&bytes)
    }

    fn make_set(n: u8) -> ValidatorSet {
        ValidatorSet::new((0..n).map(|i| signing_key(i).verifying_key()).collect())
    }

    /// Context for validator `index` at height 10, view 0 over a 4-set.
    fn make_context(index: u8) -> ConsensusContext {
        let mut ctx = ConsensusContext::new(make_set(4), Some(signing_key(index)));
        ctx.start_height(10, B256::repeat_byte(0x10), 1_000);
        ctx
    }

    fn tx(byte: u8) -> Transaction {
        Transaction {
            hash: B256::repeat_byte(byte),
            size: 10,
            system_fee: 1,
            conflicts: vec![],
        }
    }

    #[test]
    fn test_roles_at_height_10() {
        // Priority primary is (10 - 0) mod 4 = 2, fallback is 3.
        assert_eq!(make_context(2).role(), Role::PriorityPrimary);
        assert_eq!(make_context(3).role(), Role::FallbackPrimary);
        assert_eq!(make_context(0).role(), Role::Backup);

        let mut observer = ConsensusContext::new(make_set(4), None);
        observer.start_height(10, B256::ZERO, 0);
        assert_eq!(observer.role(), Role::WatchOnly);
    }

    #[test]
    fn test_make_prepare_request_requires_slot_ownership() {
        let mut ctx = make_context(0);
        let err = ctx
            .make_prepare_request(ProposalSlot::Priority, 2_000, 7, vec![])
            .unwrap_err();
        assert!(matches!(err, ConsensusError::NotSlotOwner { .. }));
    }

    #[test]
    fn test_prepare_request_installs_slot_state() {
        let mut ctx = make_context(2);
        let envelope = ctx
            .make_prepare_request(ProposalSlot::Priority, 2_000, 7, vec![tx(0xAA)])
            .expect("priority primary can propose");
        assert_eq!(envelope.kind(), PayloadKind::PrepareRequest);
        assert!(ctx.request_sent_or_received());
        let slot = ctx.slot(ProposalSlot::Priority);
        assert_eq!(slot.tx_hashes().len(), 1);
        assert!(slot.is_complete());
        assert_eq!(slot.request_hash(), Some(envelope.hash()));
    }

    #[test]
    fn test_response_requires_matching_request_hash() {
        let mut proposer = make_context(2);
        let request = proposer
            .make_prepare_request(ProposalSlot::Priority, 2_000, 7, vec![])
            .unwrap();
        let ConsensusPayload::PrepareRequest(parsed) = request.payload.clone() else {
            panic!("expected prepare request");
        };

        let mut backup = make_context(0);
        backup.store_prepare_request(request.clone(), &parsed);
        let response = backup.make_prepare_response(ProposalSlot::Priority).unwrap();

        // A third node that saw the same request accepts the response.
        let mut other = make_context(1);
        other.store_prepare_request(request, &parsed);
        let ConsensusPayload::PrepareResponse(parsed_response) = response.payload.clone() else {
            panic!("expected prepare response");
        };
        assert!(other.store_prepare_response(response.clone(), &parsed_response));

        // A response acknowledging a different hash is dropped.
        let bogus = PrepareResponse {
            slot: ProposalSlot::Priority,
            request_hash: B256::repeat_byte(0xFF),
        };
        assert!(!other.store_prepare_response(response, &bogus));
    }

    #[test]
    fn test_commits_survive_view_change() {
        let mut ctx = make_context(2);
        ctx.make_prepare_request(ProposalSlot::Priority, 2_000, 7, vec![])
            .unwrap();
        let commit = ctx.make_commit(ProposalSlot::Priority).unwrap();
        assert!(ctx.commit_sent());
        assert_eq!(ctx.count_committed(), 1);

        ctx.reset(1);
        assert_eq!(ctx.view(), 1);
        assert!(ctx.commit_sent(), "commit-sent must survive a view change");
        assert_eq!(ctx.count_committed(), 1);
        assert_eq!(
            ctx.my_commit().map(|r| r.envelope.clone()),
            Some(commit),
            "the recorded commit must be byte-identical after the change"
        );
        assert!(ctx.slot(ProposalSlot::Priority).prepare_request().is_none());
    }

    #[test]
    fn test_new_height_clears_commits() {
        let mut ctx = make_context(2);
        ctx.make_prepare_request(ProposalSlot::Priority, 2_000, 7, vec![])
            .unwrap();
        ctx.make_commit(ProposalSlot::Priority).unwrap();

        ctx.start_height(11, B256::repeat_byte(0x11), 3_000);
        assert_eq!(ctx.count_committed(), 0);
        assert!(!ctx.commit_sent());
        assert!(!ctx.block_sent());
    }

    #[test]
    fn test_make_commit_is_idempotent() {
        let mut ctx = make_context(2);
        ctx.make_prepare_request(ProposalSlot::Priority, 2_000, 7, vec![])
            .unwrap();
        let first = ctx.make_commit(ProposalSlot::Priority).unwrap();
        // A second call returns the stored payload, it never signs again,
        // even for the other slot.
        let second = ctx.make_commit(ProposalSlot::Fallback).unwrap();
        assert_eq!(first, second);
        assert_eq!(ctx.count_committed(), 1);
    }

    #[test]
    fn test_store_commit_first_wins() {
        let mut ctx = make_context(0);
        let mut proposer = make_context(2);
        proposer
            .make_prepare_request(ProposalSlot::Priority, 2_000, 7, vec![])
            .unwrap();
        let commit_env = proposer.make_commit(ProposalSlot::Priority).unwrap();
        let ConsensusPayload::Commit(commit) = commit_env.payload.clone() else {
            panic!("expected commit");
        };
        assert!(ctx.store_commit(commit_env.clone(), &commit));
        assert!(!ctx.store_commit(commit_env, &commit), "second store ignored");
    }

    #[test]
    fn test_change_view_keeps_highest_target() {
        let mut ctx = make_context(0);
        let mut peer = make_context(1);
        let cv1 = peer.make_change_view(ChangeViewReason::Timeout, 1).unwrap();
        let ConsensusPayload::ChangeView(parsed1) = cv1.payload.clone() else {
            panic!();
        };
        assert!(ctx.store_change_view(cv1.clone(), &parsed1));
        // Same target again: dropped.
        assert!(!ctx.store_change_view(cv1, &parsed1));
        assert_eq!(ctx.change_views()[&1].new_view, 1);
    }

    #[test]
    fn test_ensure_header_is_deterministic_across_nodes() {
        let mut proposer = make_context(2);
        let request = proposer
            .make_prepare_request(ProposalSlot::Priority, 2_000, 7, vec![tx(0xAB)])
            .unwrap();
        let ConsensusPayload::PrepareRequest(parsed) = request.payload.clone() else {
            panic!();
        };

        let mut backup = make_context(0);
        backup.store_prepare_request(request, &parsed);

        let h1 = proposer.ensure_header(ProposalSlot::Priority).unwrap();
        let h2 = backup.ensure_header(ProposalSlot::Priority).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.primary_index, 2);
        assert_eq!(h1.index, 10);
    }

    #[test]
    fn test_ensure_header_missing_request() {
        let mut ctx = make_context(0);
        assert!(ctx.ensure_header(ProposalSlot::Priority).is_none());
    }

    #[test]
    fn test_count_failed_tracks_silent_validators() {
        let mut ctx = make_context(0);
        assert_eq!(ctx.count_failed(), 0, "everyone starts deemed alive");

        // Nobody but us speaks during heights 10 and 11.
        ctx.start_height(11, B256::repeat_byte(0x11), 2_000);
        ctx.start_height(12, B256::repeat_byte(0x12), 3_000);
        assert_eq!(ctx.count_failed(), 3);

        ctx.record_seen(1);
        assert_eq!(ctx.count_failed(), 2);
    }

    #[test]
    fn test_not_accepting_payloads_gate() {
        let mut ctx = make_context(0);
        assert!(!ctx.not_accepting_payloads());
        ctx.make_change_view(ChangeViewReason::Timeout, 1).unwrap();
        assert!(ctx.not_accepting_payloads());
    }

    #[test]
    fn test_snapshot_roundtrip_restores_commit_state() {
        let mut ctx = make_context(2);
        ctx.make_prepare_request(ProposalSlot::Priority, 2_000, 7, vec![tx(0xAA)])
            .unwrap();
        let commit = ctx.make_commit(ProposalSlot::Priority).unwrap();

        let snapshot = ctx.snapshot();
        snapshot.validate().expect("snapshot should validate");
        let json = serde_json::to_string(&snapshot).expect("snapshot serializes");
        let parsed: ContextSnapshot = serde_json::from_str(&json).expect("snapshot parses");

        let mut restored = ConsensusContext::new(make_set(4), Some(signing_key(2)));
        restored.restore(parsed);
        assert_eq!(restored.height(), 10);
        assert_eq!(restored.view(), 0);
        assert!(restored.commit_sent());
        assert_eq!(
            restored.my_commit().map(|r| r.envelope.clone()),
            Some(commit),
            "restored commit must be the original signed payload"
        );
        assert!(restored.slot(ProposalSlot::Priority).is_complete());
    }

    #[test]
    fn test_snapshot_validate_rejects_foreign_height() {
        let mut ctx = make_context(2);
        ctx.make_prepare_request(ProposalSlot::Priority, 2_000, 7, vec![])
            .unwrap();
        ctx.make_commit(ProposalSlot::Priority).unwrap();
        let mut snapshot = ctx.snapshot();
        snapshot.height = 99;
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn test_recovery_message_is_deterministic() {
        let mut ctx = make_context(2);
        ctx.make_prepare_request(ProposalSlot::Priority, 2_000, 7, vec![])
            .unwrap();
        ctx.make_commit(ProposalSlot::Priority).unwrap();

        let a = ctx.make_recovery_message().unwrap();
        let b = ctx.make_recovery_message().unwrap();
        assert_eq!(a.payload, b.payload, "bundle content must be stable");
    }
}
