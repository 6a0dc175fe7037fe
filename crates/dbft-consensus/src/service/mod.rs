//! The consensus service: an event-driven state machine consuming payloads,
//! transactions, timer ticks and persist notifications, and emitting
//! outbound payloads plus, on success, a fully formed block.
//!
//! The service is single-threaded cooperative: every handler runs to
//! completion before the next event is dequeued, which is what re-establishes
//! the round invariants at each handler boundary. It does not run its own
//! loop — see `external::run_service`.

mod commit;
mod proposal;
mod recovery;
mod view_change;

use crate::config::DbftConfig;
use crate::context::ConsensusContext;
use crate::error::{ConsensusError, ConsensusResult};
use crate::external::{
    Clock, ConsensusInput, MempoolAccess, ServiceOutput, TransactionVerifier, Verdict,
};
use crate::recovery::RecoveryLog;
use crate::timer::Timer;
use crate::validator::{Role, ValidatorSet};
use alloy_primitives::B256;
use dbft_primitives::{
    Block, ChangeViewReason, ConsensusPayload, Envelope, Height, PayloadKind, ProposalSlot,
    Transaction, View,
};
use ed25519_dalek::SigningKey;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct ConsensusService {
    config: DbftConfig,
    context: ConsensusContext,
    timer: Timer,
    recovery_log: RecoveryLog,
    mempool: Arc<dyn MempoolAccess>,
    verifier: Arc<dyn TransactionVerifier>,
    clock: Arc<dyn Clock>,
    outputs: mpsc::UnboundedSender<ServiceOutput>,
    /// Transaction hashes referenced by a stored request but not yet
    /// resolved; drives the timeout reason and transport fetches.
    missing_transactions: HashSet<B256>,
    /// Wall-clock instant of the last persisted block, for proposal-timer
    /// elapsed-time subtraction.
    block_received_at: u64,
    is_recovering: bool,
    halted: bool,
}

impl ConsensusService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DbftConfig,
        validators: ValidatorSet,
        signing_key: Option<SigningKey>,
        recovery_log: RecoveryLog,
        mempool: Arc<dyn MempoolAccess>,
        verifier: Arc<dyn TransactionVerifier>,
        clock: Arc<dyn Clock>,
        outputs: mpsc::UnboundedSender<ServiceOutput>,
    ) -> Self {
        Self {
            config,
            context: ConsensusContext::new(validators, signing_key),
            timer: Timer::new(),
            recovery_log,
            mempool,
            verifier,
            clock,
            outputs,
            missing_transactions: HashSet::new(),
            block_received_at: 0,
            is_recovering: false,
            halted: false,
        }
    }

    pub fn context(&self) -> &ConsensusContext {
        &self.context
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    pub fn timer_mut(&mut self) -> &mut Timer {
        &mut self.timer
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Processes one event. Errors describe dropped input (a Byzantine or
    /// stale payload), not a broken service — except [`ConsensusError::Halted`].
    pub fn handle(&mut self, input: ConsensusInput) -> ConsensusResult<()> {
        if self.halted {
            return Err(ConsensusError::Halted {
                reason: "service previously halted".into(),
            });
        }
        match input {
            ConsensusInput::Start {
                height,
                prev_hash,
                prev_timestamp,
            } => self.on_start(height, prev_hash, prev_timestamp),
            ConsensusInput::Tick { height, view } => self.on_tick(height, view),
            ConsensusInput::Payload(envelope) => self.on_payload(envelope),
            ConsensusInput::Transaction(tx) => self.on_transaction(tx),
            ConsensusInput::PersistCompleted { block } => self.on_persist_completed(block),
            ConsensusInput::RelayResult { payload, verdict } => {
                self.on_relay_result(payload, verdict)
            }
        }
    }

    /// Cancels the timer and flushes the recovery log.
    pub fn shutdown(&mut self) {
        self.timer.disarm();
        if !self.halted && self.context.height() > 0 {
            if let Err(err) = self.recovery_log.save(&self.context.snapshot()) {
                tracing::warn!(%err, "failed to flush recovery log on shutdown");
            }
        }
    }

    // ── Start / height transitions ──

    fn on_start(&mut self, height: Height, prev_hash: B256, prev_timestamp: u64) -> ConsensusResult<()> {
        self.block_received_at = self.clock.now_ms();
        self.context.start_height(height, prev_hash, prev_timestamp);

        let snapshot = match self.recovery_log.load() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(%err, "failed to load consensus recovery log");
                None
            }
        };

        match snapshot {
            Some(snapshot) if snapshot.height == height => {
                tracing::info!(height, view = snapshot.view, "restoring round state from recovery log");
                self.context.restore(snapshot);
                if self.context.commit_sent() {
                    // Re-enter the commit-sent state: the original commit is
                    // retransmitted via recovery, never signed again.
                    self.is_recovering = true;
                    let bundle = self.context.make_recovery_message()?;
                    self.emit(ServiceOutput::Broadcast(bundle));
                    for slot in ProposalSlot::ALL {
                        self.check_preparations(slot)?;
                    }
                    let view = self.context.view();
                    let delay = self.base_block_time_ms().saturating_mul(2);
                    self.timer.schedule(Duration::from_millis(delay), height, view);
                    self.is_recovering = false;
                    return Ok(());
                }
                let view = self.context.view();
                self.initialize_consensus(view);
            }
            Some(snapshot) => {
                tracing::warn!(
                    snapshot_height = snapshot.height,
                    height,
                    "recovery log does not match the current height; ignoring it"
                );
                self.initialize_consensus(0);
            }
            None => self.initialize_consensus(0),
        }

        if !self.context.is_watch_only() {
            let envelope = self.context.make_recovery_request(self.now())?;
            self.emit(ServiceOutput::Broadcast(envelope));
        }
        Ok(())
    }

    fn on_persist_completed(&mut self, block: Block) -> ConsensusResult<()> {
        tracing::info!(index = block.index(), hash = %block.hash(), "block persisted; advancing height");
        self.block_received_at = self.clock.now_ms();
        self.is_recovering = false;
        self.missing_transactions.clear();
        let timestamp = block.header.timestamp;
        self.context
            .start_height(block.index() + 1, block.hash(), timestamp);
        self.initialize_consensus(0);
        Ok(())
    }

    /// Resets the round context for `(height, new_view)` and arms the timer
    /// according to the local role.
    ///
    /// The dual-primary ladder: at view 0 both primaries arm one block
    /// time (the fallback only proposes if its tick finds no request in
    /// flight); from view 1 on, the fallback waits the configured multiple
    /// of the scaled delay, and backups escalate to a view change at
    /// `block_time << (view + 1)`.
    pub(crate) fn initialize_consensus(&mut self, new_view: View) {
        self.context.reset(new_view);
        self.missing_transactions.clear();

        let height = self.context.height();
        let role = self.context.role();
        tracing::info!(height, view = new_view, ?role, "initialized consensus round");

        let base = self.base_block_time_ms();
        let full_delay = match role {
            Role::WatchOnly => {
                self.timer.disarm();
                return;
            }
            Role::PriorityPrimary | Role::FallbackPrimary => {
                if new_view == 0 {
                    base
                } else {
                    let multiplier = if role == Role::FallbackPrimary {
                        self.config.fallback_timer_multiplier as u64
                    } else {
                        1
                    };
                    scaled_delay_ms(base.saturating_mul(multiplier), new_view)
                }
            }
            Role::Backup => scaled_delay_ms(base, new_view),
        };

        // Resuming mid-height after a view change during recovery keeps the
        // full scaled delay; otherwise the time already spent since the last
        // persisted block is subtracted.
        let delay = if self.is_recovering && new_view > 0 {
            full_delay
        } else {
            let elapsed = self.now().saturating_sub(self.block_received_at);
            full_delay.saturating_sub(elapsed)
        };
        self.timer
            .schedule(Duration::from_millis(delay), height, new_view);
    }

    // ── Tick ──

    fn on_tick(&mut self, height: Height, view: View) -> ConsensusResult<()> {
        if self.context.is_watch_only() || self.context.block_sent() {
            return Ok(());
        }
        if height != self.context.height() || view != self.context.view() {
            tracing::debug!(height, view, "stale tick dropped");
            return Ok(());
        }

        if let Some(slot) = self.context.my_slot() {
            if !self.context.request_sent_or_received() {
                return self.send_prepare_request(slot);
            }
        }

        if self.context.commit_sent() {
            // Committed: prod peers with our proofs instead of churning views.
            let bundle = self.context.make_recovery_message()?;
            self.emit(ServiceOutput::Broadcast(bundle));
            let delay = self.base_block_time_ms().saturating_mul(2);
            self.timer.schedule(Duration::from_millis(delay), height, view);
            return Ok(());
        }

        let reason = if self.missing_transactions.is_empty() {
            ChangeViewReason::Timeout
        } else {
            ChangeViewReason::TxNotFound
        };
        self.request_change_view(reason)
    }

    // ── Inbound payloads ──

    fn on_payload(&mut self, envelope: Envelope) -> ConsensusResult<()> {
        if self.context.block_sent() && envelope.kind() != PayloadKind::RecoveryRequest {
            return Ok(());
        }
        if envelope.height != self.context.height() {
            return Err(ConsensusError::HeightMismatch {
                current: self.context.height(),
                received: envelope.height,
            });
        }
        let origin = envelope.validator_index;
        if !self.context.validators().contains(origin) {
            return Err(ConsensusError::UnknownValidator {
                index: origin,
                set_size: self.context.validators().len(),
            });
        }
        if Some(origin) == self.context.my_index() {
            return Ok(());
        }
        if !self.context.note_known(envelope.hash()) {
            // Replay: the first delivery already advanced the state.
            return Ok(());
        }
        self.context.record_seen(origin);

        tracing::debug!(
            origin,
            kind = ?envelope.kind(),
            view = envelope.view,
            "consensus payload received"
        );

        match envelope.payload.clone() {
            ConsensusPayload::PrepareRequest(request) => self.on_prepare_request(envelope, request),
            ConsensusPayload::PrepareResponse(response) => {
                self.on_prepare_response(envelope, response)
            }
            ConsensusPayload::ChangeView(change_view) => self.on_change_view(envelope, change_view),
            ConsensusPayload::Commit(commit_payload) => self.on_commit(envelope, commit_payload),
            ConsensusPayload::RecoveryRequest(request) => {
                self.on_recovery_request(envelope, request)
            }
            ConsensusPayload::RecoveryMessage(bundle) => self.on_recovery_message(envelope, bundle),
        }
    }

    fn on_relay_result(&mut self, payload: Envelope, verdict: Verdict) -> ConsensusResult<()> {
        match verdict {
            Verdict::Valid => self.on_payload(payload),
            Verdict::PolicyFail | Verdict::Invalid => {
                tracing::debug!(kind = ?payload.kind(), ?verdict, "relayed payload failed verification");
                Ok(())
            }
        }
    }

    fn on_transaction(&mut self, tx: Transaction) -> ConsensusResult<()> {
        if self.context.block_sent() {
            return Ok(());
        }
        let referenced = ProposalSlot::ALL.iter().any(|slot| {
            let state = self.context.slot(*slot);
            state.tx_hashes().contains(&tx.hash) && !state.transactions().contains_key(&tx.hash)
        });
        if !referenced {
            return Ok(());
        }
        self.add_transaction(tx, true)?;
        Ok(())
    }

    // ── Shared helpers ──

    pub(crate) fn emit(&self, output: ServiceOutput) {
        if self.outputs.send(output).is_err() {
            tracing::error!("consensus output channel closed");
        }
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Base timer unit; doubled while a recovery replay is in flight to
    /// avoid racing the replayed payloads.
    pub(crate) fn base_block_time_ms(&self) -> u64 {
        let base = self.config.milliseconds_per_block;
        if self.is_recovering {
            base.saturating_mul(2)
        } else {
            base
        }
    }

    /// Persists the round state; on failure the service halts and the caller
    /// must not transmit the message whose transition went unlogged.
    pub(crate) fn persist_or_halt(&mut self) -> bool {
        match self.recovery_log.save(&self.context.snapshot()) {
            Ok(()) => true,
            Err(err) => {
                self.halt(format!("recovery log write failed: {err}"));
                false
            }
        }
    }

    pub(crate) fn halt(&mut self, reason: String) {
        tracing::error!(%reason, "consensus service halted");
        self.halted = true;
        self.timer.disarm();
        let _ = self.outputs.send(ServiceOutput::Halted { reason });
    }
}

impl std::fmt::Debug for ConsensusService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusService")
            .field("context", &self.context)
            .field("halted", &self.halted)
            .field("is_recovering", &self.is_recovering)
            .finish()
    }
}

/// `base << (view + 1)` with saturation, the escalation curve shared by the
/// proposal and view-change timers.
fn scaled_delay_ms(base: u64, view: View) -> u64 {
    let multiplier = 1u64.checked_shl(view as u32 + 1).unwrap_or(u64::MAX);
    base.saturating_mul(multiplier)
}
