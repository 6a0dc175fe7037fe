//! Events and collaborator seams between the consensus service and the rest
//! of the node.
//!
//! External components (transport, mempool, ledger) run on their own tasks
//! and talk to consensus only by posting [`ConsensusInput`] events on the
//! service queue; the service answers with [`ServiceOutput`] effects. The
//! few synchronous queries (mempool lookups, transaction verification, the
//! clock) go through the traits below.

use crate::service::ConsensusService;
use alloy_primitives::B256;
use dbft_primitives::{Block, Envelope, Height, Transaction, VerificationContext, ValidatorIndex, View};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Events fed into the consensus service, serialized through one queue.
#[derive(Debug, Clone)]
pub enum ConsensusInput {
    /// Begin consensus on top of the given chain tip.
    Start {
        height: Height,
        prev_hash: B256,
        prev_timestamp: u64,
    },
    /// The round timer fired. Stale stamps are dropped by the service.
    Tick { height: Height, view: View },
    /// A consensus payload from the transport, envelope signature already
    /// verified against the origin validator.
    Payload(Envelope),
    /// A transaction surfaced by the mempool after a prepare request
    /// referenced it.
    Transaction(Transaction),
    /// The ledger finished persisting a block; move to the next height.
    PersistCompleted { block: Block },
    /// Late verification outcome for a relayed payload.
    RelayResult { payload: Envelope, verdict: Verdict },
}

/// Effects the service asks the outer node to perform.
#[derive(Debug, Clone)]
pub enum ServiceOutput {
    /// Broadcast a payload to all peers.
    Broadcast(Envelope),
    /// Send a payload to one validator.
    SendDirect {
        peer: ValidatorIndex,
        payload: Envelope,
    },
    /// Hand a fully signed block to the ledger.
    SubmitBlock(Block),
    /// Ask the transport to fetch the listed transactions.
    RequestTransactions(Vec<B256>),
    /// The service hit an irrecoverable fault and will emit nothing further.
    Halted { reason: String },
}

/// Outcome of verifying a transaction or a relayed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    /// Rejected by a configurable policy rather than by validity rules.
    PolicyFail,
    Invalid,
}

/// Read-only mempool queries the service performs while building and
/// resolving proposals.
pub trait MempoolAccess: Send + Sync {
    /// Verified transactions under the pool's fixed ordering
    /// (fee-descending, then hash-ascending), at most `limit` of them.
    fn ordered_transactions(&self, limit: usize) -> Vec<Transaction>;

    fn lookup(&self, hash: &B256) -> Option<Transaction>;
}

/// Ledger-backed transaction verification against a slot's running batch
/// state.
pub trait TransactionVerifier: Send + Sync {
    fn verify(&self, tx: &Transaction, slot: &VerificationContext) -> Verdict;
}

/// Wall-clock source, overridable for deterministic tests.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// The production clock.
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Drives the service: one task owning the input queue and the round timer.
///
/// All handlers run to completion before the next event is dequeued; the
/// timer never preempts, it just becomes one more event. The loop ends when
/// every input sender is dropped or the service halts.
pub async fn run_service(
    mut service: ConsensusService,
    mut inputs: mpsc::UnboundedReceiver<ConsensusInput>,
) {
    loop {
        let (armed, deadline, (height, view)) = {
            let timer = service.timer();
            (timer.is_armed(), timer.deadline(), timer.stamp())
        };

        let input = tokio::select! {
            maybe = inputs.recv() => match maybe {
                Some(input) => input,
                None => break,
            },
            _ = tokio::time::sleep_until(deadline), if armed => {
                service.timer_mut().disarm();
                ConsensusInput::Tick { height, view }
            }
        };

        if let Err(err) = service.handle(input) {
            tracing::debug!(%err, "consensus input rejected");
        }
        if service.is_halted() {
            break;
        }
    }

    service.shutdown();
}
