use super::ConsensusService;
use crate::error::ConsensusResult;
use crate::external::ServiceOutput;
use dbft_primitives::{Envelope, RecoveryMessage, RecoveryRequest};

impl ConsensusService {
    /// Answers a lagging peer with everything this node has observed.
    pub(crate) fn on_recovery_request(
        &mut self,
        envelope: Envelope,
        _request: RecoveryRequest,
    ) -> ConsensusResult<()> {
        if self.context.is_watch_only() {
            return Ok(());
        }
        let bundle = self.context.make_recovery_message()?;
        tracing::debug!(
            peer = envelope.validator_index,
            height = self.context.height(),
            "answering recovery request"
        );
        self.emit(ServiceOutput::SendDirect {
            peer: envelope.validator_index,
            payload: bundle,
        });
        Ok(())
    }

    /// Replays a recovery bundle through the standard handlers.
    ///
    /// There is one code path and one set of invariants: each constituent is
    /// signature-checked locally (the bundler is untrusted) and then fed to
    /// the same dispatch as a freshly received payload, where the known-hash
    /// set deduplicates anything already seen. `is_recovering` only widens
    /// the timers armed while the replay runs.
    pub(crate) fn on_recovery_message(
        &mut self,
        envelope: Envelope,
        bundle: RecoveryMessage,
    ) -> ConsensusResult<()> {
        if self.context.block_sent() {
            return Ok(());
        }
        tracing::info!(
            origin = envelope.validator_index,
            height = self.context.height(),
            change_views = bundle.change_views.len(),
            requests = bundle.prepare_requests.len(),
            responses = bundle.prepare_responses.len(),
            commits = bundle.commits.len(),
            "replaying recovery bundle"
        );

        self.is_recovering = true;
        let constituents = bundle
            .change_views
            .into_iter()
            .chain(bundle.prepare_requests)
            .chain(bundle.prepare_responses)
            .chain(bundle.commits);
        for constituent in constituents {
            let key = match self
                .context
                .validators()
                .public_key(constituent.validator_index)
            {
                Ok(key) => *key,
                Err(_) => continue,
            };
            if constituent.verify(&key).is_err() {
                tracing::warn!(
                    origin = constituent.validator_index,
                    kind = ?constituent.kind(),
                    "recovery constituent failed signature verification"
                );
                continue;
            }
            if let Err(err) = self.on_payload(constituent) {
                tracing::debug!(%err, "recovery constituent rejected");
            }
        }
        self.is_recovering = false;
        Ok(())
    }
}
