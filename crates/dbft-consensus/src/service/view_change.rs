use super::ConsensusService;
use crate::error::ConsensusResult;
use crate::external::ServiceOutput;
use dbft_primitives::{ChangeView, ChangeViewReason, Envelope, View};
use std::time::Duration;

impl ConsensusService {
    /// Records a change-view statement and checks whether its target view
    /// now has quorum agreement.
    pub(crate) fn on_change_view(
        &mut self,
        envelope: Envelope,
        change_view: ChangeView,
    ) -> ConsensusResult<()> {
        if change_view.new_view <= self.context.view() {
            tracing::debug!(
                origin = envelope.validator_index,
                new_view = change_view.new_view,
                "stale change view dropped"
            );
            return Ok(());
        }
        let origin = envelope.validator_index;
        if !self.context.store_change_view(envelope, &change_view) {
            return Ok(());
        }
        tracing::info!(
            height = self.context.height(),
            view = self.context.view(),
            origin,
            reason = ?change_view.reason,
            new_view = change_view.new_view,
            "change view received"
        );
        self.check_expected_view(change_view.new_view)
    }

    /// Transitions to `candidate` once `m` validators (ourselves included)
    /// target it or a higher view. Commits recorded so far survive the
    /// transition.
    pub(crate) fn check_expected_view(&mut self, candidate: View) -> ConsensusResult<()> {
        if candidate <= self.context.view() {
            return Ok(());
        }
        if self.context.commit_sent() {
            // A committed node is locked on its header: it lets the view
            // change pass it by and serves its commit via recovery instead.
            tracing::debug!(candidate, "ignoring view change after commit");
            return Ok(());
        }
        let agreeing = self
            .context
            .change_views()
            .values()
            .filter(|record| record.new_view >= candidate)
            .count();
        if agreeing < self.context.validators().quorum() {
            return Ok(());
        }
        tracing::info!(
            height = self.context.height(),
            old_view = self.context.view(),
            new_view = candidate,
            agreeing,
            "change-view quorum reached"
        );
        self.initialize_consensus(candidate);
        Ok(())
    }

    /// Escalates out of a stuck round.
    ///
    /// When more than `f` validators have already committed or gone silent,
    /// a view change can no longer assemble a quorum: the node asks peers
    /// for recovery instead of churning views.
    pub(crate) fn request_change_view(&mut self, reason: ChangeViewReason) -> ConsensusResult<()> {
        if self.context.is_watch_only() || self.context.block_sent() || self.context.commit_sent()
        {
            return Ok(());
        }
        let height = self.context.height();
        let view = self.context.view();
        let expected: View = view.saturating_add(1);

        let delay = super::scaled_delay_ms(self.base_block_time_ms(), expected);
        self.timer
            .schedule(Duration::from_millis(delay), height, view);

        if self.context.more_than_f_committed_or_failed() {
            tracing::warn!(
                height,
                view,
                committed = self.context.count_committed(),
                failed = self.context.count_failed(),
                "quorum irrecoverable by view change; requesting recovery"
            );
            let envelope = self.context.make_recovery_request(self.now())?;
            self.emit(ServiceOutput::Broadcast(envelope));
            return Ok(());
        }

        let envelope = self.context.make_change_view(reason, self.now())?;
        tracing::info!(height, view, ?reason, target = expected, "requesting view change");
        self.emit(ServiceOutput::Broadcast(envelope));
        self.check_expected_view(expected)
    }
}
