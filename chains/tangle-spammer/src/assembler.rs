//! Pairs a prepared bundle with a tip pair and applies the reference filters.

use smallvec::SmallVec;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{ReferenceSide, SpamError};
use crate::metrics::{MetricKind, MetricsHandle};
use crate::types::{pad_tag, Bundle, Tips, Transaction};

/// Which references to refuse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceFilters {
    /// Refuse a trunk carrying our own tag.
    pub trunk: bool,
    /// Refuse a branch carrying our own tag.
    pub branch: bool,
    /// Refuse milestones on either side.
    pub milestone: bool,
}

/// What a tip pair looks like from our side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Classification {
    pub trunk_ours: bool,
    pub branch_ours: bool,
    pub trunk_milestone: bool,
    pub branch_milestone: bool,
}

impl Classification {
    /// Metric events for this pair. A pair that is ours on both sides is
    /// one `BadTrunkAndBranch`, never two single-side events.
    pub fn events(&self) -> SmallVec<[MetricKind; 3]> {
        let mut events = SmallVec::new();
        if self.trunk_milestone {
            events.push(MetricKind::MilestoneTrunk);
        }
        if self.branch_milestone {
            events.push(MetricKind::MilestoneBranch);
        }
        match (self.trunk_ours, self.branch_ours) {
            (true, true) => events.push(MetricKind::BadTrunkAndBranch),
            (true, false) => events.push(MetricKind::BadTrunk),
            (false, true) => events.push(MetricKind::BadBranch),
            (false, false) => {}
        }
        events
    }

    pub fn verdict(&self, filters: ReferenceFilters) -> Result<(), SpamError> {
        if filters.milestone {
            let side = match (self.trunk_milestone, self.branch_milestone) {
                (true, true) => Some(ReferenceSide::Both),
                (true, false) => Some(ReferenceSide::Trunk),
                (false, true) => Some(ReferenceSide::Branch),
                (false, false) => None,
            };
            if let Some(side) = side {
                return Err(SpamError::MilestoneReference { side });
            }
        }

        let side = match (self.trunk_ours, self.branch_ours) {
            (true, true) if filters.trunk || filters.branch => Some(ReferenceSide::Both),
            (true, false) if filters.trunk => Some(ReferenceSide::Trunk),
            (false, true) if filters.branch => Some(ReferenceSide::Branch),
            _ => None,
        };
        match side {
            Some(side) => Err(SpamError::SelfReference { side }),
            None => Ok(()),
        }
    }
}

pub struct Assembler {
    padded_tag: String,
    milestone_address: String,
    filters: ReferenceFilters,
}

impl Assembler {
    pub fn new(tag: &str, milestone_address: &str, filters: ReferenceFilters) -> Self {
        Self {
            padded_tag: pad_tag(tag),
            milestone_address: milestone_address.to_string(),
            filters,
        }
    }

    pub fn classify(&self, tips: &Tips) -> Classification {
        Classification {
            trunk_ours: tips.trunk.tag == self.padded_tag,
            branch_ours: tips.branch.tag == self.padded_tag,
            trunk_milestone: tips.trunk.is_milestone(&self.milestone_address),
            branch_milestone: tips.branch.is_milestone(&self.milestone_address),
        }
    }

    /// Classify `tips`, record the outcome, then apply the filters.
    pub async fn check(
        &self,
        bundle: Bundle,
        tips: Tips,
        metrics: &MetricsHandle,
    ) -> Result<Transaction, SpamError> {
        let classification = self.classify(&tips);
        for event in classification.events() {
            metrics.record(event).await;
        }
        classification.verdict(self.filters)?;

        Ok(Transaction {
            trunk: tips.trunk_hash,
            branch: tips.branch_hash,
            bundle,
        })
    }

    /// Wait for the next tip pair and assemble `bundle` onto it.
    ///
    /// `Ok(None)` means the run is over: cancellation fired or every tip
    /// worker is gone.
    pub async fn assemble(
        &self,
        bundle: Bundle,
        tips_rx: &mut mpsc::Receiver<Tips>,
        metrics: &MetricsHandle,
        cancel: &CancellationToken,
    ) -> Result<Option<Transaction>, SpamError> {
        let tips = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            tips = tips_rx.recv() => match tips {
                Some(tips) => tips,
                None => return Ok(None),
            },
        };
        self.check(bundle, tips, metrics).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRouter;
    use crate::testing::{body_with_tag, hash_of};
    use crate::types::MILESTONE_ADDRESS;

    const TAG: &str = "999SPAMALOT";

    fn tips(trunk_tag: &str, branch_tag: &str) -> Tips {
        Tips {
            trunk_hash: hash_of(1),
            branch_hash: hash_of(2),
            trunk: body_with_tag(trunk_tag),
            branch: body_with_tag(branch_tag),
        }
    }

    fn milestone(mut tips: Tips, trunk: bool, branch: bool) -> Tips {
        if trunk {
            tips.trunk.address = MILESTONE_ADDRESS.to_string();
        }
        if branch {
            tips.branch.address = MILESTONE_ADDRESS.to_string();
        }
        tips
    }

    fn assembler(filters: ReferenceFilters) -> Assembler {
        Assembler::new(TAG, MILESTONE_ADDRESS, filters)
    }

    #[test]
    fn test_both_sides_ours_is_one_classification() {
        let c = assembler(ReferenceFilters::default()).classify(&tips(TAG, TAG));
        assert!(c.trunk_ours && c.branch_ours);
        assert_eq!(c.events().as_slice(), &[MetricKind::BadTrunkAndBranch]);

        let c = assembler(ReferenceFilters::default()).classify(&tips(TAG, "OTHER"));
        assert_eq!(c.events().as_slice(), &[MetricKind::BadTrunk]);
    }

    #[test]
    fn test_milestones_checked_per_side() {
        let a = assembler(ReferenceFilters::default());
        let c = a.classify(&milestone(tips("X", "Y"), true, true));
        assert_eq!(
            c.events().as_slice(),
            &[MetricKind::MilestoneTrunk, MetricKind::MilestoneBranch]
        );
    }

    #[test]
    fn test_one_side_ours_with_both_filters_is_not_both() {
        let filters = ReferenceFilters {
            trunk: true,
            branch: true,
            milestone: false,
        };
        let c = assembler(filters).classify(&tips("OTHER", TAG));
        assert!(matches!(
            c.verdict(filters),
            Err(SpamError::SelfReference {
                side: ReferenceSide::Branch
            })
        ));
        assert_eq!(c.events().as_slice(), &[MetricKind::BadBranch]);
    }

    #[test]
    fn test_filters_are_independent() {
        let trunk_only = ReferenceFilters {
            trunk: true,
            ..Default::default()
        };
        let c = assembler(trunk_only).classify(&tips("OTHER", TAG));
        assert!(c.verdict(trunk_only).is_ok());

        let c = assembler(trunk_only).classify(&tips(TAG, TAG));
        assert!(matches!(
            c.verdict(trunk_only),
            Err(SpamError::SelfReference {
                side: ReferenceSide::Both
            })
        ));

        let c = assembler(ReferenceFilters::default()).classify(&milestone(tips(TAG, TAG), true, false));
        assert!(c.verdict(ReferenceFilters::default()).is_ok());
    }

    #[tokio::test]
    async fn test_milestone_rejection_counts_once() {
        let filters = ReferenceFilters {
            milestone: true,
            ..Default::default()
        };
        let a = assembler(filters);
        let (router, handle) = MetricsRouter::start(None);

        let err = a
            .check(Vec::new(), milestone(tips("X", "Y"), false, true), &handle)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SpamError::MilestoneReference {
                side: ReferenceSide::Branch
            }
        ));
        assert!(err.is_rejection());

        let totals = router.stop().await;
        assert_eq!(totals.milestone_branch, 1);
        assert_eq!(totals.milestone_trunk, 0);
    }

    #[tokio::test]
    async fn test_events_recorded_even_when_accepted() {
        let a = assembler(ReferenceFilters::default());
        let (router, handle) = MetricsRouter::start(None);

        let tx = a
            .check(vec![body_with_tag(TAG)], tips(TAG, TAG), &handle)
            .await
            .unwrap();
        assert_eq!(tx.trunk, hash_of(1));
        assert_eq!(tx.branch, hash_of(2));
        assert_eq!(tx.bundle.len(), 1);

        let totals = router.stop().await;
        assert_eq!(totals.bad_trunk_and_branch, 1);
        assert_eq!(totals.bad_trunk, 0);
        assert_eq!(totals.bad_branch, 0);
    }

    #[tokio::test]
    async fn test_assemble_returns_none_on_cancel() {
        let a = assembler(ReferenceFilters::default());
        let (_router, handle) = MetricsRouter::start(None);
        let (_tips_tx, mut tips_rx) = mpsc::channel::<Tips>(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let out = a.assemble(Vec::new(), &mut tips_rx, &handle, &cancel).await;
        assert!(matches!(out, Ok(None)));
    }

    #[tokio::test]
    async fn test_assemble_takes_next_tips() {
        let a = assembler(ReferenceFilters::default());
        let (_router, handle) = MetricsRouter::start(None);
        let (tips_tx, mut tips_rx) = mpsc::channel(1);
        tips_tx.send(tips("A", "B")).await.unwrap();

        let tx = a
            .assemble(Vec::new(), &mut tips_rx, &handle, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.trunk, hash_of(1));

        drop(tips_tx);
        let out = a
            .assemble(Vec::new(), &mut tips_rx, &handle, &CancellationToken::new())
            .await;
        assert!(matches!(out, Ok(None)));
    }
}
