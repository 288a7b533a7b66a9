//! Comparing two ordered snapshot histories.
//!
//! Every replication decision starts here: given what the sending side has
//! (`source`) and what the receiving side has (`candidate`), decide whether
//! the candidate can be brought up to date by an incremental stream.

use snapmesh_zfs::Snapshot;

/// Outcome of comparing a source history with a candidate history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reconciliation {
    /// Source has no snapshots, so there is nothing to send.
    NoFromSnaps,
    /// Candidate already has exactly the source's snapshots.
    UpToDate,
    /// Candidate has everything the source has, and more.
    Ahead,
    /// The histories share no snapshot.
    NoCommonSnapshots,
    /// Both sides have snapshots after the last common one.
    Diverged {
        /// Last snapshot both sides agree on.
        latest_common: Snapshot,
    },
    /// Candidate is a prefix of the source; send `from..=to`.
    FastForward {
        /// Last snapshot the candidate has, `None` for a full send.
        from: Option<Snapshot>,
        /// Latest source snapshot.
        to: Snapshot,
    },
}

impl Reconciliation {
    /// Whether the candidate can receive an incremental stream.
    pub fn is_fast_forward(&self) -> bool {
        matches!(self, Reconciliation::FastForward { .. })
    }

    /// Short name for logs and status messages.
    pub fn name(&self) -> &'static str {
        match self {
            Reconciliation::NoFromSnaps => "no-from-snaps",
            Reconciliation::UpToDate => "up-to-date",
            Reconciliation::Ahead => "ahead",
            Reconciliation::NoCommonSnapshots => "no-common-snapshots",
            Reconciliation::Diverged { .. } => "diverged",
            Reconciliation::FastForward { .. } => "fast-forward",
        }
    }
}

/// Classifies `candidate` against `source`. Snapshots are compared by id.
pub fn can_apply(source: &[Snapshot], candidate: &[Snapshot]) -> Reconciliation {
    let Some(latest) = source.last() else {
        return Reconciliation::NoFromSnaps;
    };
    let common = source
        .iter()
        .zip(candidate)
        .take_while(|(a, b)| a.id == b.id)
        .count();

    if common == source.len() {
        return if common == candidate.len() {
            Reconciliation::UpToDate
        } else {
            Reconciliation::Ahead
        };
    }
    if common == candidate.len() {
        return Reconciliation::FastForward {
            from: candidate.last().cloned(),
            to: latest.clone(),
        };
    }
    if common == 0 {
        return Reconciliation::NoCommonSnapshots;
    }
    Reconciliation::Diverged {
        latest_common: source[common - 1].clone(),
    }
}

/// Snapshots up to and including `to`; an empty `to` means all of them.
/// Returns `None` when `to` is not in the list.
pub fn restrict_snapshots<'a>(snapshots: &'a [Snapshot], to: &str) -> Option<&'a [Snapshot]> {
    if to.is_empty() {
        return Some(snapshots);
    }
    let index = snapshots.iter().position(|s| s.id == to)?;
    Some(&snapshots[..=index])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snaps(ids: &[&str]) -> Vec<Snapshot> {
        ids.iter().map(|id| Snapshot::new(*id)).collect()
    }

    #[test]
    fn test_full_send_into_empty_candidate() {
        assert_eq!(
            can_apply(&snaps(&["s1"]), &[]),
            Reconciliation::FastForward {
                from: None,
                to: Snapshot::new("s1"),
            }
        );
    }

    #[test]
    fn test_incremental_fast_forward() {
        assert_eq!(
            can_apply(&snaps(&["s1", "s2"]), &snaps(&["s1"])),
            Reconciliation::FastForward {
                from: Some(Snapshot::new("s1")),
                to: Snapshot::new("s2"),
            }
        );
    }

    #[test]
    fn test_candidate_ahead() {
        assert_eq!(
            can_apply(&snaps(&["s1"]), &snaps(&["s1", "s2"])),
            Reconciliation::Ahead
        );
    }

    #[test]
    fn test_diverged_reports_latest_common() {
        assert_eq!(
            can_apply(&snaps(&["s1", "s2a"]), &snaps(&["s1", "s2b"])),
            Reconciliation::Diverged {
                latest_common: Snapshot::new("s1"),
            }
        );
    }

    #[test]
    fn test_remaining_outcomes() {
        assert_eq!(can_apply(&[], &snaps(&["s1"])), Reconciliation::NoFromSnaps);
        assert_eq!(can_apply(&[], &[]), Reconciliation::NoFromSnaps);
        assert_eq!(
            can_apply(&snaps(&["s1", "s2"]), &snaps(&["s1", "s2"])),
            Reconciliation::UpToDate
        );
        assert_eq!(
            can_apply(&snaps(&["a"]), &snaps(&["b"])),
            Reconciliation::NoCommonSnapshots
        );
    }

    #[test]
    fn test_metadata_does_not_affect_classification() {
        let source = vec![Snapshot::new("s1").with_meta("message", "hi")];
        assert_eq!(can_apply(&source, &snaps(&["s1"])), Reconciliation::UpToDate);
    }

    #[test]
    fn test_restrict_snapshots() {
        let all = snaps(&["s1", "s2", "s3"]);
        assert_eq!(restrict_snapshots(&all, "").map(<[_]>::len), Some(3));
        assert_eq!(restrict_snapshots(&all, "s2"), Some(&all[..2]));
        assert_eq!(restrict_snapshots(&all, "nope"), None);
    }

    fn history() -> impl Strategy<Value = Vec<Snapshot>> {
        prop::collection::vec("[a-d]", 0..6)
            .prop_map(|ids| ids.into_iter().map(Snapshot::new).collect())
    }

    proptest! {
        #[test]
        fn prop_classification_is_stable(source in history(), candidate in history()) {
            prop_assert_eq!(can_apply(&source, &candidate), can_apply(&source, &candidate));
        }

        #[test]
        fn prop_fast_forward_means_candidate_is_strict_prefix(
            source in history(),
            candidate in history(),
        ) {
            if let Reconciliation::FastForward { from, to } = can_apply(&source, &candidate) {
                prop_assert!(candidate.len() < source.len());
                prop_assert_eq!(&source[..candidate.len()], &candidate[..]);
                prop_assert_eq!(from.as_ref(), candidate.last());
                prop_assert_eq!(Some(&to), source.last());
            }
        }

        #[test]
        fn prop_up_to_date_iff_equal_and_non_empty(source in history(), candidate in history()) {
            let up_to_date = can_apply(&source, &candidate) == Reconciliation::UpToDate;
            prop_assert_eq!(up_to_date, !source.is_empty() && source == candidate);
        }

        #[test]
        fn prop_prefix_of_source_always_fast_forwards(source in history(), cut in 0usize..6) {
            prop_assume!(!source.is_empty());
            let cut = cut % source.len();
            prop_assert!(can_apply(&source, &source[..cut]).is_fast_forward());
        }
    }
}
