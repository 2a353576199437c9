use std::{cmp::Ordering, collections::BinaryHeap};

use primitives_proofs::SectorNumber;

use crate::deadline::{Deadline, DeadlineError};

const LOG_TARGET: &str = "storage_provider::assignment";

/// Intermediary data structure used to assign deadlines to sectors.
struct DeadlineAssignmentInfo {
    /// The deadline index.
    index: usize,
    /// The number of live sectors (i.e. sectors that have *not* been terminated) in the deadline.
    live_sectors: u64,
    /// The total number of sectors in the deadline (may include terminated ones).
    total_sectors: u64,
}

impl DeadlineAssignmentInfo {
    /// Returns the amount of partitions after adding 1 sector to total sectors.
    fn partitions_after_assignment(&self, partition_size: u64) -> u64 {
        let total_sectors = self.total_sectors + 1; // after assignment
        total_sectors.div_ceil(partition_size)
    }

    /// Returns the amount of partitions after adding 1 sector to live sectors.
    fn compact_partitions_after_assignment(&self, partition_size: u64) -> u64 {
        let live_sectors = self.live_sectors + 1; // after assignment
        live_sectors.div_ceil(partition_size)
    }

    /// total_sectors % partition size is zero if the partition is full.
    fn is_full_now(&self, partition_size: u64) -> bool {
        self.total_sectors % partition_size == 0
    }

    fn max_partitions_reached(&self, partition_size: u64, max_partitions: u64) -> bool {
        self.total_sectors >= partition_size * max_partitions
    }
}

/// Reference: https://github.com/filecoin-project/builtin-actors/blob/8d957d2901c0f2044417c268f0511324f591cb92/actors/miner/src/deadline_assignment.rs#L47
///
/// 1. Assign to the deadline that will have the _least_ number of
///    post-compaction partitions (after sector assignment).
/// 2. Assign to the deadline that will have the _least_ number of
///    pre-compaction partitions (after sector assignment).
/// 3. Assign to a deadline with a non-full partition.
///    - If both have non-full partitions, assign to the most full one (stable assortment).
/// 4. Assign to the deadline with the least number of live sectors.
/// 5. Assign sectors to the deadline with the lowest index first.
fn cmp(a: &DeadlineAssignmentInfo, b: &DeadlineAssignmentInfo, partition_size: u64) -> Ordering {
    a.compact_partitions_after_assignment(partition_size)
        .cmp(&b.compact_partitions_after_assignment(partition_size))
        .then_with(|| {
            a.partitions_after_assignment(partition_size)
                .cmp(&b.partitions_after_assignment(partition_size))
        })
        .then_with(|| {
            // Same number of partitions any which way we go.
            // Try to fill up a partition instead of opening a new one.
            a.is_full_now(partition_size)
                .cmp(&b.is_full_now(partition_size))
        })
        .then_with(|| {
            // Two open partitions: fill the most-full one so runs of
            // sequential sectors land in the same partition.
            if !a.is_full_now(partition_size) && !b.is_full_now(partition_size) {
                a.total_sectors.cmp(&b.total_sectors).reverse()
            } else {
                Ordering::Equal
            }
        })
        .then_with(|| a.live_sectors.cmp(&b.live_sectors))
        .then_with(|| a.index.cmp(&b.index))
}

/// Assigns sectors to deadlines, first filling partial partitions, then
/// adding new partitions to deadlines with the fewest live sectors.
///
/// `deadlines` holds one entry per deadline of the proving period, `None` for
/// deadlines that must not receive sectors.
///
/// Returns one vector per deadline holding the sectors assigned to it, in
/// input order. Deadlines that weren't assigned any sectors have an empty vector.
pub fn assign_deadlines(
    max_partitions: u64,
    partition_size: u64,
    deadlines: &[Option<&Deadline>],
    sectors: &[SectorNumber],
) -> Result<Vec<Vec<SectorNumber>>, DeadlineError> {
    struct Entry {
        partition_size: u64,
        info: DeadlineAssignmentInfo,
    }

    impl PartialEq for Entry {
        fn eq(&self, other: &Self) -> bool {
            self.cmp(other) == Ordering::Equal
        }
    }

    impl Eq for Entry {}

    impl PartialOrd for Entry {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for Entry {
        fn cmp(&self, other: &Self) -> Ordering {
            // we're using a max heap instead of a min heap, so we need to reverse the ordering
            cmp(&self.info, &other.info, self.partition_size).reverse()
        }
    }

    let mut heap: BinaryHeap<Entry> = deadlines
        .iter()
        .enumerate()
        .filter_map(|(index, deadline)| deadline.map(|dl| (index, dl)))
        .map(|(index, deadline)| Entry {
            partition_size,
            info: DeadlineAssignmentInfo {
                index,
                live_sectors: deadline.live_sectors,
                total_sectors: deadline.total_sectors,
            },
        })
        .collect();
    tracing::debug!(
        target: LOG_TARGET,
        eligible = heap.len(),
        sectors = sectors.len(),
        "assign_deadlines"
    );

    let mut assigned = vec![Vec::new(); deadlines.len()];

    for sector in sectors {
        let mut top = heap
            .peek_mut()
            .ok_or(DeadlineError::CouldNotAssignSectorsToDeadlines)?;
        let info = &mut top.info;

        if info.max_partitions_reached(partition_size, max_partitions) {
            return Err(DeadlineError::MaxPartitionsReached {
                deadline: info.index as u64,
                max_partitions,
            });
        }

        assigned[info.index].push(*sector);
        info.live_sectors += 1;
        info.total_sectors += 1;
    }

    Ok(assigned)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const PARTITION_SIZE: u64 = 4;
    const MAX_PARTITIONS: u64 = 100;

    /// `(live_sectors, dead_sectors, expected sectors)`, `None` for ineligible deadlines.
    type Layout = Option<(u64, u64, Vec<SectorNumber>)>;

    #[rstest]
    #[case::even_assignment_and_striping(10, vec![
        Some((0, 0, vec![0, 1, 2, 3, 8, 9])),
        Some((0, 0, vec![4, 5, 6, 7])),
    ])]
    #[case::fill_non_full_first(5, vec![
        Some((0, 0, vec![3, 4])),
        None,
        None,
        Some((1, 0, vec![0, 1, 2])),
    ])]
    #[case::least_live_partitions(1, vec![
        // 2 live partitions. +1 would add another.
        Some((8, 0, vec![])),
        // 2 live partitions. +1 wouldn't add another. 1 dead partition.
        Some((7, 5, vec![0])),
    ])]
    #[case::avoid_increasing_max_partitions(1, vec![
        // one live, one dead.
        Some((4, 4, vec![])),
        // 1 live partitions. +1 would add another.
        Some((4, 0, vec![0])),
    ])]
    #[case::most_full_open_partition_first(1, vec![
        Some((1, 0, vec![])),
        Some((2, 0, vec![0])),
    ])]
    #[case::dead_sectors_count(1, vec![
        Some((1, 0, vec![])),
        Some((0, 2, vec![0])),
    ])]
    #[case::dead_sectors_really_count(1, vec![
        Some((0, 1, vec![])),
        Some((0, 2, vec![0])),
    ])]
    #[case::equally_full_uses_live_sectors(1, vec![
        Some((1, 1, vec![])),
        Some((0, 2, vec![0])),
    ])]
    fn deadline_assignment(#[case] sectors: u64, #[case] layouts: Vec<Layout>) {
        let deadlines: Vec<Option<Deadline>> = layouts
            .iter()
            .map(|layout| {
                layout.as_ref().map(|(live, dead, _)| Deadline {
                    live_sectors: *live,
                    total_sectors: live + dead,
                    ..Default::default()
                })
            })
            .collect();
        let eligible: Vec<Option<&Deadline>> = deadlines.iter().map(Option::as_ref).collect();
        let sectors: Vec<SectorNumber> = (0..sectors).collect();

        let assignment =
            assign_deadlines(MAX_PARTITIONS, PARTITION_SIZE, &eligible, &sectors).unwrap();

        for (idx, layout) in layouts.into_iter().enumerate() {
            let expected = layout.map(|(_, _, expected)| expected).unwrap_or_default();
            assert_eq!(assignment[idx], expected, "deadline {idx}");
        }
    }

    #[test]
    fn no_eligible_deadline() {
        let assignment = assign_deadlines(MAX_PARTITIONS, PARTITION_SIZE, &[None, None], &[1]);
        assert_eq!(
            assignment,
            Err(DeadlineError::CouldNotAssignSectorsToDeadlines)
        );
    }

    #[test]
    fn full_deadlines_are_rejected() {
        let full = Deadline {
            live_sectors: 8,
            total_sectors: 8,
            ..Default::default()
        };
        let assignment = assign_deadlines(2, PARTITION_SIZE, &[Some(&full)], &[1]);
        assert_eq!(
            assignment,
            Err(DeadlineError::MaxPartitionsReached {
                deadline: 0,
                max_partitions: 2
            })
        );
    }
}
