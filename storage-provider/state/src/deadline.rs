use std::collections::BTreeMap;

use primitives_proofs::{BlockNumber, PartitionNumber, SectorNumber};
use serde::{Deserialize, Serialize};

use crate::{
    error::{DeadlineError, ScheduleMisconfiguration},
    params::ProvingParameters,
    partition::Partition,
};

mod assignment;

pub use assignment::assign_deadlines;

const LOG_TARGET: &str = "storage_provider::deadline";

/// Deadline holds the partitions of all sectors due at a specific deadline.
///
/// A deadline exists along side `w_post_period_deadlines - 1` other deadlines.
/// Only one deadline may be open at a given height.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deadline {
    /// Partitions in this deadline. Indexed by partition number.
    pub partitions: BTreeMap<PartitionNumber, Partition>,

    /// The number of non-terminated sectors in this deadline (incl faulty).
    pub live_sectors: u64,

    /// The total number of sectors in this deadline (incl dead).
    pub total_sectors: u64,
}

impl Deadline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds sectors to this deadline, filling the last partition first.
    /// It's the caller's responsibility to make sure that this deadline is mutable.
    ///
    /// Returns the partition every sector landed in, in input order.
    pub fn add_sectors(
        &mut self,
        deadline_idx: u64,
        partition_size: u64,
        max_partitions: u64,
        sectors: &[SectorNumber],
    ) -> Result<Vec<PartitionNumber>, DeadlineError> {
        if sectors.is_empty() {
            return Ok(Vec::new());
        }

        let last_partition = self.partitions.len().saturating_sub(1) as PartitionNumber;
        let free_in_last = self
            .partitions
            .get(&last_partition)
            .map(|partition| partition_size.saturating_sub(partition.sectors.len() as u64))
            .unwrap_or(0);
        let needed = (sectors.len() as u64).saturating_sub(free_in_last);
        let new_partitions = needed.div_ceil(partition_size);
        if self.partitions.len() as u64 + new_partitions > max_partitions {
            tracing::error!(target: LOG_TARGET, deadline_idx, max_partitions, "add_sectors: partition limit reached");
            return Err(DeadlineError::MaxPartitionsReached {
                deadline: deadline_idx,
                max_partitions,
            });
        }

        let mut placements = Vec::with_capacity(sectors.len());
        let mut remaining = sectors;
        let mut partition_idx = last_partition;
        while !remaining.is_empty() {
            let partition = self.partitions.entry(partition_idx).or_default();
            let sector_count = partition.sectors.len() as u64;
            if sector_count >= partition_size {
                partition_idx += 1;
                continue;
            }

            let size = core::cmp::min(partition_size - sector_count, remaining.len() as u64);
            let (partition_new_sectors, rest) = remaining.split_at(size as usize);
            // Duplicates are rejected by the index before reaching this point.
            partition
                .add_sectors(partition_new_sectors)
                .map_err(|_| DeadlineError::CouldNotAssignSectorsToDeadlines)?;
            placements.extend(core::iter::repeat(partition_idx).take(partition_new_sectors.len()));
            remaining = rest;
        }

        self.live_sectors += sectors.len() as u64;
        self.total_sectors += sectors.len() as u64;
        tracing::debug!(target: LOG_TARGET, deadline_idx, live = self.live_sectors, total = self.total_sectors, "add_sectors");

        Ok(placements)
    }

    pub fn load_partition(&self, deadline_idx: u64, partition: PartitionNumber) -> Result<&Partition, DeadlineError> {
        self.partitions
            .get(&partition)
            .ok_or(DeadlineError::PartitionNotFound {
                deadline: deadline_idx,
                partition,
            })
    }

    pub fn load_partition_mut(
        &mut self,
        deadline_idx: u64,
        partition: PartitionNumber,
    ) -> Result<&mut Partition, DeadlineError> {
        self.partitions
            .get_mut(&partition)
            .ok_or(DeadlineError::PartitionNotFound {
                deadline: deadline_idx,
                partition,
            })
    }
}

/// All the deadlines of a provider, indexed by their position in the proving period.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deadlines {
    pub due: Vec<Deadline>,
}

impl Deadlines {
    pub fn new(w_post_period_deadlines: u64) -> Self {
        Self {
            due: (0..w_post_period_deadlines).map(|_| Deadline::new()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.due.len()
    }

    pub fn is_empty(&self) -> bool {
        self.due.is_empty()
    }

    /// Loads a deadline.
    /// Fails if the index is out of range.
    pub fn load_deadline(&self, idx: u64) -> Result<&Deadline, DeadlineError> {
        self.due
            .get(idx as usize)
            .ok_or(DeadlineError::DeadlineIndexOutOfRange(idx))
    }

    /// Loads a mutable deadline.
    /// Fails if the index is out of range.
    pub fn load_deadline_mut(&mut self, idx: u64) -> Result<&mut Deadline, DeadlineError> {
        self.due
            .get_mut(idx as usize)
            .ok_or(DeadlineError::DeadlineIndexOutOfRange(idx))
    }
}

/// A single instance of a deadline, derived from the height it was computed at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlineInfo {
    /// The block number at which this info was calculated.
    pub block_number: BlockNumber,

    /// The block number at which the proving period for this deadline starts.
    pub period_start: BlockNumber,

    /// The deadline index within its proving period.
    pub idx: u64,

    /// The first block number from which a proof can be submitted.
    pub open_at: BlockNumber,

    /// The first block number from which a proof can *no longer* be submitted.
    pub close_at: BlockNumber,

    /// The block number at which the challenge for this deadline is drawn.
    pub challenge_at: BlockNumber,

    /// The number of non-overlapping PoSt deadlines in each proving period.
    pub w_post_period_deadlines: u64,

    /// The period over which all an SP's active sectors will be challenged.
    pub w_post_proving_period: BlockNumber,

    /// The duration of a deadline.
    pub w_post_challenge_window: BlockNumber,
}

impl DeadlineInfo {
    /// Constructs a new `DeadlineInfo`
    // ref: <https://github.com/filecoin-project/builtin-actors/blob/8d957d2901c0f2044417c268f0511324f591cb92/actors/miner/src/deadline_info.rs#L43>
    pub fn new(
        block_number: BlockNumber,
        period_start: BlockNumber,
        idx: u64,
        params: &ProvingParameters,
    ) -> Self {
        let w_post_challenge_window = params.challenge_window();
        let (open_at, close_at) = if idx < params.w_post_period_deadlines {
            let open_at = period_start + idx * w_post_challenge_window;
            (open_at, open_at + w_post_challenge_window)
        } else {
            let after_last_deadline = period_start + params.w_post_proving_period;
            (after_last_deadline, after_last_deadline)
        };
        Self {
            block_number,
            period_start,
            idx,
            open_at,
            close_at,
            challenge_at: close_at.saturating_sub(params.w_post_challenge_offset).max(open_at),
            w_post_period_deadlines: params.w_post_period_deadlines,
            w_post_proving_period: params.w_post_proving_period,
            w_post_challenge_window,
        }
    }

    /// Whether the current deadline is currently open.
    pub fn is_open(&self) -> bool {
        self.block_number >= self.open_at && self.block_number < self.close_at
    }

    /// Whether the current deadline has already closed.
    pub fn has_elapsed(&self) -> bool {
        self.block_number >= self.close_at
    }

    /// Whether the challenge has been drawn and the deadline is still open.
    pub fn in_challenge_window(&self) -> bool {
        self.block_number >= self.challenge_at && self.block_number < self.close_at
    }

    /// Returns the next instance of this deadline that has not yet elapsed.
    ///
    /// If the current deadline has not elapsed yet then it returns the current deadline.
    pub fn next_not_elapsed(self) -> Self {
        if !self.has_elapsed() {
            return self;
        }

        // has elapsed, advance by some multiples of w_post_proving_period
        let gap = self.block_number - self.close_at;
        let delta_periods = 1 + gap / self.w_post_proving_period;
        self.with_period_start(self.period_start + self.w_post_proving_period * delta_periods)
    }

    /// The deadline instance directly following this one, wrapping into the next period.
    pub fn next(&self) -> Self {
        if self.idx + 1 < self.w_post_period_deadlines {
            self.with_index(self.idx + 1)
        } else {
            self.with_period_start(self.period_start + self.w_post_proving_period)
                .with_index(0)
        }
    }

    /// Same deadline, seen from another height.
    pub fn at(mut self, block_number: BlockNumber) -> Self {
        self.block_number = block_number;
        self
    }

    /// Moves the instance forward to a later proving period.
    fn with_period_start(mut self, period_start: BlockNumber) -> Self {
        let shift = period_start - self.period_start;
        self.period_start = period_start;
        self.open_at += shift;
        self.close_at += shift;
        self.challenge_at += shift;
        self
    }

    fn with_index(mut self, idx: u64) -> Self {
        let offset = self.close_at - self.challenge_at;
        self.idx = idx;
        self.open_at = self.period_start + idx * self.w_post_challenge_window;
        self.close_at = self.open_at + self.w_post_challenge_window;
        self.challenge_at = self.close_at - offset;
        self
    }
}

/// Maps heights to deadline instances for a single provider.
///
/// The schedule holds no mutable state: the proving period containing a height
/// is always recomputed from the height itself, so arbitrarily long gaps between
/// evaluations cannot make it drift.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlineSchedule {
    period_start: BlockNumber,
    params: ProvingParameters,
}

impl DeadlineSchedule {
    pub fn new(
        period_start: BlockNumber,
        params: ProvingParameters,
    ) -> Result<Self, ScheduleMisconfiguration> {
        params.validate()?;
        Ok(Self {
            period_start,
            params,
        })
    }

    /// Start of the very first proving period.
    pub fn first_period_start(&self) -> BlockNumber {
        self.period_start
    }

    pub fn params(&self) -> &ProvingParameters {
        &self.params
    }

    /// Start of the proving period containing `height`,
    /// `None` if the first period has not started yet.
    pub fn period_start_at(&self, height: BlockNumber) -> Option<BlockNumber> {
        let elapsed = height.checked_sub(self.period_start)?;
        let period = self.params.w_post_proving_period;
        Some(self.period_start + (elapsed / period) * period)
    }

    /// The deadline open at `height`, `None` before the first period starts.
    pub fn current(&self, height: BlockNumber) -> Option<DeadlineInfo> {
        let period_start = self.period_start_at(height)?;
        let idx = (height - period_start) / self.params.challenge_window();
        Some(DeadlineInfo::new(height, period_start, idx, &self.params))
    }

    /// The next instance of deadline `idx` that has not elapsed at `height`.
    pub fn deadline(&self, height: BlockNumber, idx: u64) -> Option<DeadlineInfo> {
        if idx >= self.params.w_post_period_deadlines {
            return None;
        }
        let period_start = self.period_start_at(height).unwrap_or(self.period_start);
        Some(DeadlineInfo::new(height, period_start, idx, &self.params).next_not_elapsed())
    }

    /// The latest instance of deadline `idx` that closed at or before `height`.
    pub fn last_closed(&self, height: BlockNumber, idx: u64) -> Option<DeadlineInfo> {
        if idx >= self.params.w_post_period_deadlines {
            return None;
        }
        let period_start = self.period_start_at(height)?;
        let dl = DeadlineInfo::new(height, period_start, idx, &self.params);
        if dl.close_at <= height {
            return Some(dl);
        }
        let previous = period_start.checked_sub(self.params.w_post_proving_period)?;
        (previous >= self.period_start)
            .then(|| DeadlineInfo::new(height, previous, idx, &self.params))
    }

    /// Returns true if the deadline at the given index can accept new sectors at `height`.
    pub fn deadline_is_mutable(&self, idx: u64, height: BlockNumber) -> bool {
        self.deadline(height, idx)
            .map(|dl_info| deadline_is_mutable(&dl_info))
            .unwrap_or(false)
    }
}

/// Returns true if the given deadline instance is currently mutable.
///
/// A deadline is immutable while it is open and during the challenge window before
/// it opens.
pub fn deadline_is_mutable(dl_info: &DeadlineInfo) -> bool {
    let dl_info = dl_info.next_not_elapsed();
    tracing::trace!(target: LOG_TARGET, ?dl_info, "deadline_is_mutable");
    // Ensure that the current block is at least one challenge window before
    // that deadline opens.
    dl_info.block_number < dl_info.open_at.saturating_sub(dl_info.w_post_challenge_window)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn schedule(period_start: BlockNumber) -> DeadlineSchedule {
        DeadlineSchedule::new(period_start, ProvingParameters::default()).unwrap()
    }

    #[rstest]
    // height, period start, expected (period start, idx, open, close)
    #[case(0, 0, Some((0, 0, 0, 10)))]
    #[case(9, 0, Some((0, 0, 0, 10)))]
    #[case(10, 0, Some((0, 1, 10, 20)))]
    #[case(59, 0, Some((0, 5, 50, 60)))]
    #[case(60, 0, Some((60, 0, 60, 70)))]
    #[case(125, 5, Some((125, 0, 125, 135)))]
    #[case(4, 5, None)]
    // a long stall lands directly in the right period
    #[case(60_000 + 42, 0, Some((60_000, 4, 60_040, 60_050)))]
    fn current_deadline(
        #[case] height: BlockNumber,
        #[case] period_start: BlockNumber,
        #[case] expected: Option<(BlockNumber, u64, BlockNumber, BlockNumber)>,
    ) {
        let current = schedule(period_start)
            .current(height)
            .map(|dl| (dl.period_start, dl.idx, dl.open_at, dl.close_at));
        assert_eq!(current, expected);
    }

    #[test]
    fn schedule_is_deterministic() {
        let a = schedule(3);
        let b = schedule(3);
        for height in 0..500 {
            assert_eq!(a.current(height), b.current(height));
        }
    }

    #[test]
    fn period_start_advances_by_one_period() {
        let schedule = schedule(7);
        let mut starts: Vec<_> = (0..200).filter_map(|h| schedule.period_start_at(h)).collect();
        starts.dedup();
        assert_eq!(starts, vec![7, 67, 127, 187]);
    }

    #[test]
    fn challenge_window_is_at_the_end_of_the_deadline() {
        let params = ProvingParameters {
            w_post_challenge_offset: 4,
            ..Default::default()
        };
        let schedule = DeadlineSchedule::new(0, params).unwrap();

        let dl = schedule.current(12).unwrap();
        assert_eq!((dl.open_at, dl.challenge_at, dl.close_at), (10, 16, 20));
        assert!(dl.is_open());
        assert!(!dl.in_challenge_window());
        assert!(dl.at(16).in_challenge_window());
        assert!(dl.at(19).in_challenge_window());
        assert!(!dl.at(20).in_challenge_window());
        assert!(dl.at(20).has_elapsed());
    }

    #[rstest]
    // height, period start, idx, expected (open, close)
    #[case(20, 0, 1, Some((10, 20)))]
    #[case(20, 0, 2, None)]
    #[case(60, 0, 5, Some((50, 60)))]
    #[case(95, 0, 2, Some((80, 90)))]
    #[case(85, 0, 3, Some((30, 40)))]
    #[case(500, 0, 2, Some((440, 450)))]
    #[case(4, 5, 0, None)]
    fn last_closed_instance(
        #[case] height: BlockNumber,
        #[case] period_start: BlockNumber,
        #[case] idx: u64,
        #[case] expected: Option<(BlockNumber, BlockNumber)>,
    ) {
        let closed = schedule(period_start)
            .last_closed(height, idx)
            .map(|dl| (dl.open_at, dl.close_at));
        assert_eq!(closed, expected);
    }

    #[rstest]
    #[case(0, 1, (10, 20))]
    #[case(3, 4, (40, 50))]
    #[case(5, 0, (60, 70))]
    fn next_deadline_wraps(
        #[case] idx: u64,
        #[case] expected_idx: u64,
        #[case] expected: (BlockNumber, BlockNumber),
    ) {
        let next = DeadlineInfo::new(0, 0, idx, &ProvingParameters::default()).next();
        assert_eq!(next.idx, expected_idx);
        assert_eq!((next.open_at, next.close_at), expected);
        assert_eq!(next.close_at - next.challenge_at, 10);
    }

    #[test]
    fn next_not_elapsed_skips_whole_periods() {
        let params = ProvingParameters::default();
        let dl = DeadlineInfo::new(250, 0, 2, &params).next_not_elapsed();
        assert_eq!(dl.period_start, 240);
        assert_eq!((dl.open_at, dl.close_at), (260, 270));

        let dl = DeadlineInfo::new(265, 0, 2, &params).next_not_elapsed();
        assert_eq!((dl.open_at, dl.close_at), (260, 270));

        let dl = DeadlineInfo::new(270, 0, 2, &params).next_not_elapsed();
        assert_eq!((dl.open_at, dl.close_at), (320, 330));
    }

    #[rstest]
    // deadline 0 is open at 1
    #[case(1, 0, false)]
    // deadline 1 opens within one window
    #[case(1, 1, false)]
    #[case(1, 2, true)]
    #[case(1, 5, true)]
    // deadline 0 next opens at 60
    #[case(49, 0, true)]
    #[case(50, 0, false)]
    fn mutable_deadlines(#[case] height: BlockNumber, #[case] idx: u64, #[case] expected: bool) {
        assert_eq!(schedule(0).deadline_is_mutable(idx, height), expected);
    }

    #[test]
    fn deadline_adds_fill_last_partition() {
        let mut deadline = Deadline::new();
        assert_eq!(deadline.add_sectors(0, 2, 10, &[1, 2, 3]).unwrap(), vec![0, 0, 1]);
        assert_eq!(deadline.add_sectors(0, 2, 10, &[4, 5]).unwrap(), vec![1, 2]);
        assert_eq!(deadline.live_sectors, 5);
        assert_eq!(deadline.partitions.len(), 3);
    }

    #[test]
    fn deadline_respects_partition_limit() {
        let mut deadline = Deadline::new();
        deadline.add_sectors(3, 2, 2, &[1, 2, 3]).unwrap();
        assert_eq!(
            deadline.add_sectors(3, 2, 2, &[4, 5]),
            Err(DeadlineError::MaxPartitionsReached {
                deadline: 3,
                max_partitions: 2
            })
        );
        assert_eq!(deadline.live_sectors, 3);
        assert_eq!(deadline.add_sectors(3, 2, 2, &[4]).unwrap(), vec![1]);
    }
}
