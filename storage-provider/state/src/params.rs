use primitives_proofs::BlockNumber;
use serde::{Deserialize, Serialize};

use crate::error::ScheduleMisconfiguration;

/// Hard cap on the number of live sectors a single provider can hold.
/// ref: <https://github.com/filecoin-project/builtin-actors/blob/82d02e58f9ef456aeaf2a6c737562ac97b22b244/runtime/src/runtime/policy.rs#L289>
pub const MAX_SECTORS: u64 = 32 << 20;

/// Max amount of partitions per deadline.
/// ref: <https://github.com/filecoin-project/builtin-actors/blob/82d02e58f9ef456aeaf2a6c737562ac97b22b244/runtime/src/runtime/policy.rs#L283>
pub const MAX_PARTITIONS_PER_DEADLINE: u64 = 3000;

/// Proving period of a small development network, in blocks.
pub const DEFAULT_PROVING_PERIOD: BlockNumber = 60;

/// Number of deadlines in [`DEFAULT_PROVING_PERIOD`].
pub const DEFAULT_PERIOD_DEADLINES: u64 = 6;

/// Window PoSt parameters shared by every provider on a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvingParameters {
    /// The period over which all of a provider's active sectors will be challenged.
    pub w_post_proving_period: BlockNumber,

    /// The number of non-overlapping deadlines in each proving period.
    pub w_post_period_deadlines: u64,

    /// Length of the challenge sub-window at the end of each deadline.
    ///
    /// The challenge for a deadline is taken at `close_at - w_post_challenge_offset`,
    /// proofs must be accepted before `close_at`. Must be within `1..=challenge_window`.
    pub w_post_challenge_offset: BlockNumber,

    /// Maximum number of sectors in a single partition.
    pub partition_size: u64,

    /// Maximum number of partitions a single deadline can hold.
    pub max_partitions_per_deadline: u64,

    /// Maximum number of live sectors per provider.
    pub max_sectors: u64,

    /// Number of blocks a sector may stay faulty before being terminated.
    pub fault_max_age: BlockNumber,
}

impl Default for ProvingParameters {
    fn default() -> Self {
        let window = DEFAULT_PROVING_PERIOD / DEFAULT_PERIOD_DEADLINES;
        Self {
            w_post_proving_period: DEFAULT_PROVING_PERIOD,
            w_post_period_deadlines: DEFAULT_PERIOD_DEADLINES,
            w_post_challenge_offset: window,
            partition_size: 2,
            max_partitions_per_deadline: MAX_PARTITIONS_PER_DEADLINE,
            max_sectors: MAX_SECTORS,
            fault_max_age: 3 * DEFAULT_PROVING_PERIOD,
        }
    }
}

impl ProvingParameters {
    /// Duration of a single deadline, `proving_period / period_deadlines`.
    ///
    /// Only meaningful for validated parameters.
    pub fn challenge_window(&self) -> BlockNumber {
        self.w_post_proving_period / self.w_post_period_deadlines.max(1)
    }

    /// Checks that the parameters describe a usable schedule.
    pub fn validate(&self) -> Result<(), ScheduleMisconfiguration> {
        if self.w_post_period_deadlines == 0 {
            return Err(ScheduleMisconfiguration::ZeroDeadlines);
        }
        if self.w_post_proving_period == 0 {
            return Err(ScheduleMisconfiguration::ZeroProvingPeriod);
        }
        if self.w_post_proving_period % self.w_post_period_deadlines != 0 {
            return Err(ScheduleMisconfiguration::PeriodNotDivisible {
                period: self.w_post_proving_period,
                deadlines: self.w_post_period_deadlines,
            });
        }
        let window = self.challenge_window();
        if self.w_post_challenge_offset == 0 || self.w_post_challenge_offset > window {
            return Err(ScheduleMisconfiguration::ChallengeOffsetOutOfRange {
                offset: self.w_post_challenge_offset,
                window,
            });
        }
        if self.partition_size == 0 {
            return Err(ScheduleMisconfiguration::ZeroPartitionSize);
        }
        if self.max_partitions_per_deadline == 0 {
            return Err(ScheduleMisconfiguration::ZeroMaxPartitions);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let params = ProvingParameters::default();
        assert_eq!(params.validate(), Ok(()));
        assert_eq!(params.challenge_window(), 10);
    }

    #[rstest]
    #[case::no_deadlines(60, 0, 10, ScheduleMisconfiguration::ZeroDeadlines)]
    #[case::no_period(0, 6, 1, ScheduleMisconfiguration::ZeroProvingPeriod)]
    #[case::not_divisible(61, 6, 1, ScheduleMisconfiguration::PeriodNotDivisible { period: 61, deadlines: 6 })]
    #[case::more_deadlines_than_blocks(3, 6, 1, ScheduleMisconfiguration::PeriodNotDivisible { period: 3, deadlines: 6 })]
    #[case::zero_offset(60, 6, 0, ScheduleMisconfiguration::ChallengeOffsetOutOfRange { offset: 0, window: 10 })]
    #[case::offset_past_window(60, 6, 11, ScheduleMisconfiguration::ChallengeOffsetOutOfRange { offset: 11, window: 10 })]
    fn rejects_misconfiguration(
        #[case] period: BlockNumber,
        #[case] deadlines: u64,
        #[case] offset: BlockNumber,
        #[case] expected: ScheduleMisconfiguration,
    ) {
        let params = ProvingParameters {
            w_post_proving_period: period,
            w_post_period_deadlines: deadlines,
            w_post_challenge_offset: offset,
            ..Default::default()
        };
        assert_eq!(params.validate(), Err(expected));
    }

    #[test]
    fn rejects_empty_partitions() {
        let params = ProvingParameters {
            partition_size: 0,
            ..Default::default()
        };
        assert_eq!(
            params.validate(),
            Err(ScheduleMisconfiguration::ZeroPartitionSize)
        );
    }
}
