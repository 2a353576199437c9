use primitives_proofs::{BlockNumber, PartitionNumber, SectorNumber};

use crate::sector::SectorHealth;

/// Rejected proving configuration. Only returned by constructors and validators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleMisconfiguration {
    #[error("the number of deadlines per proving period must be greater than zero")]
    ZeroDeadlines,
    #[error("the proving period must be greater than zero")]
    ZeroProvingPeriod,
    #[error("proving period {period} is not divisible into {deadlines} deadlines")]
    PeriodNotDivisible { period: BlockNumber, deadlines: u64 },
    #[error("challenge offset {offset} must be within 1..={window} (the challenge window)")]
    ChallengeOffsetOutOfRange {
        offset: BlockNumber,
        window: BlockNumber,
    },
    #[error("partition size must be greater than zero")]
    ZeroPartitionSize,
    #[error("the maximum number of partitions per deadline must be greater than zero")]
    ZeroMaxPartitions,
    #[error("proving period offset {offset} must be smaller than the proving period {period}")]
    PeriodOffsetOutOfRange {
        offset: BlockNumber,
        period: BlockNumber,
    },
    #[error("the upgrade schedule is empty")]
    EmptyUpgradeSchedule,
    #[error("upgrade at height {height} does not come after the upgrade at height {previous}")]
    NonMonotonicActivation {
        height: BlockNumber,
        previous: BlockNumber,
    },
    #[error("network version {version} does not come after network version {previous}")]
    NonMonotonicVersion { version: u32, previous: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeadlineError {
    #[error("deadline index {0} is out of range")]
    DeadlineIndexOutOfRange(u64),
    #[error("partition {partition} not found in deadline {deadline}")]
    PartitionNotFound {
        deadline: u64,
        partition: PartitionNumber,
    },
    #[error("deadline {deadline} reached its maximum of {max_partitions} partitions")]
    MaxPartitionsReached { deadline: u64, max_partitions: u64 },
    #[error("no deadline is available for sector assignment")]
    CouldNotAssignSectorsToDeadlines,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PartitionError {
    #[error("sector {0} is already part of the partition")]
    DuplicateSectorNumber(SectorNumber),
    #[error("sector {0} is not part of the partition")]
    SectorNotFound(SectorNumber),
    #[error("sector {sector} cannot transition from {from} to {to}")]
    InvalidTransition {
        sector: SectorNumber,
        from: SectorHealth,
        to: SectorHealth,
    },
}

/// Which capacity bound was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityLimit {
    /// System-wide live sector cap.
    Sectors(u64),
    /// Partitions per deadline, across every eligible deadline.
    PartitionsPerDeadline(u64),
}

impl core::fmt::Display for CapacityLimit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CapacityLimit::Sectors(max) => write!(f, "maximum of {max} sectors"),
            CapacityLimit::PartitionsPerDeadline(max) => {
                write!(f, "maximum of {max} partitions per deadline")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(CapacityLimit),
    #[error("sector number {0} is already in use")]
    SectorNumberInUse(SectorNumber),
    #[error("sector {0} is not assigned to any partition")]
    SectorNotFound(SectorNumber),
    #[error(transparent)]
    Deadline(#[from] DeadlineError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageProviderError {
    #[error("sector {sector} cannot transition from {from} to {to}")]
    InvalidTransition {
        sector: SectorNumber,
        from: SectorHealth,
        to: SectorHealth,
    },
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(CapacityLimit),
    #[error("sector {0} not found")]
    SectorNotFound(SectorNumber),
    #[error("sector number {0} is already in use")]
    SectorNumberInUse(SectorNumber),
    #[error("sector {sector} is not in partition {partition} of deadline {deadline}")]
    SectorNotInPartition {
        sector: SectorNumber,
        deadline: u64,
        partition: PartitionNumber,
    },
    #[error("deadline {deadline} is inside its challenge window, declarations are closed")]
    DeclarationCutoff { deadline: u64 },
    #[error("sector {sector} has been faulty since height {faulty_since}, past the recovery grace period")]
    FaultGracePeriodExpired {
        sector: SectorNumber,
        faulty_since: BlockNumber,
    },
    #[error("the challenge window of deadline {deadline} opened at {open_at} is no longer pending")]
    WindowClosed { deadline: u64, open_at: BlockNumber },
    #[error(transparent)]
    Deadline(#[from] DeadlineError),
    #[error(transparent)]
    Misconfiguration(#[from] ScheduleMisconfiguration),
}

impl From<PartitionError> for StorageProviderError {
    fn from(value: PartitionError) -> Self {
        match value {
            PartitionError::DuplicateSectorNumber(sector) => Self::SectorNumberInUse(sector),
            PartitionError::SectorNotFound(sector) => Self::SectorNotFound(sector),
            PartitionError::InvalidTransition { sector, from, to } => {
                Self::InvalidTransition { sector, from, to }
            }
        }
    }
}

impl From<IndexError> for StorageProviderError {
    fn from(value: IndexError) -> Self {
        match value {
            IndexError::CapacityExceeded(limit) => Self::CapacityExceeded(limit),
            IndexError::SectorNumberInUse(sector) => Self::SectorNumberInUse(sector),
            IndexError::SectorNotFound(sector) => Self::SectorNotFound(sector),
            IndexError::Deadline(err) => Self::Deadline(err),
            IndexError::Partition(err) => err.into(),
        }
    }
}
