use std::collections::BTreeSet;

use primitives_proofs::{PartitionNumber, SectorNumber};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultDeclaration {
    /// The deadline to which the faulty sectors are assigned, in range [0..WPoStPeriodDeadlines)
    pub deadline: u64,
    /// Partition index within the deadline containing the faulty sectors.
    pub partition: PartitionNumber,
    /// Sectors in the partition being declared faulty.
    pub sectors: BTreeSet<SectorNumber>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryDeclaration {
    /// The deadline to which the recovered sectors are assigned, in range [0..WPoStPeriodDeadlines)
    pub deadline: u64,
    /// Partition index within the deadline containing the recovered sectors.
    pub partition: PartitionNumber,
    /// Sectors in the partition being declared recovered.
    pub sectors: BTreeSet<SectorNumber>,
}

impl FaultDeclaration {
    pub fn new<I>(deadline: u64, partition: PartitionNumber, sectors: I) -> Self
    where
        I: IntoIterator<Item = SectorNumber>,
    {
        Self {
            deadline,
            partition,
            sectors: sectors.into_iter().collect(),
        }
    }
}

impl RecoveryDeclaration {
    pub fn new<I>(deadline: u64, partition: PartitionNumber, sectors: I) -> Self
    where
        I: IntoIterator<Item = SectorNumber>,
    {
        Self {
            deadline,
            partition,
            sectors: sectors.into_iter().collect(),
        }
    }
}
