use std::collections::BTreeSet;

use primitives_proofs::{PartitionNumber, ProviderId, RegisteredPoStProof, SectorNumber};
use serde::{Deserialize, Serialize};

use crate::{deadline::DeadlineInfo, sector::SectorOnChainInfo};

/// The sectors of one partition that a Window PoSt must cover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionProofRequest {
    pub partition: PartitionNumber,
    /// Challenged sectors, each carrying the seal proof it was committed with.
    pub sectors: Vec<SectorOnChainInfo>,
}

/// A Window PoSt to be generated for one deadline instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoStJob {
    pub provider: ProviderId,
    pub deadline: DeadlineInfo,
    /// Proof type in effect when the challenge was drawn.
    pub proof_type: RegisteredPoStProof,
    pub partitions: Vec<PartitionProofRequest>,
}

impl PoStJob {
    pub fn partition_numbers(&self) -> BTreeSet<PartitionNumber> {
        self.partitions.iter().map(|p| p.partition).collect()
    }

    /// Drops the given partitions from the job, returns whether any partition is left.
    pub fn retain_partitions(&mut self, drop: &BTreeSet<PartitionNumber>) -> bool {
        self.partitions.retain(|p| !drop.contains(&p.partition));
        !self.partitions.is_empty()
    }
}

/// What the prover managed to prove.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOutcome {
    /// Partitions covered by a valid proof.
    pub proven: BTreeSet<PartitionNumber>,
    /// Sectors the prover could not read; they are excluded from the proof
    /// and become faulty.
    pub skipped: BTreeSet<SectorNumber>,
}

impl ProofOutcome {
    pub fn merge(&mut self, other: ProofOutcome) {
        self.proven.extend(other.proven);
        self.skipped.extend(other.skipped);
    }
}
