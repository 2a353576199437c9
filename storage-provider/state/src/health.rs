use std::collections::{BTreeMap, BTreeSet};

use primitives_proofs::{BlockNumber, PartitionNumber, SectorNumber, SectorSize};
use serde::{Deserialize, Serialize};

use crate::{
    error::{IndexError, StorageProviderError},
    fault::{FaultDeclaration, RecoveryDeclaration},
    index::{PartitionIndex, SectorLocation},
    params::ProvingParameters,
    partition::Partition,
    sector::{SectorHealth, SectorOnChainInfo},
};

const LOG_TARGET: &str = "storage_provider::health";

/// Result of applying a proof to a single partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionPoStResult {
    pub recovered: BTreeSet<SectorNumber>,
    pub new_faults: BTreeSet<SectorNumber>,
}

/// Owns the sectors of one provider and their health.
///
/// Health is derived from the partition sets, the tracker only validates
/// transitions before handing them to the right partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorHealthTracker {
    sectors: BTreeMap<SectorNumber, SectorOnChainInfo>,
    terminated: BTreeSet<SectorNumber>,
    index: PartitionIndex,
}

impl SectorHealthTracker {
    pub fn new(params: &ProvingParameters) -> Self {
        Self {
            sectors: BTreeMap::new(),
            terminated: BTreeSet::new(),
            index: PartitionIndex::new(params),
        }
    }

    pub fn index(&self) -> &PartitionIndex {
        &self.index
    }

    pub fn sector(&self, sector: SectorNumber) -> Option<&SectorOnChainInfo> {
        self.sectors.get(&sector)
    }

    /// Live sectors, terminated ones excluded.
    pub fn sectors(&self) -> impl Iterator<Item = &SectorOnChainInfo> {
        self.sectors.values()
    }

    /// Adds new sectors to the deadlines flagged in `mutable`. All or nothing.
    pub fn add_sectors(
        &mut self,
        sectors: &[SectorOnChainInfo],
        mutable: &[bool],
    ) -> Result<Vec<SectorLocation>, StorageProviderError> {
        let numbers: Vec<_> = sectors.iter().map(|s| s.sector_number).collect();
        let locations = self.index.assign_to_mutable(&numbers, mutable)?;
        for sector in sectors {
            self.sectors.insert(sector.sector_number, *sector);
        }
        Ok(locations)
    }

    pub fn location(&self, sector: SectorNumber) -> Option<SectorLocation> {
        self.index.location(sector)
    }

    /// Health of a sector, `None` if it was never committed.
    pub fn health(&self, sector: SectorNumber) -> Option<SectorHealth> {
        if self.terminated.contains(&sector) {
            return Some(SectorHealth::Terminated);
        }
        let location = self.index.location(sector)?;
        self.index.partition(location).ok()?.health_of(sector)
    }

    /// Declares sectors faulty. Every declaration is validated before any is applied.
    ///
    /// Returns the sectors that became faulty.
    pub fn declare_faults(
        &mut self,
        faults: &[FaultDeclaration],
        height: BlockNumber,
    ) -> Result<BTreeSet<SectorNumber>, StorageProviderError> {
        for fault in faults {
            self.check_declaration(fault.deadline, fault.partition, &fault.sectors, SectorHealth::Faulty)?;
        }

        let mut new_faults = BTreeSet::new();
        for fault in faults {
            let partition = self.partition_mut(fault.deadline, fault.partition)?;
            new_faults.extend(partition.record_faults(&fault.sectors, height)?);
        }
        tracing::debug!(target: LOG_TARGET, ?new_faults, "declare_faults");

        Ok(new_faults)
    }

    /// Declares faulty sectors as recovering. Every declaration is validated
    /// before any is applied.
    ///
    /// Faults older than `fault_max_age` can no longer be recovered.
    pub fn declare_recoveries(
        &mut self,
        recoveries: &[RecoveryDeclaration],
        height: BlockNumber,
        fault_max_age: BlockNumber,
    ) -> Result<BTreeSet<SectorNumber>, StorageProviderError> {
        for recovery in recoveries {
            self.check_declaration(
                recovery.deadline,
                recovery.partition,
                &recovery.sectors,
                SectorHealth::Recovering,
            )?;
            let partition = self.partition(recovery.deadline, recovery.partition)?;
            for sector in &recovery.sectors {
                match partition.faulty_since.get(sector) {
                    None => {
                        tracing::warn!(target: LOG_TARGET, sector, "recovery declared for a sector that is not faulty");
                        return Err(StorageProviderError::InvalidTransition {
                            sector: *sector,
                            from: SectorHealth::Active,
                            to: SectorHealth::Recovering,
                        });
                    }
                    Some(since) if height.saturating_sub(*since) > fault_max_age => {
                        return Err(StorageProviderError::FaultGracePeriodExpired {
                            sector: *sector,
                            faulty_since: *since,
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        let mut new_recoveries = BTreeSet::new();
        for recovery in recoveries {
            let partition = self.partition_mut(recovery.deadline, recovery.partition)?;
            new_recoveries.extend(partition.declare_faults_recovered(&recovery.sectors)?);
        }
        tracing::debug!(target: LOG_TARGET, ?new_recoveries, "declare_recoveries");

        Ok(new_recoveries)
    }

    /// Terminates live sectors. All sectors are validated before any is terminated.
    pub fn terminate(
        &mut self,
        sectors: &BTreeSet<SectorNumber>,
    ) -> Result<Vec<SectorLocation>, StorageProviderError> {
        for sector in sectors {
            if self.terminated.contains(sector) {
                tracing::warn!(target: LOG_TARGET, sector, "termination of an already terminated sector");
                return Err(StorageProviderError::InvalidTransition {
                    sector: *sector,
                    from: SectorHealth::Terminated,
                    to: SectorHealth::Terminated,
                });
            }
            if self.index.location(*sector).is_none() {
                return Err(StorageProviderError::SectorNotFound(*sector));
            }
        }

        let mut locations = Vec::with_capacity(sectors.len());
        for sector in sectors {
            locations.push(self.index.remove(*sector)?);
            self.sectors.remove(sector);
            self.terminated.insert(*sector);
        }
        tracing::debug!(target: LOG_TARGET, ?sectors, "terminated sectors");

        Ok(locations)
    }

    /// Applies a successful proof of `partition`, `due` being the sectors the
    /// challenge covered and `skipped` the ones the prover could not read.
    pub fn record_proof(
        &mut self,
        deadline: u64,
        partition: PartitionNumber,
        due: &BTreeSet<SectorNumber>,
        skipped: &BTreeSet<SectorNumber>,
        height: BlockNumber,
    ) -> Result<PartitionPoStResult, StorageProviderError> {
        let (recovered, new_faults) =
            self.partition_mut(deadline, partition)?
                .record_proven(due, skipped, height)?;
        if !recovered.is_empty() || !new_faults.is_empty() {
            tracing::debug!(target: LOG_TARGET, deadline, partition, ?recovered, ?new_faults, "record_proof");
        }
        Ok(PartitionPoStResult {
            recovered,
            new_faults,
        })
    }

    /// Records a missed proof of `partition`. Idempotent.
    pub fn record_missed(
        &mut self,
        deadline: u64,
        partition: PartitionNumber,
        due: &BTreeSet<SectorNumber>,
        height: BlockNumber,
    ) -> Result<BTreeSet<SectorNumber>, StorageProviderError> {
        let new_faults = self
            .partition_mut(deadline, partition)?
            .record_missed(due, height)?;
        if !new_faults.is_empty() {
            tracing::info!(target: LOG_TARGET, deadline, partition, ?new_faults, "missed window post");
        }
        Ok(new_faults)
    }

    /// Terminates the sectors of `deadline` that have been faulty for longer than `fault_max_age`.
    pub fn expire_faults(
        &mut self,
        deadline: u64,
        height: BlockNumber,
        fault_max_age: BlockNumber,
    ) -> Result<BTreeSet<SectorNumber>, StorageProviderError> {
        let expired: BTreeSet<SectorNumber> = self
            .index
            .partitions_for(deadline)?
            .values()
            .flat_map(|partition| partition.expired_faults(height, fault_max_age))
            .collect();
        if expired.is_empty() {
            return Ok(expired);
        }

        tracing::info!(target: LOG_TARGET, deadline, ?expired, "terminating expired faults");
        self.terminate(&expired)?;
        Ok(expired)
    }

    /// Raw byte power: every live sector that is neither faulty nor unproven.
    pub fn power(&self, sector_size: SectorSize) -> u64 {
        let active: u64 = self
            .index
            .iter_partitions()
            .map(|(_, partition)| partition.active_sectors().len() as u64)
            .sum();
        active * sector_size.bytes()
    }

    fn check_declaration(
        &self,
        deadline: u64,
        partition: PartitionNumber,
        sectors: &BTreeSet<SectorNumber>,
        to: SectorHealth,
    ) -> Result<(), StorageProviderError> {
        let p = self.partition(deadline, partition)?;
        for sector in sectors {
            if self.terminated.contains(sector) {
                tracing::warn!(target: LOG_TARGET, sector, %to, "rejected transition of a terminated sector");
                return Err(StorageProviderError::InvalidTransition {
                    sector: *sector,
                    from: SectorHealth::Terminated,
                    to,
                });
            }
            if !p.sectors.contains(sector) {
                return Err(StorageProviderError::SectorNotInPartition {
                    sector: *sector,
                    deadline,
                    partition,
                });
            }
        }
        Ok(())
    }

    fn partition(&self, deadline: u64, partition: PartitionNumber) -> Result<&Partition, IndexError> {
        self.index.partition(SectorLocation {
            deadline,
            partition,
        })
    }

    fn partition_mut(
        &mut self,
        deadline: u64,
        partition: PartitionNumber,
    ) -> Result<&mut Partition, IndexError> {
        self.index.partition_mut(SectorLocation {
            deadline,
            partition,
        })
    }
}
