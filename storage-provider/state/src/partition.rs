use std::collections::{BTreeMap, BTreeSet};

use primitives_proofs::{BlockNumber, SectorNumber};
use serde::{Deserialize, Serialize};

use crate::{error::PartitionError, sector::SectorHealth};

const LOG_TARGET: &str = "storage_provider::partition";

/// A fixed-capacity group of sectors proven together within a deadline.
///
/// Sector numbers are never removed from `sectors`: terminated sectors stay
/// as tombstones so the partition keeps its slot count and sibling sectors keep
/// their indices.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// All sector numbers in this partition, including faulty, unproven and terminated sectors.
    pub sectors: BTreeSet<SectorNumber>,

    /// Sectors that have not been covered by a successful Window PoSt yet.
    /// They count as live but not as power.
    pub unproven: BTreeSet<SectorNumber>,

    /// Subset of sectors detected/declared faulty and not yet recovered (excl. from PoSt).
    /// The intersection of `faults` and `terminated` is always empty.
    pub faults: BTreeSet<SectorNumber>,

    /// Subset of faulty sectors expected to recover on next PoSt.
    /// Always a subset of `faults`.
    pub recoveries: BTreeSet<SectorNumber>,

    /// Subset of sectors terminated, kept as tombstones (excl. from PoSt).
    pub terminated: BTreeSet<SectorNumber>,

    /// Height at which each faulty sector was first recorded as faulty.
    pub faulty_since: BTreeMap<SectorNumber, BlockNumber>,
}

impl Partition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live sectors are sectors that are not terminated (i.e. not in `terminated`).
    pub fn live_sectors(&self) -> BTreeSet<SectorNumber> {
        self.sectors.difference(&self.terminated).copied().collect()
    }

    /// Live sectors that count towards power: neither faulty nor unproven.
    pub fn active_sectors(&self) -> BTreeSet<SectorNumber> {
        self.live_sectors()
            .into_iter()
            .filter(|sector| !self.faults.contains(sector) && !self.unproven.contains(sector))
            .collect()
    }

    /// Sectors expected to be proven at the next challenge:
    /// live sectors that are not faulty, plus the recovering ones.
    pub fn provable_sectors(&self) -> BTreeSet<SectorNumber> {
        self.live_sectors()
            .into_iter()
            .filter(|sector| !self.faults.contains(sector) || self.recoveries.contains(sector))
            .collect()
    }

    pub fn health_of(&self, sector: SectorNumber) -> Option<SectorHealth> {
        if !self.sectors.contains(&sector) {
            None
        } else if self.terminated.contains(&sector) {
            Some(SectorHealth::Terminated)
        } else if self.recoveries.contains(&sector) {
            Some(SectorHealth::Recovering)
        } else if self.faults.contains(&sector) {
            Some(SectorHealth::Faulty)
        } else {
            Some(SectorHealth::Active)
        }
    }

    /// Adds sectors to this partition.
    /// The sectors are live and unproven, neither faulty, recovering, nor terminated.
    ///
    /// Fails without modifying the partition if any of the given sector numbers is a duplicate.
    pub fn add_sectors(&mut self, sectors: &[SectorNumber]) -> Result<(), PartitionError> {
        let mut seen = BTreeSet::new();
        for sector in sectors {
            if self.sectors.contains(sector) || !seen.insert(*sector) {
                tracing::error!(target: LOG_TARGET, sector, "add_sectors: duplicate sector number");
                return Err(PartitionError::DuplicateSectorNumber(*sector));
            }
        }

        self.sectors.extend(sectors.iter().copied());
        self.unproven.extend(sectors.iter().copied());
        Ok(())
    }

    /// Declares a set of sectors faulty. Already faulty sectors are ignored
    /// and recovering sectors are reverted to faulty.
    ///
    /// Returns the sectors that became faulty because of this call.
    /// Filecoin ref: <https://github.com/filecoin-project/builtin-actors/blob/82d02e58f9ef456aeaf2a6c737562ac97b22b244/actors/miner/src/partition_state.rs#L225>
    pub fn record_faults(
        &mut self,
        sector_numbers: &BTreeSet<SectorNumber>,
        height: BlockNumber,
    ) -> Result<BTreeSet<SectorNumber>, PartitionError> {
        self.check_transition(sector_numbers, SectorHealth::Faulty)?;

        let retracted: BTreeSet<_> = self
            .recoveries
            .intersection(sector_numbers)
            .copied()
            .collect();
        if !retracted.is_empty() {
            tracing::debug!(target: LOG_TARGET, ?retracted, "record_faults: recoveries retracted");
            self.recoveries.retain(|sector| !retracted.contains(sector));
        }

        let new_faults: BTreeSet<_> = sector_numbers.difference(&self.faults).copied().collect();
        for sector in &new_faults {
            self.faults.insert(*sector);
            self.unproven.remove(sector);
            self.faulty_since.insert(*sector, height);
        }
        tracing::debug!(target: LOG_TARGET, ?new_faults, height, "record_faults");

        Ok(new_faults)
    }

    /// Marks faulty sectors as recovering.
    /// Sectors that are already recovering are ignored.
    ///
    /// Returns the sectors that started recovering because of this call.
    pub fn declare_faults_recovered(
        &mut self,
        sector_numbers: &BTreeSet<SectorNumber>,
    ) -> Result<BTreeSet<SectorNumber>, PartitionError> {
        self.check_transition(sector_numbers, SectorHealth::Recovering)?;
        if let Some(sector) = sector_numbers.difference(&self.faults).next() {
            tracing::warn!(target: LOG_TARGET, sector, "recovery of a sector that is not faulty");
            return Err(PartitionError::InvalidTransition {
                sector: *sector,
                from: SectorHealth::Active,
                to: SectorHealth::Recovering,
            });
        }

        let new_recoveries: BTreeSet<_> = sector_numbers
            .difference(&self.recoveries)
            .copied()
            .collect();
        self.recoveries.extend(new_recoveries.iter().copied());
        tracing::debug!(target: LOG_TARGET, ?new_recoveries, "declare_faults_recovered");

        Ok(new_recoveries)
    }

    /// Turns the given recovering sectors back into active ones.
    /// Sectors that are not recovering are ignored.
    pub fn recover_declared(&mut self, sector_numbers: &BTreeSet<SectorNumber>) -> BTreeSet<SectorNumber> {
        let recovered: BTreeSet<_> = self
            .recoveries
            .intersection(sector_numbers)
            .copied()
            .collect();
        for sector in &recovered {
            self.recoveries.remove(sector);
            self.faults.remove(sector);
            self.faulty_since.remove(sector);
        }
        recovered
    }

    /// Applies a successful proof over `covered` sectors, except the `skipped` ones.
    ///
    /// Covered recovering sectors become active, covered unproven sectors become proven
    /// and skipped sectors are recorded as faults.
    /// Returns `(recovered, new_faults)`.
    pub fn record_proven(
        &mut self,
        covered: &BTreeSet<SectorNumber>,
        skipped: &BTreeSet<SectorNumber>,
        height: BlockNumber,
    ) -> Result<(BTreeSet<SectorNumber>, BTreeSet<SectorNumber>), PartitionError> {
        let live = self.live_sectors();
        let proven: BTreeSet<_> = covered
            .intersection(&live)
            .filter(|sector| !skipped.contains(sector))
            .copied()
            .collect();
        let skipped: BTreeSet<_> = skipped
            .intersection(covered)
            .filter(|sector| live.contains(sector))
            .copied()
            .collect();

        let recovered = self.recover_declared(&proven);
        self.unproven.retain(|sector| !proven.contains(sector));
        let new_faults = self.record_faults(&skipped, height)?;

        Ok((recovered, new_faults))
    }

    /// Records a missed proof for the `due` sectors.
    /// Terminated sectors and sectors which are already faulty are left as is,
    /// so evaluating the same miss twice records nothing new.
    pub fn record_missed(
        &mut self,
        due: &BTreeSet<SectorNumber>,
        height: BlockNumber,
    ) -> Result<BTreeSet<SectorNumber>, PartitionError> {
        let live = self.live_sectors();
        let missed: BTreeSet<_> = due.intersection(&live).copied().collect();
        self.record_faults(&missed, height)
    }

    /// Terminates live sectors. Terminated sectors stay in `sectors` as tombstones.
    pub fn terminate_sectors(
        &mut self,
        sector_numbers: &BTreeSet<SectorNumber>,
    ) -> Result<(), PartitionError> {
        self.check_transition(sector_numbers, SectorHealth::Terminated)?;

        for sector in sector_numbers {
            self.unproven.remove(sector);
            self.faults.remove(sector);
            self.recoveries.remove(sector);
            self.faulty_since.remove(sector);
            self.terminated.insert(*sector);
        }
        tracing::debug!(target: LOG_TARGET, ?sector_numbers, "terminate_sectors");

        Ok(())
    }

    /// Faulty sectors that have been faulty for longer than `max_age` at `height`.
    pub fn expired_faults(&self, height: BlockNumber, max_age: BlockNumber) -> BTreeSet<SectorNumber> {
        self.faulty_since
            .iter()
            .filter(|(_, since)| height.saturating_sub(**since) > max_age)
            .map(|(sector, _)| *sector)
            .collect()
    }

    /// Every sector must belong to the partition and must not be terminated.
    fn check_transition(
        &self,
        sector_numbers: &BTreeSet<SectorNumber>,
        to: SectorHealth,
    ) -> Result<(), PartitionError> {
        for sector in sector_numbers {
            if !self.sectors.contains(sector) {
                return Err(PartitionError::SectorNotFound(*sector));
            }
            if self.terminated.contains(sector) {
                tracing::warn!(target: LOG_TARGET, sector, %to, "rejected transition of a terminated sector");
                return Err(PartitionError::InvalidTransition {
                    sector: *sector,
                    from: SectorHealth::Terminated,
                    to,
                });
            }
        }
        Ok(())
    }
}
