use std::collections::{BTreeMap, BTreeSet};

use primitives_proofs::{PartitionNumber, SectorNumber};
use serde::{Deserialize, Serialize};

use crate::{
    deadline::{assign_deadlines, Deadline, Deadlines},
    error::{CapacityLimit, DeadlineError, IndexError},
    params::ProvingParameters,
    partition::Partition,
};

const LOG_TARGET: &str = "storage_provider::index";

/// Where a sector is proven: a deadline index and a partition within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectorLocation {
    pub deadline: u64,
    pub partition: PartitionNumber,
}

/// Maps sectors to `(deadline, partition)` slots.
///
/// Slots are never reused: removing a sector leaves a tombstone in its partition,
/// so the indices of its siblings never change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionIndex {
    deadlines: Deadlines,
    locations: BTreeMap<SectorNumber, SectorLocation>,
    partition_size: u64,
    max_partitions_per_deadline: u64,
    max_sectors: u64,
}

impl PartitionIndex {
    pub fn new(params: &ProvingParameters) -> Self {
        Self {
            deadlines: Deadlines::new(params.w_post_period_deadlines),
            locations: BTreeMap::new(),
            partition_size: params.partition_size,
            max_partitions_per_deadline: params.max_partitions_per_deadline,
            max_sectors: params.max_sectors,
        }
    }

    /// Number of sectors currently assigned (terminated sectors excluded).
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn deadline_count(&self) -> u64 {
        self.deadlines.len() as u64
    }

    /// Assigns a single sector to any deadline.
    pub fn assign(&mut self, sector: SectorNumber) -> Result<SectorLocation, IndexError> {
        let eligible = vec![true; self.deadlines.len()];
        let locations = self.assign_to_mutable(&[sector], &eligible)?;
        // one sector in, one location out
        locations
            .into_iter()
            .next()
            .ok_or(IndexError::Deadline(DeadlineError::CouldNotAssignSectorsToDeadlines))
    }

    /// Assigns sectors to the deadlines flagged in `mutable`.
    ///
    /// Either every sector is assigned or none is. Returns the location of every
    /// sector, in input order.
    pub fn assign_to_mutable(
        &mut self,
        sectors: &[SectorNumber],
        mutable: &[bool],
    ) -> Result<Vec<SectorLocation>, IndexError> {
        let mut seen = BTreeSet::new();
        for sector in sectors {
            if self.locations.contains_key(sector) || self.is_tombstone(*sector) || !seen.insert(*sector) {
                return Err(IndexError::SectorNumberInUse(*sector));
            }
        }
        if self.locations.len() as u64 + sectors.len() as u64 > self.max_sectors {
            tracing::warn!(target: LOG_TARGET, max_sectors = self.max_sectors, "sector cap reached");
            return Err(IndexError::CapacityExceeded(CapacityLimit::Sectors(
                self.max_sectors,
            )));
        }

        let eligible: Vec<Option<&Deadline>> = self
            .deadlines
            .due
            .iter()
            .enumerate()
            .map(|(idx, dl)| mutable.get(idx).copied().unwrap_or(false).then_some(dl))
            .collect();
        let assignment = match assign_deadlines(
            self.max_partitions_per_deadline,
            self.partition_size,
            &eligible,
            sectors,
        ) {
            Ok(assignment) => assignment,
            Err(DeadlineError::MaxPartitionsReached { max_partitions, .. }) => {
                tracing::warn!(target: LOG_TARGET, max_partitions, "partition cap reached");
                return Err(IndexError::CapacityExceeded(
                    CapacityLimit::PartitionsPerDeadline(max_partitions),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        let mut placed = BTreeMap::new();
        for (deadline_idx, deadline_sectors) in assignment.into_iter().enumerate() {
            if deadline_sectors.is_empty() {
                continue;
            }
            let deadline_idx = deadline_idx as u64;
            let partitions = self.deadlines.load_deadline_mut(deadline_idx)?.add_sectors(
                deadline_idx,
                self.partition_size,
                self.max_partitions_per_deadline,
                &deadline_sectors,
            )?;
            for (sector, partition) in deadline_sectors.into_iter().zip(partitions) {
                let location = SectorLocation {
                    deadline: deadline_idx,
                    partition,
                };
                self.locations.insert(sector, location);
                placed.insert(sector, location);
            }
        }
        tracing::debug!(target: LOG_TARGET, ?placed, "assigned sectors");

        sectors
            .iter()
            .map(|sector| {
                placed
                    .get(sector)
                    .copied()
                    .ok_or(IndexError::SectorNotFound(*sector))
            })
            .collect()
    }

    /// Removes a sector, leaving a tombstone in its partition.
    pub fn remove(&mut self, sector: SectorNumber) -> Result<SectorLocation, IndexError> {
        let location = self
            .locations
            .get(&sector)
            .copied()
            .ok_or(IndexError::SectorNotFound(sector))?;

        let deadline = self.deadlines.load_deadline_mut(location.deadline)?;
        deadline
            .load_partition_mut(location.deadline, location.partition)?
            .terminate_sectors(&BTreeSet::from([sector]))?;
        deadline.live_sectors -= 1;
        self.locations.remove(&sector);
        tracing::debug!(target: LOG_TARGET, sector, ?location, "removed sector");

        Ok(location)
    }

    /// Location of a live sector, `None` for unknown or removed sectors.
    pub fn location(&self, sector: SectorNumber) -> Option<SectorLocation> {
        self.locations.get(&sector).copied()
    }

    pub fn deadline(&self, deadline: u64) -> Result<&Deadline, IndexError> {
        Ok(self.deadlines.load_deadline(deadline)?)
    }

    pub fn partitions_for(&self, deadline: u64) -> Result<&BTreeMap<PartitionNumber, Partition>, IndexError> {
        Ok(&self.deadlines.load_deadline(deadline)?.partitions)
    }

    pub fn partition(&self, location: SectorLocation) -> Result<&Partition, IndexError> {
        Ok(self
            .deadlines
            .load_deadline(location.deadline)?
            .load_partition(location.deadline, location.partition)?)
    }

    pub(crate) fn partition_mut(&mut self, location: SectorLocation) -> Result<&mut Partition, IndexError> {
        Ok(self
            .deadlines
            .load_deadline_mut(location.deadline)?
            .load_partition_mut(location.deadline, location.partition)?)
    }

    /// Iterates over every partition of every deadline.
    pub fn iter_partitions(&self) -> impl Iterator<Item = (SectorLocation, &Partition)> {
        self.deadlines
            .due
            .iter()
            .enumerate()
            .flat_map(|(deadline, dl)| {
                dl.partitions.iter().map(move |(partition, p)| {
                    (
                        SectorLocation {
                            deadline: deadline as u64,
                            partition: *partition,
                        },
                        p,
                    )
                })
            })
    }

    fn is_tombstone(&self, sector: SectorNumber) -> bool {
        self.iter_partitions()
            .any(|(_, partition)| partition.terminated.contains(&sector))
    }
}
