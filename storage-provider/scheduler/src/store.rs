use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};

use primitives_proofs::{PartitionNumber, ProviderId, RegisteredSealProof, SectorId};
use storage_provider_state::{Partition, SectorHealth, SectorLocation, SectorOnChainInfo};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("sector {0} was never committed")]
    NotCommitted(SectorId),
    #[error("sector {sector} was committed with {committed}, got {proof_type}")]
    ProofTypeMismatch {
        sector: SectorId,
        committed: RegisteredSealProof,
        proof_type: RegisteredSealProof,
    },
}

/// Last recorded state of a sector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorState {
    pub info: SectorOnChainInfo,
    pub health: SectorHealth,
    /// `None` once terminated.
    pub location: Option<SectorLocation>,
}

/// Chain state persistence, written through by the coordinator.
pub trait ChainStateStore: Send + Sync {
    /// Records the commitment of a sector with its immutable proof type.
    fn commit_sector(&self, sector: SectorId, proof_type: RegisteredSealProof) -> Result<(), StoreError> {
        self.commit_sectors(&[sector], proof_type)
    }

    /// Records the commitment of several sectors. Either all are recorded or none is.
    fn commit_sectors(&self, sectors: &[SectorId], proof_type: RegisteredSealProof) -> Result<(), StoreError>;

    fn write_sector_state(&self, sector: SectorId, state: SectorState) -> Result<(), StoreError>;

    fn read_sector_state(&self, sector: SectorId) -> Result<Option<SectorState>, StoreError>;

    fn write_partitions(
        &self,
        provider: ProviderId,
        deadline: u64,
        partitions: BTreeMap<PartitionNumber, Partition>,
    ) -> Result<(), StoreError>;

    fn read_partitions(
        &self,
        provider: ProviderId,
        deadline: u64,
    ) -> Result<BTreeMap<PartitionNumber, Partition>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryChainStore {
    committed: RwLock<BTreeMap<SectorId, RegisteredSealProof>>,
    sectors: RwLock<BTreeMap<SectorId, SectorState>>,
    partitions: RwLock<BTreeMap<(ProviderId, u64), BTreeMap<PartitionNumber, Partition>>>,
}

impl InMemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChainStateStore for InMemoryChainStore {
    fn commit_sectors(&self, sectors: &[SectorId], proof_type: RegisteredSealProof) -> Result<(), StoreError> {
        let mut committed = self.committed.write().unwrap_or_else(PoisonError::into_inner);
        for sector in sectors {
            match committed.get(sector) {
                Some(existing) if *existing != proof_type => {
                    return Err(StoreError::ProofTypeMismatch {
                        sector: *sector,
                        committed: *existing,
                        proof_type,
                    })
                }
                _ => {}
            }
        }
        committed.extend(sectors.iter().map(|sector| (*sector, proof_type)));
        Ok(())
    }

    fn write_sector_state(&self, sector: SectorId, state: SectorState) -> Result<(), StoreError> {
        let committed = self
            .committed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&sector)
            .copied()
            .ok_or(StoreError::NotCommitted(sector))?;
        if committed != state.info.seal_proof {
            return Err(StoreError::ProofTypeMismatch {
                sector,
                committed,
                proof_type: state.info.seal_proof,
            });
        }
        self.sectors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sector, state);
        Ok(())
    }

    fn read_sector_state(&self, sector: SectorId) -> Result<Option<SectorState>, StoreError> {
        Ok(self
            .sectors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&sector)
            .cloned())
    }

    fn write_partitions(
        &self,
        provider: ProviderId,
        deadline: u64,
        partitions: BTreeMap<PartitionNumber, Partition>,
    ) -> Result<(), StoreError> {
        self.partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((provider, deadline), partitions);
        Ok(())
    }

    fn read_partitions(
        &self,
        provider: ProviderId,
        deadline: u64,
    ) -> Result<BTreeMap<PartitionNumber, Partition>, StoreError> {
        Ok(self
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(provider, deadline))
            .cloned()
            .unwrap_or_default())
    }
}
