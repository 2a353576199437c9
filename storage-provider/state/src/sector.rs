use core::fmt;

use primitives_proofs::{BlockNumber, RegisteredSealProof, SectorNumber};
use serde::{Deserialize, Serialize};

/// A committed sector, as tracked by the provider state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorOnChainInfo {
    pub sector_number: SectorNumber,
    /// The seal proof type in effect when the sector was committed.
    /// Never changes for the lifetime of the sector.
    pub seal_proof: RegisteredSealProof,
    /// Height at which the sector was committed.
    pub activation: BlockNumber,
}

impl SectorOnChainInfo {
    pub fn new(
        sector_number: SectorNumber,
        seal_proof: RegisteredSealProof,
        activation: BlockNumber,
    ) -> Self {
        Self {
            sector_number,
            seal_proof,
            activation,
        }
    }
}

/// Health of a committed sector.
///
/// ```text
/// Active -> Faulty          missed proof or declared fault
/// Faulty -> Recovering      recovery declaration
/// Recovering -> Active      proof covering the sector succeeds
/// Recovering -> Faulty      proof covering the sector fails
/// * -> Terminated           explicit termination or expired fault
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SectorHealth {
    Active,
    Faulty,
    Recovering,
    Terminated,
}

impl fmt::Display for SectorHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SectorHealth::Active => "active",
            SectorHealth::Faulty => "faulty",
            SectorHealth::Recovering => "recovering",
            SectorHealth::Terminated => "terminated",
        };
        f.write_str(name)
    }
}
