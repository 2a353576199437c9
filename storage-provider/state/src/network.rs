use core::fmt;

use primitives_proofs::{BlockNumber, RegisteredPoStProof, RegisteredSealProof};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleMisconfiguration;

/// Protocol version of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkVersion(pub u32);

impl NetworkVersion {
    pub const V6: Self = Self(6);
    pub const V7: Self = Self(7);
    pub const V8: Self = Self(8);
    pub const V9: Self = Self(9);
}

impl fmt::Display for NetworkVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A network upgrade: from `activation` on, `version` is in effect and new
/// obligations use the given proof types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkVersionEpoch {
    pub activation: BlockNumber,
    pub version: NetworkVersion,
    pub seal_proof: RegisteredSealProof,
    pub post_proof: RegisteredPoStProof,
}

/// Height-keyed upgrade schedule.
///
/// Activations and versions are strictly increasing. Heights before the first
/// activation resolve to the first entry (the genesis version).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<NetworkVersionEpoch>", into = "Vec<NetworkVersionEpoch>")]
pub struct NetworkVersionGate {
    epochs: Vec<NetworkVersionEpoch>,
}

impl NetworkVersionGate {
    pub fn new(epochs: Vec<NetworkVersionEpoch>) -> Result<Self, ScheduleMisconfiguration> {
        if epochs.is_empty() {
            return Err(ScheduleMisconfiguration::EmptyUpgradeSchedule);
        }
        for pair in epochs.windows(2) {
            let (previous, next) = (&pair[0], &pair[1]);
            if next.activation <= previous.activation {
                return Err(ScheduleMisconfiguration::NonMonotonicActivation {
                    height: next.activation,
                    previous: previous.activation,
                });
            }
            if next.version <= previous.version {
                return Err(ScheduleMisconfiguration::NonMonotonicVersion {
                    version: next.version.0,
                    previous: previous.version.0,
                });
            }
        }
        Ok(Self { epochs })
    }

    /// A schedule that never upgrades.
    pub fn single(
        version: NetworkVersion,
        seal_proof: RegisteredSealProof,
        post_proof: RegisteredPoStProof,
    ) -> Self {
        Self {
            epochs: vec![NetworkVersionEpoch {
                activation: 0,
                version,
                seal_proof,
                post_proof,
            }],
        }
    }

    /// Appends an upgrade to the end of the schedule.
    pub fn push(&mut self, epoch: NetworkVersionEpoch) -> Result<(), ScheduleMisconfiguration> {
        let mut epochs = self.epochs.clone();
        epochs.push(epoch);
        *self = Self::new(epochs)?;
        Ok(())
    }

    pub fn epochs(&self) -> &[NetworkVersionEpoch] {
        &self.epochs
    }

    /// The upgrade in effect at `height`: the latest one activated at or before it.
    pub fn epoch_at(&self, height: BlockNumber) -> &NetworkVersionEpoch {
        let idx = self
            .epochs
            .partition_point(|epoch| epoch.activation <= height);
        // `epochs` is never empty
        &self.epochs[idx.saturating_sub(1)]
    }

    pub fn version_at(&self, height: BlockNumber) -> NetworkVersion {
        self.epoch_at(height).version
    }

    /// Seal proof type for sectors committed at `height`.
    pub fn proof_type_at(&self, height: BlockNumber) -> RegisteredSealProof {
        self.epoch_at(height).seal_proof
    }

    /// Window PoSt proof type for deadlines challenged at `height`.
    pub fn post_proof_at(&self, height: BlockNumber) -> RegisteredPoStProof {
        self.epoch_at(height).post_proof
    }
}

impl TryFrom<Vec<NetworkVersionEpoch>> for NetworkVersionGate {
    type Error = ScheduleMisconfiguration;

    fn try_from(value: Vec<NetworkVersionEpoch>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NetworkVersionGate> for Vec<NetworkVersionEpoch> {
    fn from(value: NetworkVersionGate) -> Self {
        value.epochs
    }
}
