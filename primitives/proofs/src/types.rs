use core::fmt;

/// Chain height, counted in mined blocks (epochs).
pub type BlockNumber = u64;

pub type SectorNumber = u64;

pub type PartitionNumber = u32;

/// Identifier of a storage provider (the miner actor).
pub type ProviderId = u64;

/// Globally unique sector identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct SectorId {
    pub provider: ProviderId,
    pub number: SectorNumber,
}

impl SectorId {
    pub fn new(provider: ProviderId, number: SectorNumber) -> Self {
        Self { provider, number }
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s-t0{}-{}", self.provider, self.number)
    }
}

#[allow(non_camel_case_types)]
#[derive(Debug, Eq, PartialEq, PartialOrd, Ord, Hash, Clone, Copy)]
#[cfg_attr(feature = "clap", derive(::clap::ValueEnum))]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
/// References:
/// * <https://github.com/filecoin-project/rust-filecoin-proofs-api/blob/b44e7cecf2a120aa266b6886628e869ba67252af/src/registry.rs#L18>
pub enum RegisteredSealProof {
    #[cfg_attr(feature = "clap", clap(name = "2KiB-v1"))]
    #[cfg_attr(feature = "serde", serde(alias = "2KiB-v1"))]
    StackedDRG2KiBV1,
    #[cfg_attr(feature = "clap", clap(name = "2KiB"))]
    #[cfg_attr(feature = "serde", serde(alias = "2KiB"))]
    StackedDRG2KiBV1P1,
}

impl RegisteredSealProof {
    pub fn sector_size(&self) -> SectorSize {
        SectorSize::_2KiB
    }

    /// Produces the windowed PoSt-specific RegisteredProof corresponding
    /// to the receiving RegisteredProof.
    pub fn registered_window_post_proof(&self) -> RegisteredPoStProof {
        match self {
            RegisteredSealProof::StackedDRG2KiBV1 => RegisteredPoStProof::StackedDRGWindow2KiBV1,
            RegisteredSealProof::StackedDRG2KiBV1P1 => {
                RegisteredPoStProof::StackedDRGWindow2KiBV1P1
            }
        }
    }
}

impl fmt::Display for RegisteredSealProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisteredSealProof::StackedDRG2KiBV1 => f.write_str("StackedDRG2KiBV1"),
            RegisteredSealProof::StackedDRG2KiBV1P1 => f.write_str("StackedDRG2KiBV1P1"),
        }
    }
}

/// Proof of Spacetime type, indicating version and sector size of the proof.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
#[cfg_attr(feature = "clap", derive(::clap::ValueEnum))]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub enum RegisteredPoStProof {
    #[cfg_attr(feature = "clap", clap(name = "2KiB-v1"))]
    #[cfg_attr(feature = "serde", serde(alias = "2KiB-v1"))]
    StackedDRGWindow2KiBV1,
    #[cfg_attr(feature = "clap", clap(name = "2KiB"))]
    #[cfg_attr(feature = "serde", serde(alias = "2KiB"))]
    StackedDRGWindow2KiBV1P1,
}

impl RegisteredPoStProof {
    /// Returns the sector size of the proof type, which is measured in bytes.
    pub fn sector_size(&self) -> SectorSize {
        match self {
            RegisteredPoStProof::StackedDRGWindow2KiBV1
            | RegisteredPoStProof::StackedDRGWindow2KiBV1P1 => SectorSize::_2KiB,
        }
    }

    /// Returns the partition size, in sectors, associated with a proof type.
    /// The partition size is the number of sectors proven in a single PoSt proof.
    pub fn window_post_partitions_sector(&self) -> u64 {
        match self {
            RegisteredPoStProof::StackedDRGWindow2KiBV1
            | RegisteredPoStProof::StackedDRGWindow2KiBV1P1 => 2,
        }
    }
}

impl fmt::Display for RegisteredPoStProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisteredPoStProof::StackedDRGWindow2KiBV1 => f.write_str("StackedDRGWindow2KiBV1"),
            RegisteredPoStProof::StackedDRGWindow2KiBV1P1 => {
                f.write_str("StackedDRGWindow2KiBV1P1")
            }
        }
    }
}

/// SectorSize indicates one of a set of possible sizes in the network.
#[derive(Clone, Debug, PartialEq, Eq, Copy)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub enum SectorSize {
    _2KiB,
}

impl SectorSize {
    /// Returns the size of a sector in bytes
    /// <https://github.com/filecoin-project/ref-fvm/blob/5659196fa94accdf1e7f10e00586a8166c44a60d/shared/src/sector/mod.rs#L40>
    pub fn bytes(&self) -> u64 {
        match self {
            SectorSize::_2KiB => 2 << 10,
        }
    }
}


// serde_json requires std, so the serialization tests only run with the feature enabled.
#[cfg(all(test, feature = "serde"))]
mod serde_tests {
    use super::{RegisteredPoStProof, RegisteredSealProof};

    #[test]
    fn ensure_serde_for_registered_seal_proof() {
        assert_eq!(
            serde_json::from_str::<RegisteredSealProof>(r#""2KiB""#).unwrap(),
            RegisteredSealProof::StackedDRG2KiBV1P1
        );
        assert_eq!(
            serde_json::from_str::<RegisteredSealProof>(r#""2KiB-v1""#).unwrap(),
            RegisteredSealProof::StackedDRG2KiBV1
        );
        assert_eq!(
            serde_json::from_str::<RegisteredSealProof>(r#""StackedDRG2KiBV1P1""#).unwrap(),
            RegisteredSealProof::StackedDRG2KiBV1P1
        );
    }

    #[test]
    fn ensure_serde_for_registered_post_proof() {
        assert_eq!(
            serde_json::from_str::<RegisteredPoStProof>(r#""2KiB""#).unwrap(),
            RegisteredPoStProof::StackedDRGWindow2KiBV1P1
        );
        assert_eq!(
            serde_json::from_str::<RegisteredPoStProof>(r#""StackedDRGWindow2KiBV1""#).unwrap(),
            RegisteredPoStProof::StackedDRGWindow2KiBV1
        );
    }
}
