//! Proving state for storage providers taking part in Window PoSt.
//!
//! Everything in this crate is synchronous and deterministic: given the same
//! sequence of heights and declarations, a [`StorageProviderState`] always
//! ends in the same state. The asynchronous machinery (clock, mining,
//! proof jobs) lives in `storage-provider-scheduler`.

pub mod deadline;
pub mod error;
pub mod fault;
pub mod health;
pub mod index;
pub mod network;
pub mod params;
pub mod partition;
pub mod proofs;
pub mod sector;
pub mod storage_provider;

pub use deadline::{DeadlineInfo, DeadlineSchedule};
pub use error::{
    CapacityLimit, DeadlineError, IndexError, PartitionError, ScheduleMisconfiguration,
    StorageProviderError,
};
pub use fault::{FaultDeclaration, RecoveryDeclaration};
pub use health::SectorHealthTracker;
pub use index::{PartitionIndex, SectorLocation};
pub use network::{NetworkVersion, NetworkVersionEpoch, NetworkVersionGate};
pub use params::ProvingParameters;
pub use partition::Partition;
pub use proofs::{PartitionProofRequest, PoStJob, ProofOutcome};
pub use sector::{SectorHealth, SectorOnChainInfo};
pub use storage_provider::{
    calculate_first_proving_period, AdvanceOutcome, ClosedDeadline, PoStResult,
    StorageProviderInfo, StorageProviderState,
};
