//! Asynchronous side of the Window PoSt scheduler.
//!
//! A [`MiningLoop`] advances the [`EpochClock`] and publishes every new height.
//! The [`ProvingCoordinator`] follows those heights, asks a [`ProvingBackend`]
//! for the proofs that fall due and feeds the outcome back into each
//! provider's [`storage_provider_state::StorageProviderState`].
#![deny(clippy::unwrap_used)]

pub mod backend;
pub mod clock;
pub mod coordinator;
pub mod events;
pub mod mining;
pub mod store;

pub use backend::{MockProvingBackend, ProofRequest, ProvingBackend, ProvingError};
pub use clock::{EpochClock, TimeSource, TokioTimeSource};
pub use coordinator::{CoordinatorConfig, CoordinatorError, ProvingCoordinator};
pub use events::{ChainHead, HeightPublisher, HeightSubscription, OverflowPolicy};
pub use mining::{
    AlwaysProduce, BlockProducer, BlockProductionError, MiningConfig, MiningError, MiningHandle,
    MiningLoop, MiningState, OnBlockError,
};
pub use store::{ChainStateStore, InMemoryChainStore, SectorState, StoreError};
