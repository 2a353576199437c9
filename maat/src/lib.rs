//! In-process devnet used by the end-to-end scenarios.
//!
//! A [`Devnet`] wires a mining loop, a mock proving backend, an in-memory chain
//! store and the proving coordinator together. Scenarios run under tokio's
//! paused clock, so the outcome depends on block heights only.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use primitives_proofs::{
    BlockNumber, ProviderId, RegisteredPoStProof, RegisteredSealProof, SectorNumber, SectorSize,
};
use storage_provider_scheduler::{
    AlwaysProduce, BlockProducer, ChainHead, CoordinatorConfig, EpochClock, InMemoryChainStore,
    MiningConfig, MiningHandle, MiningLoop, MockProvingBackend, ProvingCoordinator,
};
use storage_provider_state::{NetworkVersion, NetworkVersionGate, ProvingParameters, SectorLocation};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Id of the first provider registered by [`Devnet::register_provider`].
pub const FIRST_PROVIDER: ProviderId = 1000;

/// Installs a `DEBUG` subscriber; later calls are no-ops.
pub fn setup_logging() {
    let Ok(env_filter) = EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .from_env()
    else {
        return;
    };

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .try_init();
}

pub struct DevnetBuilder {
    params: ProvingParameters,
    gate: NetworkVersionGate,
    mining: MiningConfig,
    coordinator: Option<CoordinatorConfig>,
    producer: Arc<dyn BlockProducer>,
    backend: MockProvingBackend,
}

impl Default for DevnetBuilder {
    fn default() -> Self {
        let gate = NetworkVersionGate::single(
            NetworkVersion::V7,
            RegisteredSealProof::StackedDRG2KiBV1P1,
            RegisteredPoStProof::StackedDRGWindow2KiBV1P1,
        );
        Self {
            params: ProvingParameters::default(),
            gate,
            mining: MiningConfig::default(),
            coordinator: None,
            producer: Arc::new(AlwaysProduce),
            backend: MockProvingBackend::new(true),
        }
    }
}

impl DevnetBuilder {
    pub fn params(mut self, params: ProvingParameters) -> Self {
        self.params = params;
        self
    }

    pub fn upgrade_schedule(mut self, gate: NetworkVersionGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn mining(mut self, mining: MiningConfig) -> Self {
        self.mining = mining;
        self
    }

    pub fn block_time(mut self, block_time: Duration) -> Self {
        self.mining.block_time = block_time;
        self
    }

    pub fn coordinator(mut self, coordinator: CoordinatorConfig) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn producer(mut self, producer: Arc<dyn BlockProducer>) -> Self {
        self.producer = producer;
        self
    }

    pub fn backend(mut self, backend: MockProvingBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Assembles the devnet at genesis. Nothing runs until [`Devnet::start`].
    pub fn build(self) -> Devnet {
        let token = CancellationToken::new();
        let clock = Arc::new(EpochClock::new(0));
        let mining = Arc::new(MiningLoop::new(clock, self.producer, self.mining));
        let backend = Arc::new(self.backend);
        let store = Arc::new(InMemoryChainStore::new());
        let coordinator_config = match self.coordinator {
            Some(config) => config,
            None => CoordinatorConfig::for_block_time(self.mining.block_time, &self.params),
        };
        let coordinator = Arc::new(
            ProvingCoordinator::new(
                self.params,
                self.gate,
                backend.clone(),
                store.clone(),
                mining.chain_head(),
                coordinator_config,
                token.child_token(),
            )
            .expect("devnet parameters should be valid"),
        );

        // Subscribe before anything is mined so that no height is missed.
        let heights = mining.subscribe();
        let coordinator_task = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(heights).await }
        });

        Devnet {
            mining,
            coordinator,
            backend,
            store,
            token,
            mining_handle: None,
            coordinator_task,
            next_sector: Mutex::new(BTreeMap::new()),
        }
    }
}

pub struct Devnet {
    pub mining: Arc<MiningLoop>,
    pub coordinator: Arc<ProvingCoordinator>,
    pub backend: Arc<MockProvingBackend>,
    pub store: Arc<InMemoryChainStore>,
    token: CancellationToken,
    mining_handle: Option<MiningHandle>,
    coordinator_task: JoinHandle<()>,
    next_sector: Mutex<BTreeMap<ProviderId, SectorNumber>>,
}

impl Devnet {
    pub fn builder() -> DevnetBuilder {
        DevnetBuilder::default()
    }

    /// Starts the mining loop.
    pub fn start(&mut self) {
        let handle = self
            .mining
            .clone()
            .start(self.token.child_token())
            .expect("the mining loop should only be started once");
        self.mining_handle = Some(handle);
    }

    pub fn head(&self) -> ChainHead {
        self.mining.chain_head()
    }

    pub fn height(&self) -> BlockNumber {
        self.head().current()
    }

    /// Waits until the coordinator has evaluated `height` and every proof
    /// started so far has been applied.
    pub async fn wait_for_height(&self, height: BlockNumber) {
        self.coordinator
            .processed()
            .wait_for_height(height)
            .await
            .expect("the coordinator should be running");
        self.coordinator.wait_idle().await;
    }

    /// Mines blocks by hand until `height`, waiting for the coordinator on each.
    pub async fn mine_until(&self, height: BlockNumber) {
        while self.height() < height {
            let mined = self
                .mining
                .mine_one()
                .await
                .expect("block production should succeed");
            self.wait_for_height(mined).await;
        }
    }

    /// Registers provider number `n` (starting at 0), with a 2KiB sector size.
    pub fn register_provider(&self, n: u64, period_offset: BlockNumber) -> ProviderId {
        let provider = FIRST_PROVIDER + n;
        self.coordinator
            .register_provider(provider, SectorSize::_2KiB, period_offset)
            .expect("provider should register");
        provider
    }

    /// Pledges `count` new sectors, numbered after the provider's previous ones.
    pub async fn pledge_sectors(&self, provider: ProviderId, count: u64) -> Vec<SectorNumber> {
        let sectors: Vec<_> = {
            let mut next_sector = self.next_sector.lock().await;
            let next = next_sector.entry(provider).or_default();
            let sectors = (*next..*next + count).collect();
            *next += count;
            sectors
        };
        let locations = self
            .coordinator
            .commit_sectors(provider, &sectors)
            .await
            .expect("sectors should be committed");
        tracing::debug!(provider, ?sectors, ?locations, "pledged sectors");
        sectors
    }

    /// Location of every live sector of `provider`.
    pub async fn sector_locations(
        &self,
        provider: ProviderId,
    ) -> BTreeMap<SectorLocation, Vec<SectorNumber>> {
        let mut locations: BTreeMap<SectorLocation, Vec<SectorNumber>> = BTreeMap::new();
        for deadline in 0..self.coordinator.params().w_post_period_deadlines {
            let partitions = self
                .coordinator
                .partitions(provider, deadline)
                .await
                .expect("provider should be registered");
            for (partition, content) in partitions {
                let live = content.live_sectors();
                if !live.is_empty() {
                    let location = SectorLocation { deadline, partition };
                    locations.insert(location, live.into_iter().collect());
                }
            }
        }
        locations
    }

    /// Stops mining and proving.
    pub async fn stop(self) {
        self.token.cancel();
        if let Some(handle) = self.mining_handle {
            let _ = handle.stop().await;
        }
        self.coordinator.shutdown().await;
        let _ = self.coordinator_task.await;
    }
}
