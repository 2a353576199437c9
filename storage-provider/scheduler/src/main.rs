//! Runs a local proving devnet: a mining loop, a mock proving backend and the
//! proving coordinator, with storage providers pledging sectors at genesis.
#![deny(clippy::unwrap_used)]

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use primitives_proofs::{BlockNumber, ProviderId, RegisteredSealProof, SectorId, SectorSize};
use serde::Serialize;
use storage_provider_scheduler::{
    AlwaysProduce, CoordinatorConfig, CoordinatorError, EpochClock, InMemoryChainStore,
    MiningConfig, MiningError, MiningLoop, MockProvingBackend, OnBlockError, OverflowPolicy,
    ProvingCoordinator,
};
use storage_provider_state::{
    params::{DEFAULT_PERIOD_DEADLINES, DEFAULT_PROVING_PERIOD},
    NetworkVersion, NetworkVersionGate, ProvingParameters, ScheduleMisconfiguration, SectorHealth,
};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// First provider id handed out by the devnet.
const FIRST_PROVIDER: ProviderId = 1000;

fn main() -> Result<(), DevnetError> {
    // Logger initialization.
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .init();

    let configuration: DevnetConfiguration = DevnetArguments::parse().try_into()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(configuration.run())
}

#[derive(Debug, thiserror::Error)]
pub enum DevnetError {
    #[error("FromEnv error: {0}")]
    EnvFilter(#[from] tracing_subscriber::filter::FromEnvError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid upgrade schedule: {0}")]
    Json(#[from] serde_json::Error),

    #[error("the block time must be at least 1ms")]
    ZeroBlockTime,

    #[error(transparent)]
    Misconfiguration(#[from] ScheduleMisconfiguration),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Mining(#[from] MiningError),

    #[error(transparent)]
    Join(#[from] JoinError),
}

/// Command line arguments of the devnet.
#[derive(Debug, Clone, Parser)]
#[command(version, about)]
struct DevnetArguments {
    /// Time between two blocks, in milliseconds.
    #[arg(long, default_value_t = 100)]
    block_time: u64,

    /// Length of a proving period, in blocks.
    #[arg(long, default_value_t = DEFAULT_PROVING_PERIOD)]
    proving_period: BlockNumber,

    /// Number of deadlines in a proving period.
    #[arg(long, default_value_t = DEFAULT_PERIOD_DEADLINES)]
    period_deadlines: u64,

    /// Blocks between drawing a deadline's challenge and its close.
    /// Defaults to the whole deadline.
    #[arg(long)]
    challenge_offset: Option<BlockNumber>,

    /// Maximum number of sectors in a partition.
    #[arg(long, default_value_t = 2)]
    partition_size: u64,

    /// Number of storage providers.
    #[arg(long, default_value_t = 1)]
    providers: u64,

    /// Number of sectors each provider pledges at genesis.
    #[arg(long, default_value_t = 10)]
    sectors: u64,

    /// JSON file with the network upgrade schedule.
    #[arg(long)]
    upgrade_schedule: Option<PathBuf>,

    /// Seal proof of every sector when no upgrade schedule is given.
    #[arg(long, value_enum, default_value_t = RegisteredSealProof::StackedDRG2KiBV1P1)]
    seal_proof: RegisteredSealProof,

    /// What to do when a block cannot be produced.
    #[arg(long, value_enum, default_value_t = OnBlockError::Continue)]
    on_block_error: OnBlockError,

    /// What to do when a height subscriber falls behind.
    #[arg(long, value_enum, default_value_t = OverflowPolicy::DropOldest)]
    overflow_policy: OverflowPolicy,

    /// Accept proofs without verifying them.
    #[arg(long)]
    insecure_proofs: bool,

    /// Stop once this height is reached.
    #[arg(long)]
    until: Option<BlockNumber>,
}

/// Validated devnet configuration.
#[derive(Debug)]
struct DevnetConfiguration {
    params: ProvingParameters,
    gate: NetworkVersionGate,
    mining: MiningConfig,
    coordinator: CoordinatorConfig,
    providers: u64,
    sectors: u64,
    validate_proofs: bool,
    until: Option<BlockNumber>,
}

impl TryFrom<DevnetArguments> for DevnetConfiguration {
    type Error = DevnetError;

    fn try_from(value: DevnetArguments) -> Result<Self, Self::Error> {
        if value.block_time == 0 {
            return Err(DevnetError::ZeroBlockTime);
        }
        let defaults = ProvingParameters::default();
        let window = value.proving_period / value.period_deadlines.max(1);
        let params = ProvingParameters {
            w_post_proving_period: value.proving_period,
            w_post_period_deadlines: value.period_deadlines,
            w_post_challenge_offset: value.challenge_offset.unwrap_or(window),
            partition_size: value.partition_size,
            fault_max_age: 3 * value.proving_period,
            ..defaults
        };
        params.validate()?;

        let gate = match value.upgrade_schedule {
            Some(path) => serde_json::from_slice(&std::fs::read(path)?)?,
            None => NetworkVersionGate::single(
                NetworkVersion::V7,
                value.seal_proof,
                value.seal_proof.registered_window_post_proof(),
            ),
        };

        let block_time = Duration::from_millis(value.block_time);
        Ok(Self {
            params,
            gate,
            mining: MiningConfig {
                block_time,
                on_error: value.on_block_error,
                overflow_policy: value.overflow_policy,
                ..Default::default()
            },
            coordinator: CoordinatorConfig::for_block_time(block_time, &params),
            providers: value.providers,
            sectors: value.sectors,
            validate_proofs: !value.insecure_proofs,
            until: value.until,
        })
    }
}

/// Summary of a provider, printed when the devnet stops.
#[derive(Debug, Serialize)]
struct ProviderReport {
    provider: ProviderId,
    power: u64,
    active: usize,
    faulty: usize,
    recovering: usize,
    terminated: usize,
}

impl DevnetConfiguration {
    async fn run(self) -> Result<(), DevnetError> {
        let cancellation_token = CancellationToken::new();

        let clock = Arc::new(EpochClock::new(0));
        let mining = Arc::new(MiningLoop::new(clock, Arc::new(AlwaysProduce), self.mining));
        let coordinator = Arc::new(ProvingCoordinator::new(
            self.params,
            self.gate,
            Arc::new(MockProvingBackend::new(self.validate_proofs)),
            Arc::new(InMemoryChainStore::new()),
            mining.chain_head(),
            self.coordinator,
            cancellation_token.child_token(),
        )?);

        let providers: Vec<ProviderId> = (0..self.providers).map(|i| FIRST_PROVIDER + i).collect();
        let sectors: Vec<_> = (0..self.sectors).collect();
        for (i, provider) in providers.iter().enumerate() {
            // stagger the providers' proving periods
            let offset = (i as u64 * self.params.challenge_window()) % self.params.w_post_proving_period;
            coordinator.register_provider(*provider, SectorSize::_2KiB, offset)?;
            coordinator.commit_sectors(*provider, &sectors).await?;
        }

        let heights = mining.subscribe();
        let coordinator_task = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run(heights).await }
        });
        let mut mining_handle = mining.clone().start(cancellation_token.child_token())?;

        let head = mining.chain_head();
        let until = self.until;
        let target_reached = async move {
            match until {
                Some(height) => {
                    head.wait_for_height(height).await;
                }
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Ctrl-C received, shutting down...");
            }
            () = target_reached => tracing::info!(?until, "target height reached"),
            () = mining_handle.stopped() => tracing::warn!("mining stopped on its own"),
        }

        cancellation_token.cancel();
        tracing::info!("sent shutdown signal");

        let mining_result = mining_handle
            .stop()
            .await
            .inspect_err(|err| tracing::error!(%err));
        coordinator.shutdown().await;
        coordinator_task
            .await
            .inspect_err(|err| tracing::error!(%err))?;

        for provider in providers {
            let report = report(&coordinator, provider, &sectors).await?;
            println!("{}", serde_json::to_string(&report)?);
        }

        Ok(mining_result?)
    }
}

async fn report(
    coordinator: &ProvingCoordinator,
    provider: ProviderId,
    sectors: &[u64],
) -> Result<ProviderReport, DevnetError> {
    let mut report = ProviderReport {
        provider,
        power: coordinator.power(provider).await?,
        active: 0,
        faulty: 0,
        recovering: 0,
        terminated: 0,
    };
    for sector in sectors {
        match coordinator.sector_health(SectorId::new(provider, *sector)).await {
            Some(SectorHealth::Active) => report.active += 1,
            Some(SectorHealth::Faulty) => report.faulty += 1,
            Some(SectorHealth::Recovering) => report.recovering += 1,
            Some(SectorHealth::Terminated) => report.terminated += 1,
            None => {}
        }
    }
    Ok(report)
}
