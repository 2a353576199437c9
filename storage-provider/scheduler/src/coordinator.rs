use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex as StdMutex, PoisonError, RwLock},
    time::Duration,
};

use backon::{ExponentialBuilder, Retryable as _};
use primitives_proofs::{
    BlockNumber, PartitionNumber, ProviderId, RegisteredPoStProof, RegisteredSealProof, SectorId,
    SectorNumber, SectorSize,
};
use serde::{Deserialize, Serialize};
use storage_provider_state::{
    calculate_first_proving_period, DeadlineInfo, FaultDeclaration, NetworkVersionGate,
    Partition, PoStJob, ProofOutcome, ProvingParameters, RecoveryDeclaration,
    ScheduleMisconfiguration, SectorHealth, SectorLocation, SectorOnChainInfo,
    StorageProviderError, StorageProviderInfo, StorageProviderState,
};
use tokio::sync::{watch, Mutex};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    backend::{ProvingBackend, ProvingError},
    events::{ChainHead, HeightSubscription},
    mining::DEFAULT_BLOCK_TIME,
    store::{ChainStateStore, SectorState, StoreError},
};

const LOG_TARGET: &str = "scheduler::coordinator";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("provider {0} is already registered")]
    ProviderExists(ProviderId),
    #[error("provider {0} is not registered")]
    UnknownProvider(ProviderId),
    #[error(transparent)]
    StorageProvider(#[from] StorageProviderError),
    #[error(transparent)]
    Misconfiguration(#[from] ScheduleMisconfiguration),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Time allowed for a single proof, retries included.
    pub proof_timeout: Duration,
    pub retry_min_delay: Duration,
    pub retry_max_delay: Duration,
}

impl CoordinatorConfig {
    /// Gives each proof one challenge window worth of blocks.
    pub fn for_block_time(block_time: Duration, params: &ProvingParameters) -> Self {
        let window = u32::try_from(params.challenge_window()).unwrap_or(u32::MAX);
        Self {
            proof_timeout: block_time.saturating_mul(window),
            retry_min_delay: block_time / 10,
            retry_max_delay: block_time,
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        let min_delay = self.retry_min_delay.max(Duration::from_millis(1));
        let max_times = self.proof_timeout.as_millis() / min_delay.as_millis();
        ExponentialBuilder::default()
            .with_min_delay(min_delay)
            .with_max_delay(self.retry_max_delay.max(min_delay))
            .with_max_times(usize::try_from(max_times).unwrap_or(usize::MAX).max(1))
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::for_block_time(DEFAULT_BLOCK_TIME, &ProvingParameters::default())
    }
}

type ProviderHandle = Arc<Mutex<StorageProviderState>>;

/// Identifies a proof job: provider, deadline index and the open height of the instance.
type JobKey = (ProviderId, u64, BlockNumber);

/// Drives Window PoSt for every registered provider.
///
/// Each provider's state sits behind its own lock: heights are evaluated
/// concurrently across providers and serially for a single one. Proofs are
/// generated without holding any lock; their outcome is applied afterwards.
pub struct ProvingCoordinator {
    params: ProvingParameters,
    gate: NetworkVersionGate,
    backend: Arc<dyn ProvingBackend>,
    store: Arc<dyn ChainStateStore>,
    config: CoordinatorConfig,
    /// Height of the chain, used to date commitments, declarations and proofs.
    head: ChainHead,
    providers: RwLock<BTreeMap<ProviderId, ProviderHandle>>,
    jobs: StdMutex<BTreeMap<JobKey, CancellationToken>>,
    in_flight: Arc<watch::Sender<usize>>,
    tracker: TaskTracker,
    token: CancellationToken,
    processed: watch::Sender<BlockNumber>,
}

impl ProvingCoordinator {
    pub fn new(
        params: ProvingParameters,
        gate: NetworkVersionGate,
        backend: Arc<dyn ProvingBackend>,
        store: Arc<dyn ChainStateStore>,
        head: ChainHead,
        config: CoordinatorConfig,
        token: CancellationToken,
    ) -> Result<Self, ScheduleMisconfiguration> {
        params.validate()?;
        let (processed, _) = watch::channel(head.current());
        let (in_flight, _) = watch::channel(0);
        Ok(Self {
            params,
            gate,
            backend,
            store,
            config,
            head,
            providers: RwLock::new(BTreeMap::new()),
            jobs: StdMutex::new(BTreeMap::new()),
            in_flight: Arc::new(in_flight),
            tracker: TaskTracker::new(),
            token,
            processed,
        })
    }

    pub fn params(&self) -> &ProvingParameters {
        &self.params
    }

    pub fn gate(&self) -> &NetworkVersionGate {
        &self.gate
    }

    /// Registers a provider at the current height, returns its first proving period start.
    pub fn register_provider(
        &self,
        provider: ProviderId,
        sector_size: SectorSize,
        period_offset: BlockNumber,
    ) -> Result<BlockNumber, CoordinatorError> {
        let height = self.head.current();
        let period_start =
            calculate_first_proving_period(height, period_offset, self.params.w_post_proving_period)?;
        let state = StorageProviderState::new(
            StorageProviderInfo::new(provider, sector_size),
            period_start,
            self.params,
            height,
        )?;

        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        if providers.contains_key(&provider) {
            return Err(CoordinatorError::ProviderExists(provider));
        }
        providers.insert(provider, Arc::new(Mutex::new(state)));
        tracing::info!(target: LOG_TARGET, provider, height, period_start, "registered provider");

        Ok(period_start)
    }

    pub fn providers(&self) -> Vec<ProviderId> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub async fn commit_sector(
        &self,
        provider: ProviderId,
        sector: SectorNumber,
    ) -> Result<SectorLocation, CoordinatorError> {
        let locations = self.commit_sectors(provider, &[sector]).await?;
        locations
            .into_iter()
            .next()
            .ok_or(CoordinatorError::StorageProvider(
                StorageProviderError::SectorNotFound(sector),
            ))
    }

    /// Commits sectors at the current height with the proof type the network
    /// prescribes for it. Either every sector is committed or none is.
    pub async fn commit_sectors(
        &self,
        provider: ProviderId,
        sectors: &[SectorNumber],
    ) -> Result<Vec<SectorLocation>, CoordinatorError> {
        let handle = self.provider(provider)?;
        let mut state = handle.lock().await;
        let height = self.head.current();
        let seal_proof = self.gate.proof_type_at(height);

        let mut next = state.clone();
        let locations = next.commit_sectors(sectors, seal_proof, height)?;
        let ids: Vec<_> = sectors
            .iter()
            .map(|sector| SectorId::new(provider, *sector))
            .collect();
        self.store.commit_sectors(&ids, seal_proof)?;
        *state = next;

        let deadlines: BTreeSet<_> = locations.iter().map(|l| l.deadline).collect();
        write_through(self.store.as_ref(), &state, deadlines, sectors.iter().copied());
        tracing::info!(
            target: LOG_TARGET,
            provider,
            ?sectors,
            %seal_proof,
            version = %self.gate.version_at(height),
            "committed sectors"
        );
        Ok(locations)
    }

    pub async fn declare_faults(
        &self,
        provider: ProviderId,
        faults: &[FaultDeclaration],
    ) -> Result<BTreeSet<SectorNumber>, CoordinatorError> {
        let handle = self.provider(provider)?;
        let mut state = handle.lock().await;
        let new_faults = state.declare_faults(faults, self.head.current())?;

        let deadlines = faults.iter().map(|f| f.deadline).collect::<BTreeSet<_>>();
        write_through(self.store.as_ref(), &state, deadlines, new_faults.iter().copied());
        Ok(new_faults)
    }

    pub async fn declare_recoveries(
        &self,
        provider: ProviderId,
        recoveries: &[RecoveryDeclaration],
    ) -> Result<BTreeSet<SectorNumber>, CoordinatorError> {
        let handle = self.provider(provider)?;
        let mut state = handle.lock().await;
        let recovering = state.declare_recoveries(recoveries, self.head.current())?;

        let deadlines = recoveries.iter().map(|r| r.deadline).collect::<BTreeSet<_>>();
        write_through(self.store.as_ref(), &state, deadlines, recovering.iter().copied());
        Ok(recovering)
    }

    pub async fn terminate_sectors(
        &self,
        provider: ProviderId,
        sectors: &BTreeSet<SectorNumber>,
    ) -> Result<Vec<SectorLocation>, CoordinatorError> {
        let handle = self.provider(provider)?;
        let mut state = handle.lock().await;
        let locations = state.terminate_sectors(sectors)?;

        let deadlines = locations.iter().map(|l| l.deadline).collect::<BTreeSet<_>>();
        write_through(self.store.as_ref(), &state, deadlines, sectors.iter().copied());
        Ok(locations)
    }

    /// Evaluates `height` for every provider.
    ///
    /// Closed deadlines are settled (cancelling their outstanding proof jobs) and
    /// proof jobs are started for deadlines whose challenge was just drawn.
    /// Errors are isolated to the provider they happened for.
    #[tracing::instrument(skip(self))]
    pub async fn on_height(&self, height: BlockNumber) {
        let providers: Vec<_> = self
            .providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(provider, handle)| (*provider, handle.clone()))
            .collect();
        let proof_type = self.gate.post_proof_at(height);

        futures::future::join_all(
            providers
                .into_iter()
                .map(|(provider, handle)| self.advance_provider(provider, handle, height, proof_type)),
        )
        .await;

        self.processed.send_modify(|processed| *processed = (*processed).max(height));
    }

    /// Follows the height stream until it ends or the coordinator is cancelled.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, mut heights: HeightSubscription) {
        tracing::info!(target: LOG_TARGET, "coordinator started");
        loop {
            tokio::select! {
                biased;
                () = self.token.cancelled() => break,
                height = heights.next() => match height {
                    Some(height) => self.on_height(height).await,
                    None => break,
                },
            }
        }
        tracing::info!(target: LOG_TARGET, "coordinator stopped");
    }

    /// Highest height evaluated so far.
    pub fn processed(&self) -> ChainHead {
        ChainHead::new(self.processed.subscribe())
    }

    /// Waits until no proof job is running.
    pub async fn wait_idle(&self) {
        let mut in_flight = self.in_flight.subscribe();
        let _ = in_flight.wait_for(|jobs| *jobs == 0).await;
    }

    /// Cancels every running proof job and waits for them to exit.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub async fn current_deadline(
        &self,
        provider: ProviderId,
    ) -> Result<Option<DeadlineInfo>, CoordinatorError> {
        let handle = self.provider(provider)?;
        let state = handle.lock().await;
        Ok(state.current_deadline(self.head.current()))
    }

    pub async fn sector_health(&self, sector: SectorId) -> Option<SectorHealth> {
        let handle = self.provider(sector.provider).ok()?;
        let state = handle.lock().await;
        state.sector_health(sector.number)
    }

    pub async fn sector_info(&self, sector: SectorId) -> Option<SectorOnChainInfo> {
        let handle = self.provider(sector.provider).ok()?;
        let state = handle.lock().await;
        state.sector(sector.number).copied()
    }

    pub async fn partitions(
        &self,
        provider: ProviderId,
        deadline: u64,
    ) -> Result<BTreeMap<PartitionNumber, Partition>, CoordinatorError> {
        let handle = self.provider(provider)?;
        let state = handle.lock().await;
        Ok(state.partitions(deadline)?.clone())
    }

    /// Raw byte power of a provider.
    pub async fn power(&self, provider: ProviderId) -> Result<u64, CoordinatorError> {
        let handle = self.provider(provider)?;
        let state = handle.lock().await;
        Ok(state.power())
    }

    /// Seal proof type sectors committed at `height` get.
    pub fn proof_type_for_new_sectors(&self, height: BlockNumber) -> RegisteredSealProof {
        self.gate.proof_type_at(height)
    }

    fn provider(&self, provider: ProviderId) -> Result<ProviderHandle, CoordinatorError> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&provider)
            .cloned()
            .ok_or(CoordinatorError::UnknownProvider(provider))
    }

    async fn advance_provider(
        &self,
        provider: ProviderId,
        handle: ProviderHandle,
        height: BlockNumber,
        proof_type: RegisteredPoStProof,
    ) {
        let mut state = handle.lock().await;
        let outcome = match state.advance_to(height, proof_type) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(target: LOG_TARGET, provider, height, %err, "failed to advance provider");
                return;
            }
        };

        for closed in &outcome.closed {
            self.cancel_job(provider, &closed.deadline);
            if closed.new_faults.is_empty() && closed.terminated.is_empty() {
                continue;
            }
            let sectors = closed.new_faults.iter().chain(&closed.terminated).copied();
            write_through(self.store.as_ref(), &state, [closed.deadline.idx], sectors);
        }
        drop(state);

        for job in outcome.jobs {
            self.spawn_job(job, handle.clone());
        }
    }

    fn spawn_job(&self, job: PoStJob, handle: ProviderHandle) {
        let key = (job.provider, job.deadline.idx, job.deadline.open_at);
        let token = self.token.child_token();
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, token.clone());
        self.in_flight.send_modify(|jobs| *jobs += 1);

        let task = ProofTask {
            job,
            handle,
            backend: self.backend.clone(),
            store: self.store.clone(),
            head: self.head.clone(),
            config: self.config,
            token,
            _in_flight: InFlight(self.in_flight.clone()),
        };
        self.tracker.spawn(task.run());
    }

    fn cancel_job(&self, provider: ProviderId, deadline: &DeadlineInfo) {
        let key = (provider, deadline.idx, deadline.open_at);
        if let Some(token) = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key)
        {
            token.cancel();
        }
    }
}

/// Counts a running proof job until dropped.
struct InFlight(Arc<watch::Sender<usize>>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.send_modify(|jobs| *jobs = jobs.saturating_sub(1));
    }
}

struct ProofTask {
    job: PoStJob,
    handle: ProviderHandle,
    backend: Arc<dyn ProvingBackend>,
    store: Arc<dyn ChainStateStore>,
    head: ChainHead,
    config: CoordinatorConfig,
    token: CancellationToken,
    _in_flight: InFlight,
}

impl ProofTask {
    #[tracing::instrument(skip_all, fields(
        provider = self.job.provider,
        deadline = self.job.deadline.idx,
        open_at = self.job.deadline.open_at,
    ))]
    async fn run(self) {
        let outcome = tokio::select! {
            biased;
            () = self.token.cancelled() => {
                tracing::debug!(target: LOG_TARGET, "proof cancelled");
                return;
            }
            result = tokio::time::timeout(self.config.proof_timeout, self.prove()) => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => {
                    tracing::warn!(target: LOG_TARGET, %err, "no proof for this deadline");
                    return;
                }
                Err(_) => {
                    tracing::warn!(target: LOG_TARGET, timeout = ?self.config.proof_timeout, "proof timed out");
                    return;
                }
            },
        };

        let mut state = self.handle.lock().await;
        // Cancelled while waiting for the state: the window is settled already.
        if self.token.is_cancelled() {
            return;
        }
        let height = self.head.current();
        match state.record_post_result(&self.job.deadline, &outcome, height) {
            Ok(result) => {
                tracing::info!(
                    target: LOG_TARGET,
                    height,
                    proven = ?result.proven,
                    recovered = ?result.recovered,
                    new_faults = ?result.new_faults,
                    "window post recorded"
                );
                let sectors = self
                    .job
                    .partitions
                    .iter()
                    .flat_map(|p| p.sectors.iter().map(|s| s.sector_number))
                    .collect::<Vec<_>>();
                write_through(self.store.as_ref(), &state, [self.job.deadline.idx], sectors);
            }
            Err(err @ StorageProviderError::WindowClosed { .. }) => {
                tracing::debug!(target: LOG_TARGET, height, %err, "proof arrived too late");
            }
            Err(err) => {
                tracing::error!(target: LOG_TARGET, height, %err, "failed to record window post");
            }
        }
    }

    /// Proves the job's partitions, retrying transient failures and dropping
    /// partitions whose proof is invalid.
    async fn prove(&self) -> Result<ProofOutcome, ProvingError> {
        let mut job = self.job.clone();
        let mut outcome = ProofOutcome::default();

        while !job.partitions.is_empty() {
            let attempt = (|| {
                self.backend.submit_window_post(
                    job.provider,
                    job.deadline.idx,
                    &job.partitions,
                    job.proof_type,
                )
            })
            .retry(self.config.backoff())
            .when(ProvingError::is_transient)
            .notify(|err, delay| {
                tracing::warn!(target: LOG_TARGET, %err, ?delay, "retrying window post");
            })
            .await;

            match attempt {
                Ok(proven) => {
                    outcome.merge(proven);
                    break;
                }
                Err(ProvingError::Permanent { partitions, reason }) => {
                    tracing::warn!(target: LOG_TARGET, ?partitions, reason, "invalid proof, partitions left unproven");
                    let before = job.partitions.len();
                    job.retain_partitions(&partitions);
                    if job.partitions.len() == before {
                        return Err(ProvingError::Permanent { partitions, reason });
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Ok(outcome)
    }
}

/// Mirrors the given deadlines and sectors of a provider into the store.
///
/// The in-memory state stays authoritative; store failures are only logged.
fn write_through(
    store: &dyn ChainStateStore,
    state: &StorageProviderState,
    deadlines: impl IntoIterator<Item = u64>,
    sectors: impl IntoIterator<Item = SectorNumber>,
) {
    let provider = state.info.provider;
    for deadline in deadlines {
        let result = state
            .partitions(deadline)
            .map_err(CoordinatorError::from)
            .and_then(|partitions| {
                Ok(store.write_partitions(provider, deadline, partitions.clone())?)
            });
        if let Err(err) = result {
            tracing::error!(target: LOG_TARGET, provider, deadline, %err, "failed to write partitions");
        }
    }

    for sector in sectors {
        let id = SectorId::new(provider, sector);
        let sector_state = match state.sector(sector) {
            Some(info) => state.sector_health(sector).map(|health| SectorState {
                info: *info,
                health,
                location: state.location(sector),
            }),
            // terminated, keep the last known info
            None => store.read_sector_state(id).ok().flatten().map(|previous| SectorState {
                health: SectorHealth::Terminated,
                location: None,
                ..previous
            }),
        };
        let Some(sector_state) = sector_state else {
            continue;
        };
        if let Err(err) = store.write_sector_state(id, sector_state) {
            tracing::error!(target: LOG_TARGET, %id, %err, "failed to write sector state");
        }
    }
}
