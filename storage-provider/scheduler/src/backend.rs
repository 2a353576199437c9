use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use primitives_proofs::{PartitionNumber, ProviderId, RegisteredPoStProof, SectorId};
use storage_provider_state::{PartitionProofRequest, ProofOutcome};

const LOG_TARGET: &str = "scheduler::backend";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvingError {
    /// The backend could not be reached; the request may be retried.
    #[error("proving backend unavailable: {0}")]
    Transient(String),
    /// The proof of the given partitions is invalid; retrying will not help.
    #[error("invalid proof for partitions {partitions:?}: {reason}")]
    Permanent {
        partitions: BTreeSet<PartitionNumber>,
        reason: String,
    },
    #[error("proof request cancelled")]
    Cancelled,
}

impl ProvingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProvingError::Transient(_))
    }
}

/// Generates (and verifies) Window PoSts.
#[async_trait]
pub trait ProvingBackend: Send + Sync {
    /// Proves the given partitions of `deadline` for `provider`.
    async fn submit_window_post(
        &self,
        provider: ProviderId,
        deadline: u64,
        partitions: &[PartitionProofRequest],
        proof_type: RegisteredPoStProof,
    ) -> Result<ProofOutcome, ProvingError>;
}

/// A proof request received by the [`MockProvingBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofRequest {
    pub provider: ProviderId,
    pub deadline: u64,
    pub partitions: Vec<PartitionNumber>,
    pub proof_type: RegisteredPoStProof,
}

#[derive(Debug, Default)]
struct MockState {
    /// Sectors the prover cannot read.
    corrupted: BTreeSet<SectorId>,
    /// Sectors whose proofs do not verify.
    failed: BTreeSet<SectorId>,
    injected: BTreeMap<ProviderId, VecDeque<ProvingError>>,
    requests: Vec<ProofRequest>,
}

/// Deterministic in-memory prover.
///
/// Corrupted sectors are skipped by the prover. Failed sectors make the proof
/// of their partition invalid, which is only noticed when `validate_proofs` is set.
#[derive(Debug, Default)]
pub struct MockProvingBackend {
    validate_proofs: bool,
    latency: Duration,
    state: Mutex<MockState>,
}

impl MockProvingBackend {
    pub fn new(validate_proofs: bool) -> Self {
        Self {
            validate_proofs,
            ..Default::default()
        }
    }

    /// Makes every proof take `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn mark_corrupted(&self, sector: SectorId) {
        self.state().corrupted.insert(sector);
    }

    pub fn mark_failed(&self, sector: SectorId) {
        self.state().failed.insert(sector);
    }

    /// Clears every mark on `sector`.
    pub fn restore(&self, sector: SectorId) {
        let mut state = self.state();
        state.corrupted.remove(&sector);
        state.failed.remove(&sector);
    }

    /// Makes the next request of `provider` fail with `err`.
    pub fn fail_next(&self, provider: ProviderId, err: ProvingError) {
        self.state().injected.entry(provider).or_default().push_back(err);
    }

    pub fn requests(&self) -> Vec<ProofRequest> {
        self.state().requests.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ProvingBackend for MockProvingBackend {
    async fn submit_window_post(
        &self,
        provider: ProviderId,
        deadline: u64,
        partitions: &[PartitionProofRequest],
        proof_type: RegisteredPoStProof,
    ) -> Result<ProofOutcome, ProvingError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.state();
        state.requests.push(ProofRequest {
            provider,
            deadline,
            partitions: partitions.iter().map(|p| p.partition).collect(),
            proof_type,
        });
        if let Some(err) = state
            .injected
            .get_mut(&provider)
            .and_then(VecDeque::pop_front)
        {
            tracing::debug!(target: LOG_TARGET, provider, deadline, %err, "injected failure");
            return Err(err);
        }

        let mut outcome = ProofOutcome::default();
        let mut invalid = BTreeSet::new();
        for request in partitions {
            for sector in &request.sectors {
                let id = SectorId::new(provider, sector.sector_number);
                if state.corrupted.contains(&id) {
                    outcome.skipped.insert(sector.sector_number);
                } else if state.failed.contains(&id) {
                    invalid.insert(request.partition);
                }
            }
            outcome.proven.insert(request.partition);
        }

        if self.validate_proofs && !invalid.is_empty() {
            tracing::debug!(target: LOG_TARGET, provider, deadline, ?invalid, "proof does not verify");
            return Err(ProvingError::Permanent {
                partitions: invalid,
                reason: "proof does not verify".to_string(),
            });
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use primitives_proofs::RegisteredSealProof;
    use storage_provider_state::SectorOnChainInfo;

    use super::*;

    const PROVIDER: ProviderId = 1000;
    const PROOF: RegisteredPoStProof = RegisteredPoStProof::StackedDRGWindow2KiBV1P1;

    fn request(partition: PartitionNumber, sectors: &[u64]) -> PartitionProofRequest {
        PartitionProofRequest {
            partition,
            sectors: sectors
                .iter()
                .map(|n| SectorOnChainInfo::new(*n, RegisteredSealProof::StackedDRG2KiBV1P1, 0))
                .collect(),
        }
    }

    #[tokio::test]
    async fn corrupted_sectors_are_skipped() {
        let backend = MockProvingBackend::new(true);
        backend.mark_corrupted(SectorId::new(PROVIDER, 1));
        // another provider's sector with the same number
        backend.mark_corrupted(SectorId::new(PROVIDER + 1, 2));

        let outcome = backend
            .submit_window_post(PROVIDER, 0, &[request(0, &[0, 1]), request(1, &[2])], PROOF)
            .await
            .unwrap();
        assert_eq!(outcome.proven, BTreeSet::from([0, 1]));
        assert_eq!(outcome.skipped, BTreeSet::from([1]));
    }

    #[tokio::test]
    async fn failed_sectors_invalidate_their_partition() {
        let backend = MockProvingBackend::new(true);
        backend.mark_failed(SectorId::new(PROVIDER, 2));
        let partitions = [request(0, &[0, 1]), request(1, &[2, 3])];

        assert_eq!(
            backend.submit_window_post(PROVIDER, 0, &partitions, PROOF).await,
            Err(ProvingError::Permanent {
                partitions: BTreeSet::from([1]),
                reason: "proof does not verify".to_string()
            })
        );

        // without validation the invalid proof goes through
        let insecure = MockProvingBackend::new(false);
        insecure.mark_failed(SectorId::new(PROVIDER, 2));
        let outcome = insecure
            .submit_window_post(PROVIDER, 0, &partitions, PROOF)
            .await
            .unwrap();
        assert_eq!(outcome.proven, BTreeSet::from([0, 1]));

        backend.restore(SectorId::new(PROVIDER, 2));
        assert!(backend
            .submit_window_post(PROVIDER, 0, &partitions, PROOF)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let backend = MockProvingBackend::new(true);
        backend.fail_next(PROVIDER, ProvingError::Transient("offline".to_string()));
        backend.fail_next(PROVIDER, ProvingError::Cancelled);
        let partitions = [request(0, &[0])];

        assert_eq!(
            backend.submit_window_post(PROVIDER + 1, 3, &partitions, PROOF).await.map(|o| o.proven),
            Ok(BTreeSet::from([0]))
        );
        assert!(backend
            .submit_window_post(PROVIDER, 3, &partitions, PROOF)
            .await
            .is_err_and(|err| err.is_transient()));
        assert_eq!(
            backend.submit_window_post(PROVIDER, 3, &partitions, PROOF).await,
            Err(ProvingError::Cancelled)
        );
        assert!(backend
            .submit_window_post(PROVIDER, 3, &partitions, PROOF)
            .await
            .is_ok());

        let requests = backend.requests();
        assert_eq!(requests.len(), 4);
        assert_eq!(requests[0].provider, PROVIDER + 1);
        assert!(requests.iter().all(|r| r.deadline == 3 && r.proof_type == PROOF));
    }
}
