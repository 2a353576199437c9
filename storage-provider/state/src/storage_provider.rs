use std::collections::{BTreeMap, BTreeSet};

use primitives_proofs::{
    BlockNumber, PartitionNumber, ProviderId, RegisteredPoStProof, RegisteredSealProof,
    SectorNumber, SectorSize,
};
use serde::{Deserialize, Serialize};

use crate::{
    deadline::{DeadlineInfo, DeadlineSchedule},
    error::{DeadlineError, ScheduleMisconfiguration, StorageProviderError},
    fault::{FaultDeclaration, RecoveryDeclaration},
    health::SectorHealthTracker,
    index::SectorLocation,
    params::ProvingParameters,
    partition::Partition,
    proofs::{PartitionProofRequest, PoStJob, ProofOutcome},
    sector::{SectorHealth, SectorOnChainInfo},
};

const LOG_TARGET: &str = "storage_provider::state";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageProviderInfo {
    pub provider: ProviderId,
    /// Amount of space in each sector committed to the network by this provider.
    pub sector_size: SectorSize,
}

impl StorageProviderInfo {
    pub fn new(provider: ProviderId, sector_size: SectorSize) -> Self {
        Self {
            provider,
            sector_size,
        }
    }
}

/// The challenge drawn for a deadline instance, pending until the deadline closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoStWindow {
    pub deadline: DeadlineInfo,
    /// Sectors challenged per partition.
    pub due: BTreeMap<PartitionNumber, BTreeSet<SectorNumber>>,
    /// Partitions proven so far.
    pub proven: BTreeSet<PartitionNumber>,
}

/// A deadline instance that closed while advancing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedDeadline {
    pub deadline: DeadlineInfo,
    pub missed_partitions: BTreeSet<PartitionNumber>,
    pub new_faults: BTreeSet<SectorNumber>,
    pub terminated: BTreeSet<SectorNumber>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvanceOutcome {
    /// Proofs to generate for challenges drawn while advancing.
    pub jobs: Vec<PoStJob>,
    pub closed: Vec<ClosedDeadline>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoStResult {
    pub proven: BTreeSet<PartitionNumber>,
    pub recovered: BTreeSet<SectorNumber>,
    pub new_faults: BTreeSet<SectorNumber>,
}

/// Window PoSt state of a single storage provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageProviderState {
    pub info: StorageProviderInfo,
    schedule: DeadlineSchedule,
    tracker: SectorHealthTracker,
    /// Drawn challenges, keyed by deadline index.
    windows: BTreeMap<u64, PoStWindow>,
    /// Last height handed to [`StorageProviderState::advance_to`].
    last_processed: BlockNumber,
}

impl StorageProviderState {
    /// Creates the state of a provider registered at `registered_at`.
    ///
    /// Deadlines closing at or before the registration height are never evaluated.
    pub fn new(
        info: StorageProviderInfo,
        period_start: BlockNumber,
        params: ProvingParameters,
        registered_at: BlockNumber,
    ) -> Result<Self, ScheduleMisconfiguration> {
        let schedule = DeadlineSchedule::new(period_start, params)?;
        Ok(Self {
            info,
            tracker: SectorHealthTracker::new(&params),
            schedule,
            windows: BTreeMap::new(),
            last_processed: registered_at,
        })
    }

    pub fn params(&self) -> &ProvingParameters {
        self.schedule.params()
    }

    pub fn schedule(&self) -> &DeadlineSchedule {
        &self.schedule
    }

    pub fn last_processed(&self) -> BlockNumber {
        self.last_processed
    }

    /// Returns the proving period start of the period containing `height`.
    pub fn current_proving_period_start(&self, height: BlockNumber) -> Option<BlockNumber> {
        self.schedule.period_start_at(height)
    }

    pub fn current_deadline(&self, height: BlockNumber) -> Option<DeadlineInfo> {
        self.schedule.current(height)
    }

    /// Commits a sector, returning where it will be proven.
    pub fn commit_sector(
        &mut self,
        sector_number: SectorNumber,
        seal_proof: RegisteredSealProof,
        height: BlockNumber,
    ) -> Result<SectorLocation, StorageProviderError> {
        let locations = self.commit_sectors(&[sector_number], seal_proof, height)?;
        locations
            .into_iter()
            .next()
            .ok_or(StorageProviderError::SectorNotFound(sector_number))
    }

    /// Commits a batch of sectors to the deadlines that are mutable at `height`.
    /// Either every sector is committed or none is.
    pub fn commit_sectors(
        &mut self,
        sector_numbers: &[SectorNumber],
        seal_proof: RegisteredSealProof,
        height: BlockNumber,
    ) -> Result<Vec<SectorLocation>, StorageProviderError> {
        let deadlines = self.params().w_post_period_deadlines;
        let mut mutable: Vec<bool> = (0..deadlines)
            .map(|idx| self.schedule.deadline_is_mutable(idx, height))
            .collect();
        if !mutable.contains(&true) {
            // Only possible with very few deadlines per period.
            tracing::warn!(target: LOG_TARGET, height, "no mutable deadline, assigning to any deadline");
            mutable.fill(true);
        }

        let sectors: Vec<_> = sector_numbers
            .iter()
            .map(|number| SectorOnChainInfo::new(*number, seal_proof, height))
            .collect();
        let locations = self.tracker.add_sectors(&sectors, &mutable)?;
        tracing::debug!(
            target: LOG_TARGET,
            provider = self.info.provider,
            ?sector_numbers,
            %seal_proof,
            "committed sectors"
        );
        Ok(locations)
    }

    /// Advances the provider to `height`.
    ///
    /// For every deadline, the instance whose challenge is still pending and the
    /// latest instance that closed since the last call are evaluated, in close
    /// order: due sectors left unproven become faulty and expired faults are
    /// terminated. Instances in between are not replayed; a sector can only
    /// become faulty once.
    /// Then, if the deadline open at `height` is in its challenge window and no
    /// challenge was drawn for it yet, the challenge is drawn and returned as a job.
    ///
    /// Calling it again with the same height, or a lower one, does nothing.
    pub fn advance_to(
        &mut self,
        height: BlockNumber,
        proof_type: RegisteredPoStProof,
    ) -> Result<AdvanceOutcome, StorageProviderError> {
        let mut outcome = AdvanceOutcome::default();
        if height <= self.last_processed {
            return Ok(outcome);
        }

        let mut closing = Vec::new();
        for idx in 0..self.params().w_post_period_deadlines {
            let pending = self
                .windows
                .get(&idx)
                .map(|window| window.deadline)
                .filter(|dl| dl.close_at <= height);
            if let Some(dl) = pending {
                closing.push(dl);
            }
            let latest = self
                .schedule
                .last_closed(height, idx)
                .filter(|dl| dl.close_at > self.last_processed)
                .filter(|dl| pending.map_or(true, |pending| pending.open_at != dl.open_at));
            if let Some(dl) = latest {
                closing.push(dl);
            }
        }
        closing.sort_by_key(|dl| (dl.close_at, dl.idx));
        for dl in closing {
            outcome.closed.push(self.close_deadline(dl.at(height))?);
        }

        if let Some(current) = self.schedule.current(height) {
            let drawn = self
                .windows
                .get(&current.idx)
                .is_some_and(|window| window.deadline.open_at == current.open_at);
            if current.in_challenge_window() && !drawn {
                if let Some(job) = self.draw_challenge(current, proof_type)? {
                    outcome.jobs.push(job);
                }
            }
        }

        self.last_processed = height;
        Ok(outcome)
    }

    /// Applies the outcome of a proof for the challenge drawn for `deadline`.
    ///
    /// Fails with [`StorageProviderError::WindowClosed`], without any change,
    /// if that challenge is no longer pending.
    pub fn record_post_result(
        &mut self,
        deadline: &DeadlineInfo,
        outcome: &ProofOutcome,
        height: BlockNumber,
    ) -> Result<PoStResult, StorageProviderError> {
        let window = self
            .windows
            .get_mut(&deadline.idx)
            .filter(|window| window.deadline.open_at == deadline.open_at && height < window.deadline.close_at)
            .ok_or(StorageProviderError::WindowClosed {
                deadline: deadline.idx,
                open_at: deadline.open_at,
            })?;

        let mut result = PoStResult::default();
        for partition in &outcome.proven {
            let Some(due) = window.due.get(partition) else {
                tracing::warn!(target: LOG_TARGET, deadline = deadline.idx, partition, "proof for a partition that was not challenged");
                continue;
            };
            if window.proven.contains(partition) {
                tracing::debug!(target: LOG_TARGET, deadline = deadline.idx, partition, "partition already proven in this window");
                continue;
            }

            let skipped: BTreeSet<_> = outcome.skipped.intersection(due).copied().collect();
            let applied = self
                .tracker
                .record_proof(deadline.idx, *partition, due, &skipped, height)?;
            window.proven.insert(*partition);
            result.proven.insert(*partition);
            result.recovered.extend(applied.recovered);
            result.new_faults.extend(applied.new_faults);
        }
        tracing::debug!(
            target: LOG_TARGET,
            provider = self.info.provider,
            deadline = deadline.idx,
            proven = ?result.proven,
            recovered = ?result.recovered,
            new_faults = ?result.new_faults,
            "recorded window post"
        );

        Ok(result)
    }

    pub fn declare_faults(
        &mut self,
        faults: &[FaultDeclaration],
        height: BlockNumber,
    ) -> Result<BTreeSet<SectorNumber>, StorageProviderError> {
        for fault in faults {
            self.check_declaration_cutoff(fault.deadline, height)?;
        }
        self.tracker.declare_faults(faults, height)
    }

    pub fn declare_recoveries(
        &mut self,
        recoveries: &[RecoveryDeclaration],
        height: BlockNumber,
    ) -> Result<BTreeSet<SectorNumber>, StorageProviderError> {
        for recovery in recoveries {
            self.check_declaration_cutoff(recovery.deadline, height)?;
        }
        let fault_max_age = self.params().fault_max_age;
        self.tracker
            .declare_recoveries(recoveries, height, fault_max_age)
    }

    pub fn terminate_sectors(
        &mut self,
        sectors: &BTreeSet<SectorNumber>,
    ) -> Result<Vec<SectorLocation>, StorageProviderError> {
        self.tracker.terminate(sectors)
    }

    pub fn sector_health(&self, sector: SectorNumber) -> Option<SectorHealth> {
        self.tracker.health(sector)
    }

    pub fn sector(&self, sector: SectorNumber) -> Option<&SectorOnChainInfo> {
        self.tracker.sector(sector)
    }

    pub fn sectors(&self) -> impl Iterator<Item = &SectorOnChainInfo> {
        self.tracker.sectors()
    }

    pub fn location(&self, sector: SectorNumber) -> Option<SectorLocation> {
        self.tracker.location(sector)
    }

    pub fn partitions(
        &self,
        deadline: u64,
    ) -> Result<&BTreeMap<PartitionNumber, Partition>, StorageProviderError> {
        Ok(self.tracker.index().partitions_for(deadline)?)
    }

    pub fn pending_window(&self, deadline: u64) -> Option<&PoStWindow> {
        self.windows.get(&deadline)
    }

    /// Raw byte power of the provider.
    pub fn power(&self) -> u64 {
        self.tracker.power(self.info.sector_size)
    }

    fn check_declaration_cutoff(
        &self,
        deadline: u64,
        height: BlockNumber,
    ) -> Result<(), StorageProviderError> {
        let dl_info = self
            .schedule
            .deadline(height, deadline)
            .ok_or(DeadlineError::DeadlineIndexOutOfRange(deadline))?;
        if dl_info.in_challenge_window() {
            tracing::debug!(target: LOG_TARGET, deadline, height, "declaration after the challenge");
            return Err(StorageProviderError::DeclarationCutoff { deadline });
        }
        Ok(())
    }

    fn draw_challenge(
        &mut self,
        deadline: DeadlineInfo,
        proof_type: RegisteredPoStProof,
    ) -> Result<Option<PoStJob>, StorageProviderError> {
        let due: BTreeMap<PartitionNumber, BTreeSet<SectorNumber>> = self
            .tracker
            .index()
            .partitions_for(deadline.idx)?
            .iter()
            .map(|(number, partition)| (*number, partition.provable_sectors()))
            .filter(|(_, sectors)| !sectors.is_empty())
            .collect();

        let job = (!due.is_empty()).then(|| PoStJob {
            provider: self.info.provider,
            deadline,
            proof_type,
            partitions: due
                .iter()
                .map(|(partition, sectors)| PartitionProofRequest {
                    partition: *partition,
                    sectors: sectors
                        .iter()
                        .filter_map(|sector| self.tracker.sector(*sector).copied())
                        .collect(),
                })
                .collect(),
        });
        tracing::debug!(
            target: LOG_TARGET,
            provider = self.info.provider,
            deadline = deadline.idx,
            open_at = deadline.open_at,
            partitions = due.len(),
            "challenge drawn"
        );

        self.windows.insert(
            deadline.idx,
            PoStWindow {
                deadline,
                due,
                proven: BTreeSet::new(),
            },
        );
        Ok(job)
    }

    fn close_deadline(
        &mut self,
        deadline: DeadlineInfo,
    ) -> Result<ClosedDeadline, StorageProviderError> {
        // faults are dated at the close, however late it is processed
        let height = deadline.close_at;
        let fault_max_age = self.params().fault_max_age;
        let due: BTreeMap<PartitionNumber, BTreeSet<SectorNumber>> = match self.windows.remove(&deadline.idx) {
            Some(window) if window.deadline.open_at == deadline.open_at => window
                .due
                .into_iter()
                .filter(|(partition, _)| !window.proven.contains(partition))
                .collect(),
            // The challenge was never drawn: every provable sector committed
            // before the instance opened was due.
            _ => self
                .tracker
                .index()
                .partitions_for(deadline.idx)?
                .iter()
                .map(|(number, partition)| {
                    let due: BTreeSet<_> = partition
                        .provable_sectors()
                        .into_iter()
                        .filter(|sector| {
                            self.tracker
                                .sector(*sector)
                                .is_some_and(|info| info.activation < deadline.open_at)
                        })
                        .collect();
                    (*number, due)
                })
                .filter(|(_, sectors)| !sectors.is_empty())
                .collect(),
        };

        let mut closed = ClosedDeadline {
            deadline,
            missed_partitions: BTreeSet::new(),
            new_faults: BTreeSet::new(),
            terminated: BTreeSet::new(),
        };
        for (partition, sectors) in &due {
            let new_faults = self
                .tracker
                .record_missed(deadline.idx, *partition, sectors, height)?;
            if !new_faults.is_empty() {
                closed.missed_partitions.insert(*partition);
                closed.new_faults.extend(new_faults);
            }
        }
        closed.terminated = self
            .tracker
            .expire_faults(deadline.idx, height, fault_max_age)?;

        if !closed.missed_partitions.is_empty() {
            tracing::info!(
                target: LOG_TARGET,
                provider = self.info.provider,
                deadline = deadline.idx,
                missed = ?closed.missed_partitions,
                new_faults = ?closed.new_faults,
                "deadline closed with missed partitions"
            );
        }
        Ok(closed)
    }
}

/// Calculates the first proving period start for a provider registered at `current_block`.
///
/// Reference:
/// * <https://github.com/filecoin-project/builtin-actors/blob/17ede2b256bc819dc309edf38e031e246a516486/actors/miner/src/lib.rs#L4904-L4921>
pub fn calculate_first_proving_period(
    current_block: BlockNumber,
    offset: BlockNumber,
    wpost_proving_period: BlockNumber,
) -> Result<BlockNumber, ScheduleMisconfiguration> {
    if offset >= wpost_proving_period {
        return Err(ScheduleMisconfiguration::PeriodOffsetOutOfRange {
            offset,
            period: wpost_proving_period,
        });
    }
    let global_proving_index = current_block / wpost_proving_period;
    let global_proving_start = global_proving_index * wpost_proving_period;
    Ok(global_proving_start + offset)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const PROVIDER: ProviderId = 1000;
    const SEAL: RegisteredSealProof = RegisteredSealProof::StackedDRG2KiBV1P1;
    const POST: RegisteredPoStProof = RegisteredPoStProof::StackedDRGWindow2KiBV1P1;
    const SECTOR: u64 = 2048;

    #[rstest]
    #[case(0, 0, 0)]
    #[case(0, 119, 119)]
    #[case(1, 0, 0)]
    #[case(1, 119, 119)]
    #[case(120, 0, 120)]
    #[case(120, 20, 140)]
    #[case(124, 0, 120)]
    #[case(124, 20, 140)]
    fn calculate_proving_period(
        #[case] current_block: u64,
        #[case] offset: u64,
        #[case] expected_start: u64,
    ) {
        assert_eq!(
            calculate_first_proving_period(current_block, offset, 120),
            Ok(expected_start)
        );
    }

    #[test]
    fn proving_period_offset_must_fit_in_period() {
        assert_eq!(
            calculate_first_proving_period(10, 120, 120),
            Err(ScheduleMisconfiguration::PeriodOffsetOutOfRange {
                offset: 120,
                period: 120
            })
        );
    }

    /// Period 60, 6 deadlines of 10 blocks, challenge drawn when a deadline opens.
    /// Sectors 0 and 1 land in deadline 2, sectors 2 and 3 in deadline 3.
    fn state() -> StorageProviderState {
        let params = ProvingParameters {
            fault_max_age: 1000,
            ..Default::default()
        };
        let info = StorageProviderInfo::new(PROVIDER, SectorSize::_2KiB);
        let mut state = StorageProviderState::new(info, 0, params, 0).unwrap();
        state.commit_sectors(&[0, 1, 2, 3], SEAL, 1).unwrap();
        state
    }

    fn prove_all(state: &mut StorageProviderState, job: &PoStJob, height: BlockNumber) -> PoStResult {
        let outcome = ProofOutcome {
            proven: job.partition_numbers(),
            skipped: BTreeSet::new(),
        };
        state.record_post_result(&job.deadline, &outcome, height).unwrap()
    }

    #[test]
    fn sectors_avoid_open_deadlines() {
        let state = state();
        let deadlines: Vec<_> = (0..4).map(|s| state.location(s).unwrap().deadline).collect();
        assert_eq!(deadlines, vec![2, 2, 3, 3]);
        assert_eq!(state.power(), 0);
    }

    #[test]
    fn proven_sectors_gain_power() {
        let mut state = state();

        let outcome = state.advance_to(20, POST).unwrap();
        assert_eq!(outcome.closed.len(), 2);
        assert_eq!(outcome.jobs.len(), 1);
        let job = &outcome.jobs[0];
        assert_eq!(job.deadline.idx, 2);
        assert_eq!(job.proof_type, POST);
        assert_eq!(job.partitions.len(), 1);
        assert_eq!(job.partitions[0].sectors.len(), 2);
        assert!(job.partitions[0].sectors.iter().all(|s| s.seal_proof == SEAL));

        let result = prove_all(&mut state, job, 21);
        assert_eq!(result.proven, BTreeSet::from([0]));
        assert_eq!(state.power(), 2 * SECTOR);

        // the challenge is drawn once per deadline instance
        assert!(state.advance_to(25, POST).unwrap().jobs.is_empty());
    }

    #[test]
    fn second_proof_in_a_window_is_ignored() {
        let mut state = state();
        let job = state.advance_to(20, POST).unwrap().jobs.remove(0);
        assert_eq!(prove_all(&mut state, &job, 21).proven, BTreeSet::from([0]));

        let again = prove_all(&mut state, &job, 22);
        assert_eq!(again, PoStResult::default());
        assert_eq!(state.power(), 2 * SECTOR);
    }

    #[test]
    fn missed_deadline_faults_due_sectors_once() {
        let mut state = state();
        let job = state.advance_to(20, POST).unwrap().jobs.remove(0);
        prove_all(&mut state, &job, 20);

        // deadline 3 is challenged at 30 but never proven
        assert_eq!(state.advance_to(30, POST).unwrap().jobs.len(), 1);
        let outcome = state.advance_to(40, POST).unwrap();
        let closed = outcome.closed.last().unwrap();
        assert_eq!(closed.deadline.idx, 3);
        assert_eq!(closed.new_faults, BTreeSet::from([2, 3]));
        assert_eq!(state.sector_health(2), Some(SectorHealth::Faulty));
        assert_eq!(state.power(), 2 * SECTOR);

        // evaluating the same height again changes nothing
        let before = state.clone();
        assert_eq!(state.advance_to(40, POST).unwrap(), AdvanceOutcome::default());
        assert_eq!(state, before);
    }

    #[test]
    fn late_results_are_rejected() {
        let mut state = state();
        let job = state.advance_to(20, POST).unwrap().jobs.remove(0);
        state.advance_to(30, POST).unwrap();
        let before = state.clone();

        let outcome = ProofOutcome {
            proven: job.partition_numbers(),
            skipped: BTreeSet::new(),
        };
        assert_eq!(
            state.record_post_result(&job.deadline, &outcome, 30),
            Err(StorageProviderError::WindowClosed {
                deadline: 2,
                open_at: 20
            })
        );
        assert_eq!(state, before);
    }

    #[test]
    fn skipped_sectors_become_faulty() {
        let mut state = state();
        let job = state.advance_to(20, POST).unwrap().jobs.remove(0);
        let outcome = ProofOutcome {
            proven: job.partition_numbers(),
            skipped: BTreeSet::from([1]),
        };
        let result = state.record_post_result(&job.deadline, &outcome, 22).unwrap();
        assert_eq!(result.new_faults, BTreeSet::from([1]));
        assert_eq!(state.sector_health(0), Some(SectorHealth::Active));
        assert_eq!(state.sector_health(1), Some(SectorHealth::Faulty));
        assert_eq!(state.power(), SECTOR);
    }

    #[test]
    fn long_stall_evaluates_each_deadline_once() {
        let mut state = state();
        let outcome = state.advance_to(500, POST).unwrap();

        assert_eq!(outcome.closed.len(), 6);
        let faults: BTreeSet<_> = outcome
            .closed
            .iter()
            .flat_map(|closed| closed.new_faults.iter().copied())
            .collect();
        assert_eq!(faults, BTreeSet::from([0, 1, 2, 3]));
        // deadline 2 is open again but only holds faulty sectors
        assert_eq!(state.current_deadline(500).map(|dl| dl.idx), Some(2));
        assert!(outcome.jobs.is_empty());
    }

    /// Number of times each sector became faulty over the given outcomes.
    fn fault_counts(outcomes: &[AdvanceOutcome]) -> BTreeMap<SectorNumber, usize> {
        let mut counts = BTreeMap::new();
        for closed in outcomes.iter().flat_map(|outcome| &outcome.closed) {
            for sector in &closed.new_faults {
                *counts.entry(*sector).or_default() += 1;
            }
        }
        counts
    }

    #[test]
    fn stall_after_a_proof_faults_the_missed_instance() {
        let mut state = state();
        let job = state.advance_to(20, POST).unwrap().jobs.remove(0);
        prove_all(&mut state, &job, 21);
        assert_eq!(state.power(), 2 * SECTOR);

        let outcome = state.advance_to(200, POST).unwrap();
        let closed: Vec<_> = outcome
            .closed
            .iter()
            .map(|closed| (closed.deadline.idx, closed.deadline.open_at))
            .collect();
        assert_eq!(
            closed,
            vec![(2, 20), (2, 140), (3, 150), (4, 160), (5, 170), (0, 180), (1, 190)]
        );
        // the proven instance closes clean, the latest one is missed
        assert!(outcome.closed[0].new_faults.is_empty());
        assert_eq!(outcome.closed[1].new_faults, BTreeSet::from([0, 1]));
        assert_eq!(outcome.closed[2].new_faults, BTreeSet::from([2, 3]));

        assert_eq!(state.sector_health(0), Some(SectorHealth::Faulty));
        assert_eq!(state.sector_health(2), Some(SectorHealth::Faulty));
        assert_eq!(state.power(), 0);
    }

    #[test]
    fn repeated_stalls_fault_each_sector_once() {
        let mut state = state();
        let job = state.advance_to(20, POST).unwrap().jobs.remove(0);
        prove_all(&mut state, &job, 21);
        let job = state.advance_to(30, POST).unwrap().jobs.remove(0);
        prove_all(&mut state, &job, 31);
        assert_eq!(state.power(), 4 * SECTOR);

        // more than two periods, twice
        let first = state.advance_to(400, POST).unwrap();
        let second = state.advance_to(700, POST).unwrap();

        assert_eq!(
            fault_counts(&[first, second.clone()]),
            BTreeMap::from([(0, 1), (1, 1), (2, 1), (3, 1)])
        );
        // six latest instances plus the challenge drawn at 400
        assert_eq!(second.closed.len(), 7);
        assert!(second.closed.iter().all(|closed| closed.new_faults.is_empty()));
        assert_eq!(state.power(), 0);
    }

    #[test]
    fn sectors_are_not_due_before_their_commitment() {
        let mut state = state();
        // committed while the provider lags behind the chain
        state.commit_sector(4, SEAL, 100).unwrap();

        let outcome = state.advance_to(125, POST).unwrap();
        assert!(!fault_counts(&[outcome]).contains_key(&4));
        assert_eq!(state.sector_health(4), Some(SectorHealth::Active));
        assert_eq!(state.sector_health(0), Some(SectorHealth::Faulty));
    }

    #[test]
    fn declarations_are_cut_off_during_the_challenge() {
        let mut state = state();
        state.advance_to(20, POST).unwrap();

        assert_eq!(
            state.declare_faults(&[FaultDeclaration::new(2, 0, [0])], 25),
            Err(StorageProviderError::DeclarationCutoff { deadline: 2 })
        );
        assert_eq!(
            state.declare_faults(&[FaultDeclaration::new(3, 0, [2])], 25),
            Ok(BTreeSet::from([2]))
        );
        assert_eq!(
            state.declare_faults(&[FaultDeclaration::new(9, 0, [2])], 25),
            Err(StorageProviderError::Deadline(
                DeadlineError::DeadlineIndexOutOfRange(9)
            ))
        );
    }

    #[test]
    fn declared_recovery_is_proven_at_the_next_deadline() {
        let mut state = state();
        let job = state.advance_to(20, POST).unwrap().jobs.remove(0);
        prove_all(&mut state, &job, 20);
        state.advance_to(35, POST).unwrap();

        state
            .declare_faults(&[FaultDeclaration::new(2, 0, [0])], 35)
            .unwrap();
        assert_eq!(state.power(), SECTOR);
        state
            .declare_recoveries(&[RecoveryDeclaration::new(2, 0, [0])], 40)
            .unwrap();
        assert_eq!(state.sector_health(0), Some(SectorHealth::Recovering));

        let job = state.advance_to(80, POST).unwrap().jobs.remove(0);
        assert_eq!(job.deadline.idx, 2);
        let result = prove_all(&mut state, &job, 81);
        assert_eq!(result.recovered, BTreeSet::from([0]));
        assert_eq!(state.sector_health(0), Some(SectorHealth::Active));
        assert_eq!(state.power(), 2 * SECTOR);
    }

    #[test]
    fn proof_type_is_fixed_at_commitment() {
        let mut state = state();
        state
            .commit_sector(4, RegisteredSealProof::StackedDRG2KiBV1, 2)
            .unwrap();
        assert_eq!(state.sector(0).map(|s| s.seal_proof), Some(SEAL));
        assert_eq!(
            state.sector(4).map(|s| s.seal_proof),
            Some(RegisteredSealProof::StackedDRG2KiBV1)
        );
    }
}
