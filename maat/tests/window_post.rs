//! Window PoSt over several proving periods, with storage faults and recoveries.

use std::collections::BTreeSet;

use maat::{setup_logging, Devnet};
use primitives_proofs::{ProviderId, SectorId};
use storage_provider_scheduler::ChainStateStore;
use storage_provider_state::{FaultDeclaration, ProvingParameters, RecoveryDeclaration, SectorHealth};

const SECTOR: u64 = 2048;

fn devnet() -> Devnet {
    Devnet::builder()
        .params(ProvingParameters {
            fault_max_age: 1000,
            ..Default::default()
        })
        .build()
}

async fn health(devnet: &Devnet, provider: ProviderId, sector: u64) -> Option<SectorHealth> {
    devnet
        .coordinator
        .sector_health(SectorId::new(provider, sector))
        .await
}

#[tokio::test(start_paused = true)]
async fn faults_and_recoveries_follow_the_proofs() {
    setup_logging();
    let devnet = devnet();
    let provider = devnet.register_provider(0, 0);
    devnet.mine_until(1).await;
    let sectors = devnet.pledge_sectors(provider, 10).await;

    devnet.mine_until(60).await;
    assert_eq!(devnet.coordinator.power(provider).await, Ok(10 * SECTOR));

    // A full partition and a single sector of another one stop being provable.
    let locations = devnet.sector_locations(provider).await;
    let mut full = locations.values().filter(|sectors| sectors.len() == 2);
    let partition_a = full.next().unwrap().clone();
    let partition_b = full.next().unwrap().clone();
    for sector in partition_a.iter().chain(&partition_b[..1]) {
        devnet.backend.mark_corrupted(SectorId::new(provider, *sector));
    }

    devnet.mine_until(120).await;
    assert_eq!(devnet.coordinator.power(provider).await, Ok(7 * SECTOR));
    for sector in partition_a.iter().chain(&partition_b[..1]) {
        assert_eq!(health(&devnet, provider, *sector).await, Some(SectorHealth::Faulty));
        let stored = devnet
            .store
            .read_sector_state(SectorId::new(provider, *sector))
            .unwrap()
            .unwrap();
        assert_eq!(stored.health, SectorHealth::Faulty);
    }
    assert_eq!(health(&devnet, provider, partition_b[1]).await, Some(SectorHealth::Active));

    // One sector of the faulty partition is repaired.
    let repaired = partition_a[0];
    devnet.backend.restore(SectorId::new(provider, repaired));
    let location = locations
        .iter()
        .find_map(|(location, sectors)| sectors.contains(&repaired).then_some(*location))
        .unwrap();
    let recovering = devnet
        .coordinator
        .declare_recoveries(
            provider,
            &[RecoveryDeclaration::new(
                location.deadline,
                location.partition,
                [repaired],
            )],
        )
        .await
        .unwrap();
    assert_eq!(recovering, BTreeSet::from([repaired]));
    assert_eq!(health(&devnet, provider, repaired).await, Some(SectorHealth::Recovering));

    devnet.mine_until(180).await;
    assert_eq!(devnet.coordinator.power(provider).await, Ok(8 * SECTOR));
    assert_eq!(health(&devnet, provider, repaired).await, Some(SectorHealth::Active));
    assert_eq!(health(&devnet, provider, partition_a[1]).await, Some(SectorHealth::Faulty));
    assert_eq!(health(&devnet, provider, partition_b[0]).await, Some(SectorHealth::Faulty));

    // Sectors pledged later join the schedule.
    let late = devnet.pledge_sectors(provider, 1).await;
    assert_eq!(late, vec![sectors.len() as u64]);
    devnet.mine_until(240).await;
    assert_eq!(devnet.coordinator.power(provider).await, Ok(9 * SECTOR));

    devnet.stop().await;
}

#[tokio::test(start_paused = true)]
async fn running_chain_proves_every_period() {
    setup_logging();
    let mut devnet = devnet();
    let first = devnet.register_provider(0, 0);
    let second = devnet.register_provider(1, 30);
    devnet.pledge_sectors(first, 6).await;
    devnet.pledge_sectors(second, 6).await;

    devnet.start();
    devnet.wait_for_height(150).await;

    assert_eq!(devnet.coordinator.power(first).await, Ok(6 * SECTOR));
    assert_eq!(devnet.coordinator.power(second).await, Ok(6 * SECTOR));
    let requests = devnet.backend.requests();
    for provider in [first, second] {
        let proven: BTreeSet<_> = requests
            .iter()
            .filter(|request| request.provider == provider)
            .map(|request| request.deadline)
            .collect();
        let assigned: BTreeSet<_> = devnet
            .sector_locations(provider)
            .await
            .keys()
            .map(|location| location.deadline)
            .collect();
        assert_eq!(proven, assigned);
    }

    devnet.stop().await;
}

#[tokio::test(start_paused = true)]
async fn declared_faults_are_skipped_until_recovered() {
    setup_logging();
    let devnet = devnet();
    let provider = devnet.register_provider(0, 0);
    devnet.mine_until(1).await;
    devnet.pledge_sectors(provider, 4).await;
    devnet.mine_until(60).await;
    assert_eq!(devnet.coordinator.power(provider).await, Ok(4 * SECTOR));

    let (location, sectors) = devnet
        .sector_locations(provider)
        .await
        .into_iter()
        .next()
        .unwrap();
    let declared = devnet
        .coordinator
        .declare_faults(
            provider,
            &[FaultDeclaration::new(
                location.deadline,
                location.partition,
                sectors.iter().copied(),
            )],
        )
        .await
        .unwrap();
    assert_eq!(declared, sectors.iter().copied().collect());
    assert_eq!(devnet.coordinator.power(provider).await, Ok(2 * SECTOR));

    devnet.mine_until(120).await;
    assert_eq!(devnet.coordinator.power(provider).await, Ok(2 * SECTOR));
    // nothing left to prove in that deadline this period
    let requests_for = |deadline| {
        devnet
            .backend
            .requests()
            .iter()
            .filter(|request| request.deadline == deadline)
            .count()
    };
    assert_eq!(requests_for(location.deadline), 1);

    devnet
        .coordinator
        .declare_recoveries(
            provider,
            &[RecoveryDeclaration::new(
                location.deadline,
                location.partition,
                sectors.iter().copied(),
            )],
        )
        .await
        .unwrap();
    devnet.mine_until(180).await;
    assert_eq!(requests_for(location.deadline), 2);
    assert_eq!(devnet.coordinator.power(provider).await, Ok(4 * SECTOR));

    devnet.stop().await;
}
