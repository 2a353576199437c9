//! Height delivery to subscribers of a running mining loop.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use maat::{setup_logging, Devnet};
use primitives_proofs::BlockNumber;
use storage_provider_scheduler::{
    AlwaysProduce, BlockProducer, BlockProductionError, EpochClock, MiningConfig, MiningLoop,
    MiningState, OverflowPolicy,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn mining(producer: Arc<dyn BlockProducer>, config: MiningConfig) -> Arc<MiningLoop> {
    Arc::new(MiningLoop::new(Arc::new(EpochClock::new(0)), producer, config))
}

/// Takes a while to produce each block and announces when it starts.
struct SlowProducer {
    started: Notify,
    duration: Duration,
}

#[async_trait]
impl BlockProducer for SlowProducer {
    async fn produce_block(&self, _height: BlockNumber) -> Result<(), BlockProductionError> {
        self.started.notify_one();
        tokio::time::sleep(self.duration).await;
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn heights_arrive_in_order() {
    setup_logging();
    let mining = mining(Arc::new(AlwaysProduce), MiningConfig::default());
    let heights = mining.subscribe().into_stream();
    let handle = mining.clone().start(CancellationToken::new()).unwrap();

    let received: Vec<_> = heights.take(5).collect().await;
    assert_eq!(received, vec![1, 2, 3, 4, 5]);
    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn slow_subscribers_lose_the_oldest_heights() {
    setup_logging();
    let mining = mining(
        Arc::new(AlwaysProduce),
        MiningConfig {
            event_capacity: 4,
            overflow_policy: OverflowPolicy::DropOldest,
            ..Default::default()
        },
    );
    let mut slow = mining.subscribe();
    let handle = mining.clone().start(CancellationToken::new()).unwrap();

    mining.chain_head().wait_for_height(20).await;
    handle.stop().await.unwrap();

    let head = mining.clock().current_height();
    assert_eq!(slow.next().await, Some(head - 3));
    assert_eq!(slow.next().await, Some(head - 2));
}

#[tokio::test(start_paused = true)]
async fn backpressure_holds_the_chain() {
    setup_logging();
    let mining = mining(
        Arc::new(AlwaysProduce),
        MiningConfig {
            event_capacity: 2,
            overflow_policy: OverflowPolicy::Backpressure,
            ..Default::default()
        },
    );
    let mut slow = mining.subscribe();
    let handle = mining.clone().start(CancellationToken::new()).unwrap();

    // two queued heights, the third one waits for room
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(mining.clock().current_height(), 3);

    for expected in 1..=3 {
        assert_eq!(slow.next().await, Some(expected));
    }
    mining.chain_head().wait_for_height(5).await;

    // dropping the subscriber releases the loop
    drop(slow);
    mining.chain_head().wait_for_height(10).await;
    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stopping_finishes_the_block_in_progress() {
    setup_logging();
    let producer = Arc::new(SlowProducer {
        started: Notify::new(),
        duration: Duration::from_millis(40),
    });
    let mining = mining(producer.clone(), MiningConfig::default());
    let mut heights = mining.subscribe();
    let handle = mining.clone().start(CancellationToken::new()).unwrap();

    producer.started.notified().await;
    assert_eq!(handle.state(), MiningState::Running);
    handle.stop().await.unwrap();

    assert_eq!(mining.clock().current_height(), 1);
    assert_eq!(heights.next().await, Some(1));
}

#[tokio::test(start_paused = true)]
async fn devnet_shuts_down_cleanly() {
    setup_logging();
    let mut devnet = Devnet::builder()
        .block_time(Duration::from_millis(10))
        .build();
    let provider = devnet.register_provider(0, 0);
    devnet.pledge_sectors(provider, 2).await;
    devnet.start();

    devnet.wait_for_height(30).await;
    assert!(devnet.head().reached(30));
    assert!(devnet.height() >= 30);
    devnet.stop().await;
}
