//! Height-advance notifications.
//!
//! Two consumption styles are offered: a push stream of every produced height
//! ([`HeightSubscription`]) and a pull view of the latest height
//! ([`ChainHead`]) that can be polled or awaited.

use std::sync::{Mutex, PoisonError};

use futures::stream::{BoxStream, StreamExt};
use primitives_proofs::BlockNumber;
use serde::{Deserialize, Serialize};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc, watch,
};

const LOG_TARGET: &str = "scheduler::events";

/// What to do when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Drop the oldest undelivered height; mining never waits.
    #[default]
    DropOldest,
    /// Block the publisher until the subscriber catches up.
    Backpressure,
}

/// Fans produced heights out to subscribers, each with its own bounded queue.
#[derive(Debug)]
pub struct HeightPublisher {
    policy: OverflowPolicy,
    capacity: usize,
    broadcast: broadcast::Sender<BlockNumber>,
    queues: Mutex<Vec<mpsc::Sender<BlockNumber>>>,
}

impl HeightPublisher {
    pub fn new(policy: OverflowPolicy, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (broadcast, _) = broadcast::channel(capacity);
        Self {
            policy,
            capacity,
            broadcast,
            queues: Mutex::new(Vec::new()),
        }
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Delivers `height` to every subscriber.
    ///
    /// Returns immediately under [`OverflowPolicy::DropOldest`], otherwise waits
    /// for room in every subscriber queue.
    pub async fn publish(&self, height: BlockNumber) {
        match self.policy {
            OverflowPolicy::DropOldest => {
                // no subscribers is not an error
                let _ = self.broadcast.send(height);
            }
            OverflowPolicy::Backpressure => {
                let queues = self
                    .queues
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for queue in queues {
                    if queue.send(height).await.is_err() {
                        tracing::debug!(target: LOG_TARGET, "subscriber went away");
                    }
                }
                self.queues
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|queue| !queue.is_closed());
            }
        }
    }

    /// Subscribes to heights published from now on.
    pub fn subscribe(&self) -> HeightSubscription {
        let inner = match self.policy {
            OverflowPolicy::DropOldest => Subscription::Broadcast(self.broadcast.subscribe()),
            OverflowPolicy::Backpressure => {
                let (tx, rx) = mpsc::channel(self.capacity);
                self.queues
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(tx);
                Subscription::Queue(rx)
            }
        };
        HeightSubscription { inner }
    }
}

#[derive(Debug)]
enum Subscription {
    Broadcast(broadcast::Receiver<BlockNumber>),
    Queue(mpsc::Receiver<BlockNumber>),
}

/// A lazy, non-restartable sequence of produced heights.
#[derive(Debug)]
pub struct HeightSubscription {
    inner: Subscription,
}

impl HeightSubscription {
    /// Next produced height, `None` once the publisher is gone.
    pub async fn next(&mut self) -> Option<BlockNumber> {
        match &mut self.inner {
            Subscription::Broadcast(rx) => loop {
                match rx.recv().await {
                    Ok(height) => return Some(height),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(target: LOG_TARGET, skipped, "slow subscriber, dropped oldest heights");
                    }
                    Err(RecvError::Closed) => return None,
                }
            },
            Subscription::Queue(rx) => rx.recv().await,
        }
    }

    pub fn into_stream(self) -> BoxStream<'static, BlockNumber> {
        futures::stream::unfold(self, |mut subscription| async move {
            let height = subscription.next().await?;
            Some((height, subscription))
        })
        .boxed()
    }
}

/// Latest known height of a chain, or of a consumer following it.
#[derive(Debug, Clone)]
pub struct ChainHead {
    rx: watch::Receiver<BlockNumber>,
}

impl ChainHead {
    pub(crate) fn new(rx: watch::Receiver<BlockNumber>) -> Self {
        Self { rx }
    }

    pub fn current(&self) -> BlockNumber {
        *self.rx.borrow()
    }

    /// Poll-once form of [`ChainHead::wait_for_height`].
    pub fn reached(&self, height: BlockNumber) -> bool {
        self.current() >= height
    }

    /// Waits until the head is at least `height` and returns the head at that time.
    ///
    /// Returns `None` if the head stops moving before reaching it.
    pub async fn wait_for_height(&self, height: BlockNumber) -> Option<BlockNumber> {
        let mut rx = self.rx.clone();
        let reached = rx.wait_for(|current| *current >= height).await.ok().map(|h| *h);
        reached
    }
}
