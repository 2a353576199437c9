use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use primitives_proofs::BlockNumber;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch, Mutex,
    },
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::CancellationToken;

use crate::{
    clock::EpochClock,
    events::{ChainHead, HeightPublisher, HeightSubscription, OverflowPolicy},
};

const LOG_TARGET: &str = "scheduler::mining";

/// Default time between two blocks.
pub const DEFAULT_BLOCK_TIME: Duration = Duration::from_millis(100);

/// Default number of undelivered heights kept per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to produce block {height}: {reason}")]
pub struct BlockProductionError {
    pub height: BlockNumber,
    pub reason: String,
}

/// Produces the block at a given height.
#[async_trait]
pub trait BlockProducer: Send + Sync {
    async fn produce_block(&self, height: BlockNumber) -> Result<(), BlockProductionError>;
}

/// A producer that never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysProduce;

#[async_trait]
impl BlockProducer for AlwaysProduce {
    async fn produce_block(&self, _height: BlockNumber) -> Result<(), BlockProductionError> {
        Ok(())
    }
}

/// Reaction of the mining loop to a failed block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum OnBlockError {
    /// Report the error and try again at the next tick.
    #[default]
    Continue,
    /// Report the error and stop mining.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiningConfig {
    pub block_time: Duration,
    pub on_error: OnBlockError,
    pub event_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            block_time: DEFAULT_BLOCK_TIME,
            on_error: OnBlockError::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MiningError {
    #[error(transparent)]
    BlockProduction(#[from] BlockProductionError),
    #[error("the mining loop is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Join(#[from] JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningState {
    Running,
    Stopped,
}

/// Produces a block every `block_time` and publishes the new height.
pub struct MiningLoop {
    clock: Arc<EpochClock>,
    producer: Arc<dyn BlockProducer>,
    publisher: HeightPublisher,
    config: MiningConfig,
    /// Serializes block production between the loop and manual mining.
    producing: Mutex<()>,
    running: AtomicBool,
}

impl MiningLoop {
    pub fn new(
        clock: Arc<EpochClock>,
        producer: Arc<dyn BlockProducer>,
        config: MiningConfig,
    ) -> Self {
        Self {
            clock,
            producer,
            publisher: HeightPublisher::new(config.overflow_policy, config.event_capacity),
            config,
            producing: Mutex::new(()),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &MiningConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<EpochClock> {
        &self.clock
    }

    /// Subscribes to every height produced from now on.
    pub fn subscribe(&self) -> HeightSubscription {
        self.publisher.subscribe()
    }

    pub fn chain_head(&self) -> ChainHead {
        self.clock.subscribe()
    }

    /// Produces exactly one block, on demand.
    pub async fn mine_one(&self) -> Result<BlockNumber, BlockProductionError> {
        let _producing = self.producing.lock().await;
        let height = self.clock.current_height() + 1;
        self.producer.produce_block(height).await?;

        let height = self.clock.advance();
        tracing::debug!(target: LOG_TARGET, height, "block produced");
        self.publisher.publish(height).await;
        Ok(height)
    }

    /// Mines until `height` is reached.
    pub async fn mine_until(&self, height: BlockNumber) -> Result<BlockNumber, BlockProductionError> {
        let mut current = self.clock.current_height();
        while current < height {
            current = self.mine_one().await?;
        }
        Ok(current)
    }

    /// Starts mining in the background until `token` is cancelled or the
    /// handle is stopped.
    pub fn start(self: Arc<Self>, token: CancellationToken) -> Result<MiningHandle, MiningError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MiningError::AlreadyRunning);
        }
        let (state_tx, state) = watch::channel(MiningState::Running);
        let (errors_tx, errors) = mpsc::channel(self.config.event_capacity.max(1));
        let token = token.child_token();
        let task = tokio::spawn(self.run(token.clone(), state_tx, errors_tx));

        Ok(MiningHandle {
            token,
            state,
            task,
            errors,
        })
    }

    #[tracing::instrument(skip_all, fields(block_time = ?self.config.block_time))]
    async fn run(
        self: Arc<Self>,
        token: CancellationToken,
        state: watch::Sender<MiningState>,
        errors: mpsc::Sender<BlockProductionError>,
    ) -> Result<(), MiningError> {
        tracing::info!(target: LOG_TARGET, height = self.clock.current_height(), "mining started");
        let result = loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break Ok(()),
                () = self.clock.sleep_until_next(self.config.block_time) => {}
            }

            // A stop requested while the block is produced takes effect after it.
            if let Err(err) = self.mine_one().await {
                tracing::error!(target: LOG_TARGET, %err, "block production failed");
                if let Err(TrySendError::Full(dropped)) = errors.try_send(err.clone()) {
                    tracing::warn!(target: LOG_TARGET, height = dropped.height, "error queue full, dropping error");
                }
                if self.config.on_error == OnBlockError::Stop {
                    break Err(err.into());
                }
            }
        };

        self.running.store(false, Ordering::SeqCst);
        state.send_replace(MiningState::Stopped);
        tracing::info!(target: LOG_TARGET, height = self.clock.current_height(), "mining stopped");
        result
    }
}

/// Control over a running [`MiningLoop`].
pub struct MiningHandle {
    token: CancellationToken,
    state: watch::Receiver<MiningState>,
    task: JoinHandle<Result<(), MiningError>>,
    errors: mpsc::Receiver<BlockProductionError>,
}

impl MiningHandle {
    pub fn state(&self) -> MiningState {
        *self.state.borrow()
    }

    /// Waits until the loop has stopped, for whatever reason.
    pub async fn stopped(&mut self) {
        let _ = self
            .state
            .wait_for(|state| *state == MiningState::Stopped)
            .await;
    }

    /// Block production failures, in the order they happened.
    ///
    /// Holds at most `event_capacity` failures; newer ones are dropped until it is read.
    pub fn errors(&mut self) -> &mut mpsc::Receiver<BlockProductionError> {
        &mut self.errors
    }

    /// Requests a stop and waits for the loop to exit.
    pub async fn stop(self) -> Result<(), MiningError> {
        self.token.cancel();
        self.task.await?
    }

    /// Waits for the loop to exit on its own.
    pub async fn join(self) -> Result<(), MiningError> {
        self.task.await?
    }
}
