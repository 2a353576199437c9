use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use primitives_proofs::BlockNumber;
use tokio::{sync::watch, time::Instant};

use crate::events::ChainHead;

/// Source of wall-clock time for the epoch clock.
#[async_trait]
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep_until(&self, deadline: Instant);
}

/// Tokio's clock, which can be paused and advanced in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTimeSource;

#[async_trait]
impl TimeSource for TokioTimeSource {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await
    }
}

/// Logical chain height.
///
/// Only the mining loop advances it, by exactly one block per produced block.
pub struct EpochClock {
    height: watch::Sender<BlockNumber>,
    next_tick: Mutex<Option<Instant>>,
    time: Arc<dyn TimeSource>,
}

impl EpochClock {
    pub fn new(genesis: BlockNumber) -> Self {
        Self::with_time_source(genesis, Arc::new(TokioTimeSource))
    }

    pub fn with_time_source(genesis: BlockNumber, time: Arc<dyn TimeSource>) -> Self {
        let (height, _) = watch::channel(genesis);
        Self {
            height,
            next_tick: Mutex::new(None),
            time,
        }
    }

    pub fn current_height(&self) -> BlockNumber {
        *self.height.borrow()
    }

    /// Moves the clock one block forward and returns the new height.
    pub(crate) fn advance(&self) -> BlockNumber {
        let mut advanced = 0;
        self.height.send_modify(|height| {
            *height += 1;
            advanced = *height;
        });
        advanced
    }

    /// Suspends until the next tick of a clock ticking every `interval`.
    ///
    /// The first tick is one interval away. When the caller falls behind, the
    /// missed ticks are not replayed: the next tick fires immediately and the
    /// schedule restarts from there.
    pub async fn sleep_until_next(&self, interval: Duration) {
        let deadline = {
            let mut next_tick = self
                .next_tick
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let now = self.time.now();
            let deadline = match *next_tick {
                Some(tick) => tick.max(now),
                None => now + interval,
            };
            *next_tick = Some(deadline + interval);
            deadline
        };
        self.time.sleep_until(deadline).await
    }

    /// Pull-based view of the height: poll it or wait for a threshold.
    pub fn subscribe(&self) -> ChainHead {
        ChainHead::new(self.height.subscribe())
    }
}

impl std::fmt::Debug for EpochClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochClock")
            .field("height", &self.current_height())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_monotonic() {
        let clock = EpochClock::new(5);
        assert_eq!(clock.current_height(), 5);
        assert_eq!(clock.advance(), 6);
        assert_eq!(clock.advance(), 7);
        assert_eq!(clock.current_height(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_are_evenly_spaced() {
        let clock = EpochClock::new(0);
        let start = Instant::now();
        let interval = Duration::from_millis(100);

        clock.sleep_until_next(interval).await;
        assert_eq!(start.elapsed(), interval);
        clock.sleep_until_next(interval).await;
        assert_eq!(start.elapsed(), interval * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missed_ticks_are_skipped() {
        let clock = EpochClock::new(0);
        let interval = Duration::from_millis(100);
        clock.sleep_until_next(interval).await;

        // stall for several ticks
        tokio::time::sleep(interval * 5).await;
        let late = Instant::now();
        clock.sleep_until_next(interval).await;
        assert_eq!(late.elapsed(), Duration::ZERO);
        clock.sleep_until_next(interval).await;
        assert_eq!(late.elapsed(), interval);
    }

    #[tokio::test]
    async fn subscribers_see_the_new_height() {
        let clock = EpochClock::new(0);
        let head = clock.subscribe();
        assert!(!head.reached(2));
        clock.advance();
        clock.advance();
        assert!(head.reached(2));
        assert_eq!(head.wait_for_height(2).await, Some(2));
    }
}
