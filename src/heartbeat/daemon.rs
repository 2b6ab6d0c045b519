//! Interval-based tick source for the loop orchestrator.
//!
//! A background task fires on a fixed period and hands ticks to the
//! orchestrator through a single-slot channel. If the orchestrator is still
//! busy when the next tick fires, the tick is coalesced into the one already
//! waiting: a slow pass yields exactly one catch-up tick, never a queue.

use crate::config::schema::Cadences;
use crate::error::{LoopError, LoopResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One delivered tick.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    pub fired_at: Instant,
}

/// Tick source configured from [`Cadences`].
#[derive(Debug, Clone)]
pub struct Heartbeat {
    period: Duration,
}

impl Heartbeat {
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
        }
    }

    pub fn from_cadences(cadences: &Cadences) -> Self {
        Self::new(cadences.tick_period())
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Begin emitting ticks. The first tick fires immediately.
    ///
    /// The ticker exits cooperatively when `cancel` is triggered.
    pub fn start(&self, cancel: CancellationToken) -> TickStream {
        let (tx, rx) = mpsc::channel(1);
        let coalesced = Arc::new(AtomicU64::new(0));
        let period = self.period;
        let counter = coalesced.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            info!("Heartbeat started (period {:?})", period);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        info!("Heartbeat shutting down");
                        return;
                    }
                    fired_at = interval.tick() => {
                        match tx.try_send(Tick { fired_at }) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                counter.fetch_add(1, Ordering::Relaxed);
                                debug!("Tick coalesced: previous pass still running");
                            }
                            Err(TrySendError::Closed(_)) => {
                                debug!("Tick receiver dropped");
                                return;
                            }
                        }
                    }
                }
            }
        });

        TickStream {
            rx,
            handle,
            cancel,
            coalesced,
        }
    }
}

/// Receiving end of a running [`Heartbeat`].
pub struct TickStream {
    rx: mpsc::Receiver<Tick>,
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    coalesced: Arc<AtomicU64>,
}

impl TickStream {
    /// Wait for the next tick. `None` means the ticker has stopped.
    pub async fn next(&mut self) -> Option<Tick> {
        self.rx.recv().await
    }

    /// A tick that is already waiting, if any.
    pub fn try_next(&mut self) -> Option<Tick> {
        self.rx.try_recv().ok()
    }

    /// Number of ticks merged into an already pending one.
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    /// Request cooperative shutdown of the ticker.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop and wait for the ticker task to exit.
    pub async fn join(self) -> LoopResult<()> {
        self.cancel.cancel();
        self.handle
            .await
            .map_err(|e| LoopError::SchedulerFault(format!("ticker task failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_tick_is_immediate_and_in_order() {
        let hb = Heartbeat::new(Duration::from_secs(6));
        let mut ticks = hb.start(CancellationToken::new());
        let a = ticks.next().await.unwrap();
        let b = ticks.next().await.unwrap();
        assert!(b.fired_at > a.fired_at);
        assert_eq!(b.fired_at - a.fired_at, Duration::from_secs(6));
        ticks.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn missed_ticks_coalesce_into_one() {
        let hb = Heartbeat::new(Duration::from_secs(1));
        let mut ticks = hb.start(CancellationToken::new());
        ticks.next().await.unwrap();

        // Busy for five periods without receiving.
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }

        assert!(ticks.next().await.is_some());
        assert!(ticks.try_next().is_none());
        assert_eq!(ticks.coalesced(), 4);
        ticks.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_the_stream() {
        let hb = Heartbeat::new(Duration::from_secs(6));
        let cancel = CancellationToken::new();
        let mut ticks = hb.start(cancel.clone());
        ticks.next().await.unwrap();
        cancel.cancel();
        assert!(ticks.next().await.is_none());
        assert!(ticks.is_stopped());
    }
}
