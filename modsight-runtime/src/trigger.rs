//! Wake and shutdown signals for tick-driven workers.
//!
//! Workers park on a [`TickTrigger`] between ticks and on a
//! [`ShutdownListener`] for cooperative cancellation:
//!
//! ```ignore
//! loop {
//!     tokio::select! {
//!         biased;
//!         _ = shutdown.triggered() => break,
//!         _ = trigger.wait() => worker.tick(),
//!     }
//! }
//! ```
//!
//! A tick body runs to completion once selected; shutdown is only observed
//! at the next park.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

/// Auto-reset wake signal.
///
/// Firing while nobody waits stores a single permit, so a worker that is
/// busy when the tick arrives runs exactly one more iteration afterwards.
#[derive(Debug, Clone, Default)]
pub struct TickTrigger {
    notify: Arc<Notify>,
}

impl TickTrigger {
    /// Create a new trigger with no pending permit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake one parked worker (or store a permit for the next wait).
    pub fn fire(&self) {
        self.notify.notify_one();
    }

    /// Park until the trigger fires.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Sending half of the cooperative shutdown signal.
#[derive(Debug)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// Create a new, untriggered shutdown signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Create a listener for a worker.
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }

    /// Request shutdown. Every listener, parked or not, observes it.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether shutdown was requested.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Receiving half of the cooperative shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolve once shutdown is requested or the signal is dropped.
    pub async fn triggered(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Whether shutdown was requested, without waiting.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Periodic source that fires a set of triggers once per period.
pub struct TickClock;

impl TickClock {
    /// Spawn the clock task. The first tick fires one full period after start.
    pub fn spawn(
        period: Duration,
        triggers: Vec<TickTrigger>,
        mut shutdown: ShutdownListener,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::debug!(
                period_ms = period.as_millis() as u64,
                triggers = triggers.len(),
                "Tick clock started"
            );

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.triggered() => break,
                    _ = ticker.tick() => {
                        for trigger in &triggers {
                            trigger.fire();
                        }
                    }
                }
            }

            tracing::debug!("Tick clock stopped");
        })
    }
}
