//! Tick-driven acquisition of configured point ranges.

use std::sync::Arc;

use modsight_runtime::{ShutdownListener, TickTrigger};
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::dispatcher::CommandDispatcher;

/// Issues a read for every item whose acquisition interval has elapsed.
///
/// Elapsed-tick counters are owned here, one per configuration item, and
/// the current tick counts toward the interval: an item with interval 3 is
/// read on ticks 3, 6, 9 and so on, and interval 1 reads on every tick.
///
/// This is not the cadence of a compare-then-increment counter, which reads
/// every N+1 ticks (interval 1 only every other tick). Devices tuned to that
/// cadence are polled slightly more often here.
pub struct AcquisitionScheduler {
    config: Arc<Configuration>,
    dispatcher: Arc<CommandDispatcher>,
    elapsed: Vec<u32>,
}

impl AcquisitionScheduler {
    pub fn new(config: Arc<Configuration>, dispatcher: Arc<CommandDispatcher>) -> Self {
        let elapsed = vec![0; config.items().len()];
        Self {
            config,
            dispatcher,
            elapsed,
        }
    }

    /// Run one tick. Returns the number of reads submitted.
    pub fn tick(&mut self) -> usize {
        let mut submitted = 0;

        for (index, item) in self.config.items().iter().enumerate() {
            let elapsed = self.elapsed[index].saturating_add(1);
            if elapsed < item.acquisition_interval {
                self.elapsed[index] = elapsed;
                continue;
            }

            self.elapsed[index] = 0;
            let result = self.dispatcher.execute_read_command(
                item,
                self.config.next_transaction_id(),
                self.config.unit_id(),
                item.start_address,
                item.number_of_registers,
            );

            match result {
                Ok(()) => submitted += 1,
                Err(e) => warn!(
                    point_type = %item.registry_type,
                    start_address = item.start_address,
                    error = %e,
                    "Acquisition of '{}' failed",
                    item.description
                ),
            }
        }

        submitted
    }

    /// Tick on every trigger until shutdown is requested.
    pub async fn run(mut self, trigger: TickTrigger, mut shutdown: ShutdownListener) {
        info!(
            "Acquisition scheduler started with {} item(s)",
            self.config.items().len()
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                _ = trigger.wait() => {
                    let submitted = self.tick();
                    debug!("Acquisition tick submitted {} read(s)", submitted);
                }
            }
        }

        info!("Acquisition scheduler stopped");
    }
}
