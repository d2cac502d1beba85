//! Runner for worker lifecycle management.

use std::future::Future;
use std::time::Duration;

use tokio::signal;
use tokio::task::JoinHandle;

use modsight_common::init_tracing;

use crate::RuntimeArgs;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::trigger::{ShutdownListener, ShutdownSignal};

/// Default time a worker is given to finish its in-flight tick on shutdown.
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runner that manages the lifecycle of a service's workers.
///
/// Handles:
/// - Logging initialization
/// - Worker spawning, each with its own shutdown listener
/// - Cooperative shutdown on Ctrl+C: signal every worker, then wait for
///   each one to return
///
/// Workers are never aborted while a tick is in progress. A worker that
/// outlives the join timeout is reported and detached.
///
/// # Example
///
/// ```ignore
/// use modsight_runtime::{Runner, RuntimeArgs};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let args = RuntimeArgs::parse_with_default("master.json5");
///     let config = MasterConfig::load(&args.config)?;
///
///     let mut runner = Runner::new_with_args("modsight-master", &config, Some(&args))?;
///     runner.spawn_worker("acquisition", |shutdown| scheduler.run(trigger, shutdown));
///
///     runner.run().await
/// }
/// ```
pub struct Runner {
    /// Service name for logging.
    name: String,
    /// Service version.
    version: String,
    /// Shutdown broadcast shared by all workers.
    shutdown: ShutdownSignal,
    /// Spawned workers, in spawn order.
    workers: Vec<(String, JoinHandle<()>)>,
    /// Time allowed for each worker to return after shutdown.
    join_timeout: Duration,
}

impl Runner {
    /// Create a runner without touching the global tracing subscriber.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            shutdown: ShutdownSignal::new(),
            workers: Vec::new(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    /// Create a runner and initialize logging from the configuration.
    ///
    /// A `--log-level` given on the command line overrides the config file.
    pub fn new_with_args<C: RuntimeConfig>(
        name: impl Into<String>,
        config: &C,
        args: Option<&RuntimeArgs>,
    ) -> Result<Self> {
        let level = args.and_then(|a| a.log_level.as_deref());
        let log_config = config.logging().with_level_override(level);

        init_tracing(&log_config)?;

        let runner = Self::new(name);
        tracing::info!(service = %runner.name, version = %runner.version, "Starting service");
        Ok(runner)
    }

    /// Set how long each worker may take to return after shutdown.
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Create an additional shutdown listener (e.g. for a tick clock).
    pub fn shutdown_listener(&self) -> ShutdownListener {
        self.shutdown.subscribe()
    }

    /// Number of spawned workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Spawn a worker task that receives its own shutdown listener.
    pub fn spawn_worker<F, Fut>(&mut self, name: impl Into<String>, worker: F)
    where
        F: FnOnce(ShutdownListener) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let handle = tokio::spawn(worker(self.shutdown.subscribe()));
        tracing::debug!(worker = %name, "Worker spawned");
        self.workers.push((name, handle));
    }

    /// Track an already spawned task so it is joined on shutdown.
    pub fn track(&mut self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.workers.push((name.into(), handle));
    }

    /// Run until Ctrl+C is received, then shut down cooperatively.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            }
        })
        .await
    }

    /// Run until the given future completes, then shut down cooperatively.
    pub async fn run_until<F>(self, stop: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            service = %self.name,
            workers = self.workers.len(),
            "Service running. Press Ctrl+C to stop."
        );

        stop.await;

        tracing::info!(service = %self.name, "Received shutdown signal");
        self.shutdown().await
    }

    /// Signal every worker and wait for each to finish its current tick.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.trigger();

        let mut failed = Vec::new();
        for (name, handle) in self.workers {
            match tokio::time::timeout(self.join_timeout, handle).await {
                Ok(Ok(())) => {
                    tracing::debug!(worker = %name, "Worker stopped");
                }
                Ok(Err(e)) => {
                    tracing::error!(worker = %name, error = %e, "Worker panicked");
                    failed.push(name);
                }
                Err(_) => {
                    tracing::warn!(
                        worker = %name,
                        timeout_ms = self.join_timeout.as_millis() as u64,
                        "Worker did not stop in time, detaching"
                    );
                    failed.push(name);
                }
            }
        }

        tracing::info!(service = %self.name, "Goodbye!");

        if failed.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::worker(format!(
                "workers did not stop cleanly: {}",
                failed.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::TickTrigger;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_shutdown_releases_parked_worker() {
        let mut runner = Runner::new("test");
        let trigger = TickTrigger::new();
        let stopped = Arc::new(AtomicBool::new(false));

        {
            let trigger = trigger.clone();
            let stopped = stopped.clone();
            runner.spawn_worker("parked", move |mut shutdown| async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.triggered() => break,
                        _ = trigger.wait() => {}
                    }
                }
                stopped.store(true, Ordering::SeqCst);
            });
        }

        assert_eq!(runner.worker_count(), 1);
        runner.run_until(async {}).await.unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_in_flight_tick_completes() {
        let mut runner = Runner::new("test");
        let trigger = TickTrigger::new();
        let completed = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(tokio::sync::Notify::new());

        {
            let trigger = trigger.clone();
            let completed = completed.clone();
            let started = started.clone();
            runner.spawn_worker("slow", move |mut shutdown| async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.triggered() => break,
                        _ = trigger.wait() => {
                            started.notify_one();
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            completed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            });
        }

        trigger.fire();
        started.notified().await;
        runner.shutdown().await.unwrap();

        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stuck_worker_reports_error() {
        let mut runner = Runner::new("test").with_join_timeout(Duration::from_millis(20));
        runner.spawn_worker("stuck", |_shutdown| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let result = runner.shutdown().await;
        assert!(matches!(result, Err(RuntimeError::Worker(_))));
    }
}
