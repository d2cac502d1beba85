//! Modbus TCP master.
//!
//! Polls a Modbus device on a fixed tick, keeps an in-memory point image
//! with alarm state, and runs the mixing vessel automation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use modsight_master::acquisition::AcquisitionScheduler;
use modsight_master::alarm::LimitAlarmPolicy;
use modsight_master::automation::{AutomationController, MixerAddresses};
use modsight_master::config::{Configuration, ConnectionConfig, MasterConfig};
use modsight_master::dispatcher::CommandDispatcher;
use modsight_master::executor::{FunctionExecutor, TcpExecutor, update_channel};
use modsight_master::point::MemoryPointStore;
use modsight_master::simulator::SimulatedDevice;
use modsight_runtime::{
    Runner, RuntimeArgs, RuntimeConfig, ShutdownSignal, TickClock, TickTrigger,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Time allowed for the transport and intake to flush after the workers stop.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let args = RuntimeArgs::parse_with_default("master.json5");

    let config = MasterConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let mut runner = Runner::new_with_args("modsight-master", &config, Some(&args))?;
    info!("Loaded configuration from {:?}", args.config);

    let config_dir = args.config.parent().unwrap_or(Path::new("."));
    let configuration = Arc::new(
        Configuration::load(&config, config_dir).with_context(|| {
            format!(
                "Failed to load points file {:?}",
                config.points_path(config_dir)
            )
        })?,
    );
    info!(
        "Loaded {} point range(s), unit id {}",
        configuration.items().len(),
        configuration.unit_id()
    );

    let store = Arc::new(MemoryPointStore::from_items(configuration.items()));
    let (updates_tx, updates_rx) = update_channel();

    // Stopped only after the workers, so their final writes reach the device.
    let transport_stop = ShutdownSignal::new();
    let intake_stop = ShutdownSignal::new();

    let (executor, transport): (Arc<dyn FunctionExecutor>, Option<JoinHandle<()>>) =
        match &config.modbus.connection {
            ConnectionConfig::Tcp { host, port } => {
                let (executor, handle) = TcpExecutor::spawn(
                    host.clone(),
                    *port,
                    config.request_timeout(),
                    config.modbus.queue_capacity,
                    updates_tx,
                    transport_stop.subscribe(),
                );
                (Arc::new(executor), Some(handle))
            }
            ConnectionConfig::Simulated => {
                info!("Using simulated Modbus device");
                (Arc::new(SimulatedDevice::new(updates_tx)), None)
            }
        };

    let dispatcher = Arc::new(CommandDispatcher::new(
        store.clone(),
        Arc::new(LimitAlarmPolicy),
        executor,
    ));
    dispatcher.seed_points(configuration.items());
    if store.is_empty() {
        warn!("Point store is empty; acquisition will not poll anything");
    } else {
        info!("Point store ready with {} point(s)", store.len());
    }

    let intake = {
        let dispatcher = dispatcher.clone();
        let shutdown = intake_stop.subscribe();
        tokio::spawn(async move { dispatcher.run_intake(updates_rx, shutdown).await })
    };

    let acquisition_trigger = TickTrigger::new();
    runner.track(
        "acquisition-clock",
        TickClock::spawn(
            Duration::from_millis(config.acquisition.tick_ms),
            vec![acquisition_trigger.clone()],
            runner.shutdown_listener(),
        ),
    );
    let scheduler = AcquisitionScheduler::new(configuration.clone(), dispatcher.clone());
    runner.spawn_worker("acquisition", move |shutdown| {
        scheduler.run(acquisition_trigger, shutdown)
    });

    if config.automation.enabled {
        let addresses = MixerAddresses::from_config(&config.automation)?;
        let automation_trigger = TickTrigger::new();
        runner.track(
            "automation-clock",
            TickClock::spawn(
                Duration::from_millis(config.automation.tick_ms),
                vec![automation_trigger.clone()],
                runner.shutdown_listener(),
            ),
        );
        let controller =
            AutomationController::new(configuration.clone(), dispatcher.clone(), addresses);
        runner.spawn_worker("automation", move |shutdown| {
            controller.run(automation_trigger, shutdown)
        });
    } else {
        info!("Mixer automation disabled");
    }

    let result = runner.run().await;

    transport_stop.trigger();
    if let Some(handle) = transport {
        join("transport", handle).await;
    }
    intake_stop.trigger();
    join("intake", intake).await;

    info!("Modbus master stopped");
    Ok(result?)
}

async fn join(name: &str, handle: JoinHandle<()>) {
    match tokio::time::timeout(FLUSH_TIMEOUT, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Task '{}' panicked: {}", name, e),
        Err(_) => warn!("Task '{}' did not stop within {:?}", name, FLUSH_TIMEOUT),
    }
}
