//! Mixing vessel process controller.
//!
//! One state machine step per tick. The controller reads its start signal
//! and valve states from the point store and drives every output through
//! the [`CommandDispatcher`], the same path an external operator uses.
//!
//! ```text
//! Idle --start--> FillingChocolate --100--> FillingMilk --250--> FillingWater
//!      --370--> Mixing --10 ticks--> Emptying --0--> Idle
//! ```
//!
//! Any ingredient valve observed open while mixing triggers an emergency
//! stop straight to Emptying.

use std::sync::Arc;

use modsight_runtime::{ShutdownListener, TickTrigger};
use tracing::{debug, info, warn};

use crate::config::{AutomationConfig, ConfigError, Configuration};
use crate::convert;
use crate::dispatcher::CommandDispatcher;
use crate::point::{PointIdentifier, PointStore, PointType};

/// Chocolate added per tick.
pub const CHOCOLATE_RATE: f64 = 50.0;
/// Milk added per tick.
pub const MILK_RATE: f64 = 50.0;
/// Water added per tick.
pub const WATER_RATE: f64 = 30.0;
/// Amount drained per tick.
pub const DRAIN_RATE: f64 = 100.0;

/// Contents after the chocolate phase.
pub const CHOCOLATE_TARGET: f64 = 100.0;
/// Contents after the milk phase.
pub const MILK_TARGET: f64 = 250.0;
/// Contents after the water phase.
pub const WATER_TARGET: f64 = 370.0;
/// Ticks spent mixing.
pub const MIXING_TICKS: u32 = 10;

const ON: i32 = 1;
const OFF: i32 = 0;

/// Mixer process state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MixerState {
    #[default]
    Idle,
    FillingChocolate,
    FillingMilk,
    FillingWater,
    Mixing,
    Emptying,
    /// Held for manual reset; nothing transitions here yet.
    Error,
}

/// Coil and register addresses used by the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixerAddresses {
    pub start: u16,
    pub motor: u16,
    /// Chocolate, milk, water, drain.
    pub valves: [u16; 4],
    pub contents: u16,
}

impl MixerAddresses {
    pub fn from_config(config: &AutomationConfig) -> Result<Self, ConfigError> {
        let valves = config.valve_addresses.as_slice().try_into().map_err(|_| {
            ConfigError::Validation(format!(
                "expected 4 valve addresses, got {}",
                config.valve_addresses.len()
            ))
        })?;

        Ok(Self {
            start: config.start_address,
            motor: config.motor_address,
            valves,
            contents: config.contents_address,
        })
    }

    fn chocolate(&self) -> u16 {
        self.valves[0]
    }

    fn milk(&self) -> u16 {
        self.valves[1]
    }

    fn water(&self) -> u16 {
        self.valves[2]
    }

    fn drain(&self) -> u16 {
        self.valves[3]
    }
}

impl Default for MixerAddresses {
    fn default() -> Self {
        Self {
            start: 3000,
            motor: 3001,
            valves: [4000, 4001, 4002, 4003],
            contents: 1000,
        }
    }
}

/// Safety-interlocked mixing process.
pub struct AutomationController {
    config: Arc<Configuration>,
    dispatcher: Arc<CommandDispatcher>,
    store: Arc<dyn PointStore>,
    addresses: MixerAddresses,
    state: MixerState,
    timer: u32,
    contents: f64,
}

impl AutomationController {
    pub fn new(
        config: Arc<Configuration>,
        dispatcher: Arc<CommandDispatcher>,
        addresses: MixerAddresses,
    ) -> Self {
        let store = dispatcher.store().clone();
        Self {
            config,
            dispatcher,
            store,
            addresses,
            state: MixerState::Idle,
            timer: 0,
            contents: 0.0,
        }
    }

    pub fn state(&self) -> MixerState {
        self.state
    }

    /// Current mixer contents.
    pub fn contents(&self) -> f64 {
        self.contents
    }

    /// Ticks spent in the current state.
    pub fn timer(&self) -> u32 {
        self.timer
    }

    /// Advance the process by one tick, then publish the contents.
    pub fn step(&mut self) {
        match self.state {
            MixerState::Idle => self.idle(),
            MixerState::FillingChocolate => self.fill(
                CHOCOLATE_RATE,
                CHOCOLATE_TARGET,
                self.addresses.chocolate(),
                self.addresses.milk(),
                MixerState::FillingMilk,
            ),
            MixerState::FillingMilk => self.fill(
                MILK_RATE,
                MILK_TARGET,
                self.addresses.milk(),
                self.addresses.water(),
                MixerState::FillingWater,
            ),
            MixerState::FillingWater => self.fill(
                WATER_RATE,
                WATER_TARGET,
                self.addresses.water(),
                self.addresses.motor,
                MixerState::Mixing,
            ),
            MixerState::Mixing => self.mix(),
            MixerState::Emptying => self.empty(),
            MixerState::Error => {}
        }

        self.publish_contents();
    }

    fn idle(&mut self) {
        if self.signal(self.addresses.start) == 1 && self.contents == 0.0 {
            self.set_digital(self.addresses.chocolate(), ON);
            self.set_digital(self.addresses.milk(), OFF);
            self.set_digital(self.addresses.water(), OFF);
            self.set_digital(self.addresses.drain(), OFF);
            self.set_digital(self.addresses.motor, OFF);
            self.transition(MixerState::FillingChocolate);
        }
    }

    /// Add `rate`; at `target` close `close`, open `open` and move on.
    fn fill(&mut self, rate: f64, target: f64, close: u16, open: u16, next: MixerState) {
        self.timer += 1;
        self.contents += rate;

        if self.contents >= target {
            self.contents = target;
            self.set_digital(close, OFF);
            self.set_digital(open, ON);
            self.transition(next);
        }
    }

    fn mix(&mut self) {
        let ingredient_open = [
            self.addresses.chocolate(),
            self.addresses.milk(),
            self.addresses.water(),
        ]
        .into_iter()
        .any(|valve| self.signal(valve) == 1);

        if ingredient_open {
            self.emergency_stop();
            return;
        }

        self.timer += 1;
        if self.timer >= MIXING_TICKS {
            self.set_digital(self.addresses.motor, OFF);
            self.set_digital(self.addresses.drain(), ON);
            self.transition(MixerState::Emptying);
        }
    }

    fn empty(&mut self) {
        self.timer += 1;
        self.contents -= DRAIN_RATE;

        if self.contents <= 0.0 {
            self.contents = 0.0;
            self.set_digital(self.addresses.drain(), OFF);
            self.set_digital(self.addresses.start, OFF);
            self.transition(MixerState::Idle);
        }
    }

    /// Stop the motor, close the ingredient valves and drain.
    pub fn emergency_stop(&mut self) {
        warn!(
            timer = self.timer,
            contents = self.contents,
            "Ingredient valve open during mixing, emergency stop"
        );

        self.set_digital(self.addresses.motor, OFF);
        self.set_digital(self.addresses.chocolate(), OFF);
        self.set_digital(self.addresses.milk(), OFF);
        self.set_digital(self.addresses.water(), OFF);
        self.set_digital(self.addresses.drain(), ON);
        self.transition(MixerState::Emptying);
    }

    /// Close every valve and stop the motor, whatever the state.
    pub fn safe_shutdown(&mut self) {
        info!(state = ?self.state, "Driving mixer outputs to safe state");
        for valve in self.addresses.valves {
            self.set_digital(valve, OFF);
        }
        self.set_digital(self.addresses.motor, OFF);
    }

    /// Step on every trigger until shutdown, then drive outputs to safe state.
    pub async fn run(mut self, trigger: TickTrigger, mut shutdown: ShutdownListener) {
        info!("Mixer automation started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                _ = trigger.wait() => self.step(),
            }
        }

        self.safe_shutdown();
        info!("Mixer automation stopped");
    }

    fn transition(&mut self, next: MixerState) {
        info!(contents = self.contents, "Mixer {:?} -> {:?}", self.state, next);
        self.state = next;
        self.timer = 0;
    }

    /// Raw value of a coil, 0 if unknown.
    fn signal(&self, address: u16) -> u16 {
        self.store
            .get_points(&[PointIdentifier::new(PointType::DigitalOutput, address)])
            .first()
            .map(|point| point.raw_value)
            .unwrap_or(0)
    }

    fn set_digital(&self, address: u16, value: i32) {
        let Some(item) = self
            .config
            .find_item(address, &[PointType::DigitalOutput, PointType::DigitalInput])
        else {
            warn!(address, "No digital point configured, skipping write");
            return;
        };

        if let Err(e) = self.dispatcher.execute_write_command(
            item,
            self.config.next_transaction_id(),
            self.config.unit_id(),
            address,
            value,
        ) {
            warn!(address, value, error = %e, "Automation write failed");
        }
    }

    fn publish_contents(&self) {
        let address = self.addresses.contents;
        let Some(item) = self.config.find_item(address, &[PointType::AnalogOutput]) else {
            debug!(address, "No contents register configured");
            return;
        };

        let raw = convert::to_raw(item.scale_factor, item.deviation, self.contents);
        if let Err(e) = self.dispatcher.write_raw(
            item,
            self.config.next_transaction_id(),
            self.config.unit_id(),
            address,
            raw,
        ) {
            warn!(address, error = %e, "Failed to publish mixer contents");
        }
    }
}
