//! Mixing process driven end to end through the simulated device.

use std::sync::Arc;

use modsight_master::alarm::LimitAlarmPolicy;
use modsight_master::automation::{AutomationController, MixerAddresses, MixerState};
use modsight_master::config::Configuration;
use modsight_master::dispatcher::CommandDispatcher;
use modsight_master::executor::{UpdateReceiver, update_channel};
use modsight_master::item::parse_points;
use modsight_master::point::{MemoryPointStore, PointIdentifier, PointType};
use modsight_master::simulator::SimulatedDevice;

const POINTS: &str = "\
; start signal and motor
DO_REG 2 3000 0 0 1 0 DO @Controls 1
; chocolate, milk, water, drain
DO_REG 4 4000 0 0 1 0 DO @Valves 1
HR_INT 1 1000 0 0 500 0 AO @Contents 1 1 0 0 400 380 0
";

struct Plant {
    config: Arc<Configuration>,
    store: Arc<MemoryPointStore>,
    device: Arc<SimulatedDevice>,
    dispatcher: Arc<CommandDispatcher>,
    controller: AutomationController,
    updates: UpdateReceiver,
}

impl Plant {
    fn new() -> Self {
        let items = parse_points(POINTS);
        let store = Arc::new(MemoryPointStore::from_items(&items));
        let (tx, updates) = update_channel();
        let device = Arc::new(SimulatedDevice::new(tx));
        let dispatcher = Arc::new(CommandDispatcher::new(
            store.clone(),
            Arc::new(LimitAlarmPolicy),
            device.clone(),
        ));
        dispatcher.seed_points(&items);

        let config = Arc::new(Configuration::new(items, 1));
        let controller =
            AutomationController::new(config.clone(), dispatcher.clone(), MixerAddresses::default());

        Self {
            config,
            store,
            device,
            dispatcher,
            controller,
            updates,
        }
    }

    /// Write a coil the way an operator would.
    fn operate(&mut self, address: u16, value: i32) {
        let item = self
            .config
            .find_item(address, &[PointType::DigitalOutput])
            .unwrap()
            .clone();
        self.dispatcher
            .execute_write_command(
                &item,
                self.config.next_transaction_id(),
                self.config.unit_id(),
                address,
                value,
            )
            .unwrap();
        self.dispatcher.apply_pending(&mut self.updates);
    }

    fn tick(&mut self) -> MixerState {
        self.controller.step();
        self.dispatcher.apply_pending(&mut self.updates);
        self.controller.state()
    }

    /// Tick until the state changes, returning the ticks taken.
    fn ticks_until(&mut self, state: MixerState) -> usize {
        for ticks in 1..=100 {
            if self.tick() == state {
                return ticks;
            }
        }
        panic!("never reached {:?}", state);
    }

    fn coil_point(&self, address: u16) -> u16 {
        self.store
            .get(PointIdentifier::new(PointType::DigitalOutput, address))
            .unwrap()
            .raw_value
    }
}

#[test]
fn full_cycle_tick_counts() {
    let mut plant = Plant::new();
    plant.operate(3000, 1);

    assert_eq!(plant.tick(), MixerState::FillingChocolate);
    assert_eq!(plant.ticks_until(MixerState::Mixing), 9);
    assert_eq!(plant.controller.contents(), 370.0);
    assert_eq!(plant.ticks_until(MixerState::Emptying), 10);

    // 370 drains at 100 per tick: 270, 170, 70, 0.
    assert_eq!(plant.ticks_until(MixerState::Idle), 4);
    assert_eq!(plant.controller.contents(), 0.0);
}

#[test]
fn outputs_follow_each_phase() {
    let mut plant = Plant::new();
    plant.operate(3000, 1);

    plant.tick();
    assert!(plant.device.coil(4000));

    plant.ticks_until(MixerState::FillingMilk);
    assert!(!plant.device.coil(4000));
    assert!(plant.device.coil(4001));
    assert_eq!(plant.device.holding_register(1000), 100);

    plant.ticks_until(MixerState::FillingWater);
    assert!(!plant.device.coil(4001));
    assert!(plant.device.coil(4002));
    assert_eq!(plant.device.holding_register(1000), 250);

    plant.ticks_until(MixerState::Mixing);
    assert!(!plant.device.coil(4002));
    assert!(plant.device.coil(3001));

    plant.ticks_until(MixerState::Emptying);
    assert!(!plant.device.coil(3001));
    assert!(plant.device.coil(4003));

    plant.ticks_until(MixerState::Idle);
    assert!(!plant.device.coil(4003));
    assert!(!plant.device.coil(3000));
    assert_eq!(plant.coil_point(3000), 0);
    assert_eq!(plant.device.holding_register(1000), 0);

    // Start was reset, so the process stays idle.
    assert_eq!(plant.tick(), MixerState::Idle);
}

#[test]
fn contents_point_tracks_process() {
    let mut plant = Plant::new();
    plant.operate(3000, 1);
    plant.ticks_until(MixerState::Mixing);

    let contents = plant
        .store
        .get(PointIdentifier::new(PointType::AnalogOutput, 1000))
        .unwrap();
    assert_eq!(contents.raw_value, 370);
    assert_eq!(contents.egu(), Some(370.0));
    assert!(contents.timestamp.is_some());
}

#[test]
fn ingredient_valve_during_mixing_triggers_emergency_stop() {
    let mut plant = Plant::new();
    plant.operate(3000, 1);
    plant.ticks_until(MixerState::Mixing);

    for _ in 0..3 {
        assert_eq!(plant.tick(), MixerState::Mixing);
    }
    assert_eq!(plant.controller.timer(), 3);

    plant.operate(4000, 1);
    assert_eq!(plant.tick(), MixerState::Emptying);
    assert_eq!(plant.controller.timer(), 0);

    assert!(!plant.device.coil(3001));
    assert!(!plant.device.coil(4000));
    assert!(!plant.device.coil(4001));
    assert!(!plant.device.coil(4002));
    assert!(plant.device.coil(4003));

    assert_eq!(plant.ticks_until(MixerState::Idle), 4);
}

#[test]
fn restarts_after_completed_cycle() {
    let mut plant = Plant::new();
    plant.operate(3000, 1);
    plant.tick();
    plant.ticks_until(MixerState::Idle);

    plant.operate(3000, 1);
    assert_eq!(plant.tick(), MixerState::FillingChocolate);
    assert_eq!(plant.controller.contents(), 0.0);
    assert!(plant.device.coil(4000));
}
