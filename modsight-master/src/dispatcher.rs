//! Command dispatch and point update intake.
//!
//! [`CommandDispatcher`] turns typed read/write intents into encoded
//! commands for a [`FunctionExecutor`], and folds the executor's decoded
//! updates back into the point store with unit conversion and alarm
//! classification.

use std::sync::Arc;

use chrono::Local;
use modsight_runtime::ShutdownListener;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::alarm::AlarmPolicy;
use crate::codec::{CodecError, ModbusFunction};
use crate::convert;
use crate::executor::{ExecutorError, FunctionExecutor, PointUpdate, UpdateReceiver};
use crate::item::ConfigItem;
use crate::params::{CommandParameters, FunctionCode, REQUEST_LENGTH};
use crate::point::{AlarmKind, DigitalState, Point, PointIdentifier, PointStore, PointType, PointValue};

/// Errors returned to the caller of a read or write command.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

/// Read function used to poll each point type.
pub fn read_function_code(point_type: PointType) -> FunctionCode {
    match point_type {
        PointType::DigitalOutput => FunctionCode::ReadCoils,
        PointType::DigitalInput => FunctionCode::ReadDiscreteInputs,
        PointType::AnalogInput => FunctionCode::ReadInputRegisters,
        PointType::AnalogOutput | PointType::HrLong => FunctionCode::ReadHoldingRegisters,
    }
}

/// Whether an analog write value should be treated as engineering units.
///
/// Values beyond the register range are always engineering units. Values
/// above 1000 are too, when the item has a non-unit scale factor.
pub fn looks_like_engineering_units(value: i32, item: &ConfigItem) -> bool {
    value.unsigned_abs() > u32::from(u16::MAX) || (value > 1000 && item.scale_factor != 1.0)
}

/// Builds commands and applies decoded updates.
pub struct CommandDispatcher {
    store: Arc<dyn PointStore>,
    alarms: Arc<dyn AlarmPolicy>,
    executor: Arc<dyn FunctionExecutor>,
}

impl CommandDispatcher {
    pub fn new(
        store: Arc<dyn PointStore>,
        alarms: Arc<dyn AlarmPolicy>,
        executor: Arc<dyn FunctionExecutor>,
    ) -> Self {
        Self {
            store,
            alarms,
            executor,
        }
    }

    /// Point store updated by this dispatcher.
    pub fn store(&self) -> &Arc<dyn PointStore> {
        &self.store
    }

    /// Submit a read of `quantity` points starting at `start_address`.
    pub fn execute_read_command(
        &self,
        item: &ConfigItem,
        transaction_id: u16,
        unit_id: u8,
        start_address: u16,
        quantity: u16,
    ) -> Result<(), DispatchError> {
        let code = read_function_code(item.registry_type);
        let params = CommandParameters::read(
            REQUEST_LENGTH,
            code.as_u8(),
            start_address,
            quantity,
            transaction_id,
            unit_id,
        );

        self.submit(params).inspect_err(|e| {
            error!(
                transaction_id,
                start_address,
                quantity,
                error = %e,
                "Error executing read command for {}",
                code
            );
        })
    }

    /// Submit a write of `value` to a coil or holding register.
    ///
    /// Coils take any non-zero value as ON. For registers, `value` is
    /// converted from engineering units when
    /// [`looks_like_engineering_units`] says so, otherwise it is clamped to
    /// the register range and written as-is.
    pub fn execute_write_command(
        &self,
        item: &ConfigItem,
        transaction_id: u16,
        unit_id: u8,
        address: u16,
        value: i32,
    ) -> Result<(), DispatchError> {
        let result = match item.registry_type {
            PointType::DigitalOutput => {
                self.write_coil(transaction_id, unit_id, address, value != 0)
            }
            PointType::AnalogOutput | PointType::HrLong => {
                let raw = if looks_like_engineering_units(value, item) {
                    convert::to_raw(item.scale_factor, item.deviation, f64::from(value))
                } else {
                    value.clamp(0, i32::from(u16::MAX)) as u16
                };
                self.write_register(transaction_id, unit_id, address, raw)
            }
            other => Err(DispatchError::InvalidArgument(format!(
                "cannot write to {} point",
                other
            ))),
        };

        result.inspect_err(|e| {
            error!(
                transaction_id,
                address,
                value,
                error = %e,
                "Error executing write command"
            );
        })
    }

    /// Write a raw register value (or coil state, non-zero is ON).
    pub fn write_raw(
        &self,
        item: &ConfigItem,
        transaction_id: u16,
        unit_id: u8,
        address: u16,
        raw: u16,
    ) -> Result<(), DispatchError> {
        let result = match item.registry_type {
            PointType::DigitalOutput => self.write_coil(transaction_id, unit_id, address, raw != 0),
            PointType::AnalogOutput | PointType::HrLong => {
                self.write_register(transaction_id, unit_id, address, raw)
            }
            other => Err(DispatchError::InvalidArgument(format!(
                "cannot write to {} point",
                other
            ))),
        };

        result.inspect_err(|e| {
            error!(transaction_id, address, raw, error = %e, "Error writing raw value");
        })
    }

    /// Convert an engineering-unit value with the item's scaling and write it.
    pub fn write_engineering_units(
        &self,
        item: &ConfigItem,
        transaction_id: u16,
        unit_id: u8,
        address: u16,
        egu: f64,
    ) -> Result<(), DispatchError> {
        if !matches!(
            item.registry_type,
            PointType::AnalogOutput | PointType::HrLong
        ) {
            let e = DispatchError::InvalidArgument(format!(
                "{} point has no engineering units",
                item.registry_type
            ));
            error!(transaction_id, address, egu, error = %e, "Error writing engineering units");
            return Err(e);
        }

        let raw = convert::to_raw(item.scale_factor, item.deviation, egu);
        self.write_register(transaction_id, unit_id, address, raw)
            .inspect_err(|e| {
                error!(transaction_id, address, egu, error = %e, "Error writing engineering units");
            })
    }

    fn write_coil(
        &self,
        transaction_id: u16,
        unit_id: u8,
        address: u16,
        on: bool,
    ) -> Result<(), DispatchError> {
        self.submit(CommandParameters::write(
            REQUEST_LENGTH,
            FunctionCode::WriteSingleCoil.as_u8(),
            address,
            u16::from(on),
            transaction_id,
            unit_id,
        ))
    }

    fn write_register(
        &self,
        transaction_id: u16,
        unit_id: u8,
        address: u16,
        raw: u16,
    ) -> Result<(), DispatchError> {
        self.submit(CommandParameters::write(
            REQUEST_LENGTH,
            FunctionCode::WriteSingleRegister.as_u8(),
            address,
            raw,
            transaction_id,
            unit_id,
        ))
    }

    fn submit(&self, params: CommandParameters) -> Result<(), DispatchError> {
        let function = ModbusFunction::from_parameters(params)?;
        self.executor.enqueue(function)?;
        Ok(())
    }

    /// Apply one decoded value. Returns `false` if no such point exists.
    pub fn apply_update(&self, update: PointUpdate) -> bool {
        let id = PointIdentifier::new(update.point_type, update.address);
        let alarms = self.alarms.as_ref();

        let found = self
            .store
            .update_point(id, &mut |point| process_point(point, update.raw, alarms));

        if !found {
            trace!(point = %id, "No point for update, ignoring");
        }
        found
    }

    /// Seed a point with its default value before polling starts.
    pub fn initialize_point(&self, point_type: PointType, address: u16, default_value: u16) {
        self.apply_update(PointUpdate {
            point_type,
            address,
            raw: default_value,
        });
    }

    /// Seed every point covered by `items` with the item's default value.
    pub fn seed_points(&self, items: &[Arc<ConfigItem>]) -> usize {
        let mut seeded = 0;
        for item in items {
            for address in item.addresses() {
                self.initialize_point(item.registry_type, address, item.default_value);
                seeded += 1;
            }
        }
        debug!("Seeded {} point(s) with default values", seeded);
        seeded
    }

    /// Apply every update already waiting in the channel.
    pub fn apply_pending(&self, updates: &mut UpdateReceiver) -> usize {
        let mut applied = 0;
        while let Ok(update) = updates.try_recv() {
            self.apply_update(update);
            applied += 1;
        }
        applied
    }

    /// Consume decoded updates until the executor goes away or shutdown is
    /// requested. Updates already queued at shutdown are still applied.
    pub async fn run_intake(&self, mut updates: UpdateReceiver, mut shutdown: ShutdownListener) {
        info!("Point update intake started");

        loop {
            tokio::select! {
                biased;
                update = updates.recv() => match update {
                    Some(update) => {
                        self.apply_update(update);
                    }
                    None => break,
                },
                _ = shutdown.triggered() => {
                    updates.close();
                    let drained = self.apply_pending(&mut updates);
                    debug!("Applied {} pending update(s) at shutdown", drained);
                    break;
                }
            }
        }

        info!("Point update intake stopped");
    }
}

fn process_point(point: &mut Point, raw: u16, alarms: &dyn AlarmPolicy) {
    point.raw_value = raw;
    point.timestamp = Some(Local::now());

    if point.id.point_type.is_analog() {
        let egu = convert::to_egu(point.item.scale_factor, point.item.deviation, raw);
        point.value = PointValue::Analog { egu };
        point.alarm = alarms.analog_alarm(egu, &point.item).unwrap_or_else(|e| {
            warn!(point = %point.id, error = %e, "Analog alarm evaluation failed");
            AlarmKind::ReasonabilityFailure
        });
    } else {
        point.value = PointValue::Digital {
            state: DigitalState::from(raw != 0),
        };
        point.alarm = alarms.digital_alarm(raw, &point.item).unwrap_or_else(|e| {
            warn!(point = %point.id, error = %e, "Digital alarm evaluation failed");
            AlarmKind::AbnormalValue
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{AlarmError, LimitAlarmPolicy};
    use crate::executor::{UpdateSender, update_channel};
    use crate::point::MemoryPointStore;
    use crate::simulator::SimulatedDevice;
    use modsight_runtime::ShutdownSignal;

    struct Harness {
        store: Arc<MemoryPointStore>,
        device: Arc<SimulatedDevice>,
        dispatcher: CommandDispatcher,
        updates: UpdateReceiver,
    }

    fn item(row: &str) -> Arc<ConfigItem> {
        Arc::new(ConfigItem::parse_row(row).unwrap())
    }

    fn harness_with(items: &[Arc<ConfigItem>], alarms: Arc<dyn AlarmPolicy>) -> Harness {
        let store = Arc::new(MemoryPointStore::from_items(items));
        let (tx, updates) = update_channel();
        let device = Arc::new(SimulatedDevice::new(tx));
        let dispatcher = CommandDispatcher::new(store.clone(), alarms, device.clone());
        Harness {
            store,
            device,
            dispatcher,
            updates,
        }
    }

    fn harness(items: &[Arc<ConfigItem>]) -> Harness {
        harness_with(items, Arc::new(LimitAlarmPolicy))
    }

    struct FailingPolicy;

    impl AlarmPolicy for FailingPolicy {
        fn analog_alarm(&self, egu: f64, _item: &ConfigItem) -> Result<AlarmKind, AlarmError> {
            Err(AlarmError::NotFinite(egu))
        }

        fn digital_alarm(&self, raw: u16, _item: &ConfigItem) -> Result<AlarmKind, AlarmError> {
            Err(AlarmError::NotFinite(f64::from(raw)))
        }
    }

    #[test]
    fn test_read_function_codes() {
        assert_eq!(
            read_function_code(PointType::DigitalOutput),
            FunctionCode::ReadCoils
        );
        assert_eq!(
            read_function_code(PointType::DigitalInput),
            FunctionCode::ReadDiscreteInputs
        );
        assert_eq!(
            read_function_code(PointType::AnalogInput),
            FunctionCode::ReadInputRegisters
        );
        assert_eq!(
            read_function_code(PointType::AnalogOutput),
            FunctionCode::ReadHoldingRegisters
        );
        assert_eq!(
            read_function_code(PointType::HrLong),
            FunctionCode::ReadHoldingRegisters
        );
    }

    #[test]
    fn test_read_command_updates_points() {
        let coils = item("DO_REG 3 100 0 0 1 0 DO @Coils 1");
        let mut h = harness(&[coils.clone()]);
        h.device.set_coil(100, true);
        h.device.set_coil(102, true);

        h.dispatcher
            .execute_read_command(&coils, 7, 1, 100, 3)
            .unwrap();
        assert_eq!(h.dispatcher.apply_pending(&mut h.updates), 3);

        let state = |address| {
            h.store
                .get(PointIdentifier::new(PointType::DigitalOutput, address))
                .unwrap()
                .state()
        };
        assert_eq!(state(100), Some(DigitalState::On));
        assert_eq!(state(101), Some(DigitalState::Off));
        assert_eq!(state(102), Some(DigitalState::On));

        let requests = h.device.requests();
        assert_eq!(requests[0].function_code, 0x01);
        assert_eq!(requests[0].header.length, 6);
        assert_eq!(requests[0].header.transaction_id, 7);
    }

    #[test]
    fn test_read_input_registers_error_reaches_caller() {
        let input = item("IN_REG 1 2000 0 0 100 0 AI @Temp 1");
        let h = harness(&[input.clone()]);

        let result = h.dispatcher.execute_read_command(&input, 1, 1, 2000, 1);
        assert!(matches!(
            result,
            Err(DispatchError::Executor(ExecutorError::Codec(
                CodecError::NotImplemented(FunctionCode::ReadInputRegisters)
            )))
        ));
    }

    #[test]
    fn test_read_overflow_reaches_caller() {
        let coils = item("DO_REG 1 65535 0 0 1 0 DO @Edge 1");
        let h = harness(&[coils.clone()]);

        let result = h.dispatcher.execute_read_command(&coils, 1, 1, 65535, 2);
        assert!(matches!(
            result,
            Err(DispatchError::Codec(CodecError::AddressOverflow { .. }))
        ));
        assert!(h.device.requests().is_empty());
    }

    #[test]
    fn test_write_coil_coerces_value() {
        let valves = item("DO_REG 4 4000 0 0 1 0 DO @Valves 1");
        let h = harness(&[valves.clone()]);

        h.dispatcher
            .execute_write_command(&valves, 1, 1, 4001, 5)
            .unwrap();
        assert!(h.device.coil(4001));

        h.dispatcher
            .execute_write_command(&valves, 2, 1, 4001, 0)
            .unwrap();
        assert!(!h.device.coil(4001));
    }

    #[test]
    fn test_write_register_raw_or_engineering_units() {
        let unit_scale = item("HR_INT 1 1000 0 0 500 0 AO @Unit 1");
        let half_scale = item("HR_INT 1 1001 0 0 500 0 AO @Half 1 0.5 0 0 65535 60000 0");
        let h = harness(&[unit_scale.clone(), half_scale.clone()]);

        // Unit scale: written as raw.
        h.dispatcher
            .execute_write_command(&unit_scale, 1, 1, 1000, 1500)
            .unwrap();
        assert_eq!(h.device.holding_register(1000), 1500);

        // Non-unit scale above 1000: engineering units.
        h.dispatcher
            .execute_write_command(&half_scale, 2, 1, 1001, 1500)
            .unwrap();
        assert_eq!(h.device.holding_register(1001), 3000);

        // Non-unit scale at or below 1000: raw.
        h.dispatcher
            .execute_write_command(&half_scale, 3, 1, 1001, 1000)
            .unwrap();
        assert_eq!(h.device.holding_register(1001), 1000);

        // Negative values clamp to zero.
        h.dispatcher
            .execute_write_command(&unit_scale, 4, 1, 1000, -5)
            .unwrap();
        assert_eq!(h.device.holding_register(1000), 0);

        // Beyond the register range: converted, then saturated.
        h.dispatcher
            .execute_write_command(&unit_scale, 5, 1, 1000, 70000)
            .unwrap();
        assert_eq!(h.device.holding_register(1000), u16::MAX);
    }

    #[test]
    fn test_write_hr_long_register() {
        let long = item("HR_LONG 1 2000 0 0 500 0 AO @Long 1");
        let h = harness(&[long.clone()]);

        h.dispatcher
            .execute_write_command(&long, 1, 1, 2000, 1234)
            .unwrap();
        assert_eq!(h.device.holding_register(2000), 1234);

        h.dispatcher
            .execute_write_command(&long, 2, 1, 2000, 70000)
            .unwrap();
        assert_eq!(h.device.holding_register(2000), u16::MAX);

        let requests = h.device.requests();
        assert_eq!(requests.len(), 2);
        assert!(
            requests
                .iter()
                .all(|r| r.function_code == FunctionCode::WriteSingleRegister.as_u8())
        );
    }

    #[test]
    fn test_large_negative_write_saturates_to_zero() {
        let unit_scale = item("HR_INT 1 1000 0 0 500 0 AO @Unit 1");
        let half_scale = item("HR_INT 1 1001 0 0 500 0 AO @Half 1 0.5 0 0 65535 60000 0");
        let h = harness(&[unit_scale.clone(), half_scale.clone()]);
        h.device.set_holding_register(1000, 500);
        h.device.set_holding_register(1001, 500);

        // Magnitude beyond the register range: engineering units, then saturated.
        assert!(looks_like_engineering_units(-70000, &unit_scale));
        h.dispatcher
            .execute_write_command(&unit_scale, 1, 1, 1000, -70000)
            .unwrap();
        assert_eq!(h.device.holding_register(1000), 0);

        h.dispatcher
            .execute_write_command(&half_scale, 2, 1, 1001, -70000)
            .unwrap();
        assert_eq!(h.device.holding_register(1001), 0);
    }

    #[test]
    fn test_explicit_write_entry_points() {
        let half_scale = item("HR_INT 1 1001 0 0 500 0 AO @Half 1 0.5 10 0 65535 60000 0");
        let h = harness(&[half_scale.clone()]);

        h.dispatcher
            .write_raw(&half_scale, 1, 1, 1001, 1500)
            .unwrap();
        assert_eq!(h.device.holding_register(1001), 1500);

        h.dispatcher
            .write_engineering_units(&half_scale, 2, 1, 1001, 60.0)
            .unwrap();
        assert_eq!(h.device.holding_register(1001), 100);
    }

    #[test]
    fn test_write_to_input_is_invalid() {
        let inputs = item("DI_REG 1 3000 0 0 1 0 DI @Start 1");
        let h = harness(&[inputs.clone()]);

        assert!(matches!(
            h.dispatcher.execute_write_command(&inputs, 1, 1, 3000, 1),
            Err(DispatchError::InvalidArgument(_))
        ));
        assert!(matches!(
            h.dispatcher.write_engineering_units(&inputs, 1, 1, 3000, 1.0),
            Err(DispatchError::InvalidArgument(_))
        ));
        assert!(h.device.requests().is_empty());
    }

    #[test]
    fn test_analog_update_converts_and_classifies() {
        let level = item("HR_INT 1 1000 0 0 500 0 AO @Level 1 0.5 10 0 400 350 20");
        let h = harness(&[level]);
        let id = PointIdentifier::new(PointType::AnalogOutput, 1000);

        assert!(h.dispatcher.apply_update(PointUpdate {
            point_type: PointType::AnalogOutput,
            address: 1000,
            raw: 100,
        }));
        let point = h.store.get(id).unwrap();
        assert_eq!(point.raw_value, 100);
        assert_eq!(point.egu(), Some(60.0));
        assert_eq!(point.alarm, AlarmKind::NoAlarm);
        assert!(point.timestamp.is_some());

        h.dispatcher.initialize_point(PointType::AnalogOutput, 1000, 700);
        let point = h.store.get(id).unwrap();
        assert_eq!(point.egu(), Some(360.0));
        assert_eq!(point.alarm, AlarmKind::HighAlarm);
    }

    #[test]
    fn test_digital_update_sets_state_and_alarm() {
        let valves = item("DO_REG 1 4000 0 0 1 0 DO @Valve 1");
        let h = harness(&[valves]);
        let id = PointIdentifier::new(PointType::DigitalOutput, 4000);

        h.dispatcher.initialize_point(PointType::DigitalOutput, 4000, 1);
        let point = h.store.get(id).unwrap();
        assert_eq!(point.state(), Some(DigitalState::On));
        assert_eq!(point.alarm, AlarmKind::AbnormalValue);
    }

    #[test]
    fn test_failing_policy_forces_alarm() {
        let items = [
            item("HR_INT 1 1000 0 0 500 0 AO @Level 1"),
            item("DI_REG 1 3000 0 0 1 0 DI @Start 1"),
        ];
        let h = harness_with(&items, Arc::new(FailingPolicy));

        h.dispatcher.initialize_point(PointType::AnalogOutput, 1000, 5);
        h.dispatcher.initialize_point(PointType::DigitalInput, 3000, 0);

        let analog = h
            .store
            .get(PointIdentifier::new(PointType::AnalogOutput, 1000))
            .unwrap();
        assert_eq!(analog.alarm, AlarmKind::ReasonabilityFailure);
        assert_eq!(analog.raw_value, 5);

        let digital = h
            .store
            .get(PointIdentifier::new(PointType::DigitalInput, 3000))
            .unwrap();
        assert_eq!(digital.alarm, AlarmKind::AbnormalValue);
    }

    #[test]
    fn test_unknown_point_is_ignored() {
        let h = harness(&[item("DO_REG 1 4000 0 0 1 0 DO @Valve 1")]);
        assert!(!h.dispatcher.apply_update(PointUpdate {
            point_type: PointType::AnalogOutput,
            address: 4000,
            raw: 1,
        }));
    }

    #[test]
    fn test_seed_points() {
        let items = [
            item("DO_REG 2 4000 0 0 1 0 DO @Valves 1"),
            item("HR_INT 1 1000 0 0 500 42 AO @Level 1"),
        ];
        let h = harness(&items);

        assert_eq!(h.dispatcher.seed_points(&items), 3);
        let level = h
            .store
            .get(PointIdentifier::new(PointType::AnalogOutput, 1000))
            .unwrap();
        assert_eq!(level.raw_value, 42);
        assert_eq!(level.egu(), Some(42.0));
    }

    #[tokio::test]
    async fn test_intake_drains_on_shutdown() {
        let valves = item("DO_REG 1 4000 0 0 1 0 DO @Valve 1");
        let store = Arc::new(MemoryPointStore::from_items(&[valves]));
        let (tx, rx): (UpdateSender, UpdateReceiver) = update_channel();
        let device = Arc::new(SimulatedDevice::new(tx.clone()));
        let dispatcher = Arc::new(CommandDispatcher::new(
            store.clone(),
            Arc::new(LimitAlarmPolicy),
            device,
        ));

        tx.send(PointUpdate {
            point_type: PointType::DigitalOutput,
            address: 4000,
            raw: 1,
        })
        .unwrap();

        let signal = ShutdownSignal::new();
        signal.trigger();
        let intake = {
            let dispatcher = dispatcher.clone();
            let shutdown = signal.subscribe();
            tokio::spawn(async move { dispatcher.run_intake(rx, shutdown).await })
        };
        intake.await.unwrap();

        let point = store
            .get(PointIdentifier::new(PointType::DigitalOutput, 4000))
            .unwrap();
        assert_eq!(point.raw_value, 1);
    }
}
