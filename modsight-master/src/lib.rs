//! Modbus TCP master.
//!
//! Periodically polls configured coil and register ranges, converts raw
//! values to engineering units, classifies alarms, and runs a simulated
//! mixing process through the same command path.
//!
//! # Pipeline
//!
//! ```text
//! tick -> AcquisitionScheduler / AutomationController
//!      -> CommandDispatcher -> ModbusFunction (pack)
//!      -> FunctionExecutor (TCP or simulated device)
//!      -> ModbusFunction (parse) -> PointUpdate channel
//!      -> CommandDispatcher::run_intake -> PointStore
//! ```
//!
//! # Points file
//!
//! ```text
//! ; type count start decimals min max default processing @description interval
//! DO_REG 2 3000 0 0 1 0 DO @Controls 1
//! DO_REG 4 4000 0 0 1 0 DO @Valves 1
//! HR_INT 1 1000 0 0 500 0 AO @Contents 1 1 0 0 400 380 0
//! ```

pub mod acquisition;
pub mod alarm;
pub mod automation;
pub mod codec;
pub mod config;
pub mod convert;
pub mod dispatcher;
pub mod executor;
pub mod item;
pub mod params;
pub mod point;
pub mod simulator;
