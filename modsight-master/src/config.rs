//! Configuration for the Modbus master.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use modsight_runtime::{LoggingConfig, RuntimeConfig, RuntimeError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::item::{ConfigItem, PointsFileError, load_points_file};
use crate::point::PointType;

/// Number of valves driven by the mixing process.
pub const VALVE_COUNT: usize = 4;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Points(#[from] PointsFileError),
}

/// Complete master configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Modbus connection settings
    pub modbus: ModbusConfig,

    /// Points file, relative paths resolve against the config file's directory
    pub points_file: PathBuf,

    /// Acquisition tick settings
    #[serde(default)]
    pub acquisition: AcquisitionConfig,

    /// Mixing process automation
    #[serde(default)]
    pub automation: AutomationConfig,
}

/// Modbus protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Connection type and address
    pub connection: ConnectionConfig,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Commands allowed to wait for the TCP connection before new ones are refused
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_unit_id() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    64
}

/// Connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// Modbus TCP connection
    Tcp {
        /// Host address (IP or hostname)
        host: String,
        /// TCP port (default: 502)
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    /// In-process simulated device
    Simulated,
}

fn default_modbus_port() -> u16 {
    502
}

/// Acquisition scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Tick period in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
        }
    }
}

fn default_tick_ms() -> u64 {
    1000
}

/// Mixing process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    /// Run the mixing process controller
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tick period in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Start signal coil
    #[serde(default = "default_start_address")]
    pub start_address: u16,

    /// Mixer motor coil
    #[serde(default = "default_motor_address")]
    pub motor_address: u16,

    /// Chocolate, milk, water and drain valve coils, in that order
    #[serde(default = "default_valve_addresses")]
    pub valve_addresses: Vec<u16>,

    /// Mixer contents holding register
    #[serde(default = "default_contents_address")]
    pub contents_address: u16,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            tick_ms: default_tick_ms(),
            start_address: default_start_address(),
            motor_address: default_motor_address(),
            valve_addresses: default_valve_addresses(),
            contents_address: default_contents_address(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_start_address() -> u16 {
    3000
}

fn default_motor_address() -> u16 {
    3001
}

fn default_valve_addresses() -> Vec<u16> {
    vec![4000, 4001, 4002, 4003]
}

fn default_contents_address() -> u16 {
    1000
}

impl MasterConfig {
    /// Validate the configuration.
    pub fn validate_settings(&self) -> Result<(), ConfigError> {
        if !(1..=247).contains(&self.modbus.unit_id) {
            return Err(ConfigError::Validation(format!(
                "unit_id must be 1-247, got {}",
                self.modbus.unit_id
            )));
        }

        if let ConnectionConfig::Tcp { host, .. } = &self.modbus.connection {
            if host.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "TCP connection host cannot be empty".to_string(),
                ));
            }
        }

        if self.modbus.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "modbus.timeout_ms must be positive".to_string(),
            ));
        }

        if self.modbus.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "modbus.queue_capacity must be positive".to_string(),
            ));
        }

        if self.acquisition.tick_ms == 0 {
            return Err(ConfigError::Validation(
                "acquisition.tick_ms must be positive".to_string(),
            ));
        }

        if self.automation.tick_ms == 0 {
            return Err(ConfigError::Validation(
                "automation.tick_ms must be positive".to_string(),
            ));
        }

        if self.automation.valve_addresses.len() != VALVE_COUNT {
            return Err(ConfigError::Validation(format!(
                "automation.valve_addresses must list exactly {} valves, got {}",
                VALVE_COUNT,
                self.automation.valve_addresses.len()
            )));
        }

        Ok(())
    }

    /// Resolve the points file path against the config file's directory.
    pub fn points_path(&self, config_dir: &Path) -> PathBuf {
        if self.points_file.is_absolute() {
            self.points_file.clone()
        } else {
            config_dir.join(&self.points_file)
        }
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.modbus.timeout_ms)
    }
}

impl RuntimeConfig for MasterConfig {
    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn validate(&self) -> modsight_runtime::Result<()> {
        self.validate_settings()
            .map_err(|e| RuntimeError::validation(e.to_string()))
    }
}

/// Runtime view of the configuration: point items, unit address and the
/// transaction id sequence.
#[derive(Debug)]
pub struct Configuration {
    items: Vec<Arc<ConfigItem>>,
    unit_id: u8,
    transaction_id: AtomicU16,
}

impl Configuration {
    pub fn new(items: Vec<Arc<ConfigItem>>, unit_id: u8) -> Self {
        Self {
            items,
            unit_id,
            transaction_id: AtomicU16::new(0),
        }
    }

    /// Load the points file named by `config`.
    pub fn load(config: &MasterConfig, config_dir: &Path) -> Result<Self, ConfigError> {
        let items = load_points_file(config.points_path(config_dir))?;
        Ok(Self::new(items, config.modbus.unit_id))
    }

    pub fn items(&self) -> &[Arc<ConfigItem>] {
        &self.items
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    /// Next transaction id; wraps from 65535 to 0.
    pub fn next_transaction_id(&self) -> u16 {
        self.transaction_id.fetch_add(1, Ordering::Relaxed)
    }

    /// First item of one of `types` whose range covers `address`.
    pub fn find_item(&self, address: u16, types: &[PointType]) -> Option<&Arc<ConfigItem>> {
        self.items
            .iter()
            .find(|item| types.contains(&item.registry_type) && item.covers(address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modsight_common::parse_config;
    use modsight_runtime::LogFormat;
    use std::io::Write;

    fn parse(json: &str) -> MasterConfig {
        parse_config(json).unwrap()
    }

    #[test]
    fn test_parse_tcp_config() {
        let config = parse(
            r#"{
            logging: { level: "debug", format: "json" },
            modbus: {
                unit_id: 5,
                connection: { type: "tcp", host: "192.168.1.10" },
                timeout_ms: 250,
            },
            points_file: "points.cfg",
            acquisition: { tick_ms: 500 },
        }"#,
        );

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.modbus.unit_id, 5);
        assert_eq!(
            config.modbus.connection,
            ConnectionConfig::Tcp {
                host: "192.168.1.10".to_string(),
                port: 502
            }
        );
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.acquisition.tick_ms, 500);
        config.validate_settings().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = parse(
            r#"{
            modbus: { connection: { type: "simulated" } },
            points_file: "points.cfg",
        }"#,
        );

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.modbus.unit_id, 1);
        assert_eq!(config.modbus.connection, ConnectionConfig::Simulated);
        assert_eq!(config.modbus.timeout_ms, 1000);
        assert_eq!(config.modbus.queue_capacity, 64);
        assert_eq!(config.acquisition.tick_ms, 1000);
        assert!(config.automation.enabled);
        assert_eq!(config.automation.start_address, 3000);
        assert_eq!(config.automation.motor_address, 3001);
        assert_eq!(config.automation.valve_addresses, vec![4000, 4001, 4002, 4003]);
        assert_eq!(config.automation.contents_address, 1000);
        config.validate_settings().unwrap();
    }

    #[test]
    fn test_validation_failures() {
        let base = r#"{
            modbus: { connection: { type: "simulated" } },
            points_file: "points.cfg",
        }"#;

        let mut config = parse(base);
        config.modbus.unit_id = 0;
        assert!(config.validate_settings().is_err());
        config.modbus.unit_id = 248;
        assert!(config.validate_settings().is_err());

        let mut config = parse(base);
        config.modbus.queue_capacity = 0;
        assert!(config.validate_settings().is_err());

        let mut config = parse(base);
        config.acquisition.tick_ms = 0;
        assert!(config.validate_settings().is_err());

        let mut config = parse(base);
        config.automation.tick_ms = 0;
        assert!(config.validate_settings().is_err());

        let mut config = parse(base);
        config.automation.valve_addresses = vec![4000, 4001, 4002];
        assert!(matches!(
            config.validate_settings(),
            Err(ConfigError::Validation(_))
        ));

        let mut config = parse(base);
        config.modbus.connection = ConnectionConfig::Tcp {
            host: " ".to_string(),
            port: 502,
        };
        assert!(config.validate_settings().is_err());
    }

    #[test]
    fn test_runtime_config_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.json5");
        std::fs::write(
            &path,
            r#"{ modbus: { unit_id: 0, connection: { type: "simulated" } }, points_file: "p.cfg" }"#,
        )
        .unwrap();

        assert!(matches!(
            MasterConfig::load(&path),
            Err(RuntimeError::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_points_path_resolution() {
        let mut config = parse(
            r#"{ modbus: { connection: { type: "simulated" } }, points_file: "points.cfg" }"#,
        );
        assert_eq!(
            config.points_path(Path::new("/etc/modsight")),
            PathBuf::from("/etc/modsight/points.cfg")
        );

        config.points_file = PathBuf::from("/opt/points.cfg");
        assert_eq!(
            config.points_path(Path::new("/etc/modsight")),
            PathBuf::from("/opt/points.cfg")
        );
    }

    #[test]
    fn test_configuration_load_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut points = std::fs::File::create(dir.path().join("points.cfg")).unwrap();
        writeln!(points, "; mixer").unwrap();
        writeln!(points, "DO_REG 2 3000 0 0 1 0 DO @Controls 1").unwrap();
        writeln!(points, "DO_REG 4 4000 0 0 1 0 DO @Valves 1").unwrap();
        writeln!(points, "HR_INT 1 1000 0 0 500 0 AO @Contents 1").unwrap();

        let master = parse(
            r#"{ modbus: { unit_id: 3, connection: { type: "simulated" } }, points_file: "points.cfg" }"#,
        );
        let config = Configuration::load(&master, dir.path()).unwrap();

        assert_eq!(config.items().len(), 3);
        assert_eq!(config.unit_id(), 3);

        let valve = config
            .find_item(4002, &[PointType::DigitalOutput])
            .unwrap();
        assert_eq!(valve.description, "Valves");
        assert!(config.find_item(4004, &[PointType::DigitalOutput]).is_none());
        assert!(config.find_item(1000, &[PointType::DigitalOutput]).is_none());
        assert!(config.find_item(1000, &[PointType::AnalogOutput]).is_some());
    }

    #[test]
    fn test_missing_points_file() {
        let master = parse(
            r#"{ modbus: { connection: { type: "simulated" } }, points_file: "missing.cfg" }"#,
        );
        assert!(matches!(
            Configuration::load(&master, Path::new("/nonexistent")),
            Err(ConfigError::Points(_))
        ));
    }

    #[test]
    fn test_transaction_id_wraps() {
        let config = Configuration::new(Vec::new(), 1);
        assert_eq!(config.next_transaction_id(), 0);
        assert_eq!(config.next_transaction_id(), 1);

        config.transaction_id.store(u16::MAX, Ordering::Relaxed);
        assert_eq!(config.next_transaction_id(), u16::MAX);
        assert_eq!(config.next_transaction_id(), 0);
    }
}
