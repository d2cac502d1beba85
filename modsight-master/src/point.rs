//! Point model and the in-memory point store.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::item::ConfigItem;

/// Modbus point categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointType {
    /// Discrete input contacts (read-only, 1-bit)
    DigitalInput,
    /// Coils (read/write, 1-bit)
    DigitalOutput,
    /// Input registers (read-only, 16-bit)
    AnalogInput,
    /// Holding registers (read/write, 16-bit)
    AnalogOutput,
    /// Wide holding register
    HrLong,
}

impl PointType {
    /// Return the string name for this point type.
    pub fn as_str(&self) -> &'static str {
        match self {
            PointType::DigitalInput => "digital_input",
            PointType::DigitalOutput => "digital_output",
            PointType::AnalogInput => "analog_input",
            PointType::AnalogOutput => "analog_output",
            PointType::HrLong => "hr_long",
        }
    }

    /// Whether points of this type carry an engineering-unit value.
    pub fn is_analog(&self) -> bool {
        matches!(
            self,
            PointType::AnalogInput | PointType::AnalogOutput | PointType::HrLong
        )
    }

    /// Whether points of this type carry a boolean state.
    pub fn is_digital(&self) -> bool {
        matches!(self, PointType::DigitalInput | PointType::DigitalOutput)
    }
}

impl fmt::Display for PointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique key of a point: its type and register address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PointIdentifier {
    pub point_type: PointType,
    pub address: u16,
}

impl PointIdentifier {
    pub fn new(point_type: PointType, address: u16) -> Self {
        Self {
            point_type,
            address,
        }
    }
}

impl fmt::Display for PointIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.point_type, self.address)
    }
}

/// Alarm classification of a point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    #[default]
    NoAlarm,
    ReasonabilityFailure,
    LowAlarm,
    HighAlarm,
    AbnormalValue,
}

/// State of a digital point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigitalState {
    #[default]
    Off,
    On,
}

impl From<bool> for DigitalState {
    fn from(on: bool) -> Self {
        if on { DigitalState::On } else { DigitalState::Off }
    }
}

/// Type-specific part of a point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointValue {
    /// Engineering-unit value of an analog point.
    Analog { egu: f64 },
    /// State of a digital point.
    Digital { state: DigitalState },
}

/// A single acquired point.
#[derive(Debug, Clone)]
pub struct Point {
    pub id: PointIdentifier,
    /// Configuration of the range this point belongs to.
    pub item: Arc<ConfigItem>,
    pub raw_value: u16,
    /// Time of the last update; `None` until the point is first seeded.
    pub timestamp: Option<DateTime<Local>>,
    pub alarm: AlarmKind,
    pub value: PointValue,
}

impl Point {
    /// Create a point in its initial state.
    pub fn new(id: PointIdentifier, item: Arc<ConfigItem>) -> Self {
        let value = if id.point_type.is_digital() {
            PointValue::Digital {
                state: DigitalState::Off,
            }
        } else {
            PointValue::Analog { egu: 0.0 }
        };

        Self {
            id,
            item,
            raw_value: 0,
            timestamp: None,
            alarm: AlarmKind::NoAlarm,
            value,
        }
    }

    /// Engineering-unit value, if this is an analog point.
    pub fn egu(&self) -> Option<f64> {
        match self.value {
            PointValue::Analog { egu } => Some(egu),
            PointValue::Digital { .. } => None,
        }
    }

    /// Digital state, if this is a digital point.
    pub fn state(&self) -> Option<DigitalState> {
        match self.value {
            PointValue::Digital { state } => Some(state),
            PointValue::Analog { .. } => None,
        }
    }
}

/// Lookup and in-place mutation of points by identifier.
pub trait PointStore: Send + Sync {
    /// Snapshot the points matching `ids`. Unknown identifiers are skipped.
    fn get_points(&self, ids: &[PointIdentifier]) -> Vec<Point>;

    /// Mutate a point in place. Returns `false` if the identifier is unknown.
    fn update_point(&self, id: PointIdentifier, update: &mut dyn FnMut(&mut Point)) -> bool;
}

/// Point store kept in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryPointStore {
    points: RwLock<HashMap<PointIdentifier, Point>>,
}

impl MemoryPointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create one point for every address covered by the configuration items.
    pub fn from_items(items: &[Arc<ConfigItem>]) -> Self {
        let store = Self::new();
        {
            let mut points = store.points.write();
            for item in items {
                for address in item.addresses() {
                    let id = PointIdentifier::new(item.registry_type, address);
                    if points.contains_key(&id) {
                        warn!(point = %id, "Duplicate point in configuration, keeping first");
                        continue;
                    }
                    points.insert(id, Point::new(id, item.clone()));
                }
            }
        }
        store
    }

    /// Number of points in the store.
    pub fn len(&self) -> usize {
        self.points.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.points.read().is_empty()
    }

    /// All identifiers, sorted by type then address.
    pub fn identifiers(&self) -> Vec<PointIdentifier> {
        let mut ids: Vec<_> = self.points.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Snapshot of a single point.
    pub fn get(&self, id: PointIdentifier) -> Option<Point> {
        self.points.read().get(&id).cloned()
    }
}

impl PointStore for MemoryPointStore {
    fn get_points(&self, ids: &[PointIdentifier]) -> Vec<Point> {
        let points = self.points.read();
        ids.iter().filter_map(|id| points.get(id).cloned()).collect()
    }

    fn update_point(&self, id: PointIdentifier, update: &mut dyn FnMut(&mut Point)) -> bool {
        match self.points.write().get_mut(&id) {
            Some(point) => {
                update(point);
                true
            }
            None => false,
        }
    }
}
