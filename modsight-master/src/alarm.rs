//! Alarm classification policies.

use thiserror::Error;

use crate::item::ConfigItem;
use crate::point::AlarmKind;

/// Error raised while classifying a value.
#[derive(Debug, Error, PartialEq)]
pub enum AlarmError {
    #[error("value {0} is not a finite number")]
    NotFinite(f64),
}

/// Classifies point values against their configuration.
pub trait AlarmPolicy: Send + Sync {
    /// Classify an analog point by its engineering-unit value.
    fn analog_alarm(&self, egu: f64, item: &ConfigItem) -> Result<AlarmKind, AlarmError>;

    /// Classify a digital point by its raw value.
    fn digital_alarm(&self, raw: u16, item: &ConfigItem) -> Result<AlarmKind, AlarmError>;
}

/// Limit-based policy using the item's EGU range, alarm limits and abnormal value.
#[derive(Debug, Clone, Copy, Default)]
pub struct LimitAlarmPolicy;

impl AlarmPolicy for LimitAlarmPolicy {
    fn analog_alarm(&self, egu: f64, item: &ConfigItem) -> Result<AlarmKind, AlarmError> {
        if !egu.is_finite() {
            return Err(AlarmError::NotFinite(egu));
        }

        let alarm = if egu < item.egu_min || egu > item.egu_max {
            AlarmKind::ReasonabilityFailure
        } else if egu > item.high_limit {
            AlarmKind::HighAlarm
        } else if egu < item.low_limit {
            AlarmKind::LowAlarm
        } else {
            AlarmKind::NoAlarm
        };

        Ok(alarm)
    }

    fn digital_alarm(&self, raw: u16, item: &ConfigItem) -> Result<AlarmKind, AlarmError> {
        if raw == item.abnormal_value {
            Ok(AlarmKind::AbnormalValue)
        } else {
            Ok(AlarmKind::NoAlarm)
        }
    }
}
