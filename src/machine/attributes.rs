//! Typed machine attributes, process-variable mirrors and snapshots.

use crate::buffer::RollPolicy;
use crate::error::{AppResult, AutomationError};
use crate::units::Unit;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A settable machine attribute with its new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "attribute", content = "value", rename_all = "snake_case")]
pub enum MachineAttribute {
    /// Alarm severity, 1 is nominal
    Criticity(i64),
    /// Scheduling priority
    Priority(i64),
    /// Free-form description
    Description(String),
    /// Machine category
    Classification(String),
    /// Recreates every buffer
    BufferSize(usize),
    /// Recreates every buffer
    BufferRollPolicy(RollPolicy),
    /// Execution interval in seconds
    Interval(f64),
}

impl MachineAttribute {
    /// Attribute name as shown in snapshots.
    pub fn name(&self) -> &'static str {
        match self {
            MachineAttribute::Criticity(_) => "criticity",
            MachineAttribute::Priority(_) => "priority",
            MachineAttribute::Description(_) => "description",
            MachineAttribute::Classification(_) => "classification",
            MachineAttribute::BufferSize(_) => "buffer_size",
            MachineAttribute::BufferRollPolicy(_) => "buffer_roll_type",
            MachineAttribute::Interval(_) => "interval",
        }
    }

    /// Reject values no machine can hold.
    pub fn validate(&self) -> AppResult<()> {
        match self {
            MachineAttribute::BufferSize(0) => Err(AutomationError::InvalidAttribute(
                "buffer_size must be at least 1".to_string(),
            )),
            MachineAttribute::Interval(secs) if !(*secs > 0.0) || !secs.is_finite() => {
                Err(AutomationError::InvalidAttribute(format!(
                    "interval must be a positive number of seconds, got {}",
                    secs
                )))
            }
            _ => Ok(()),
        }
    }

    /// Parse a `(name, value)` pair as sent by a configuration form.
    pub fn parse(name: &str, value: &str) -> AppResult<Self> {
        let attribute = match name {
            "criticity" => MachineAttribute::Criticity(
                value
                    .parse::<i64>()
                    .map_err(|e| invalid_value(name, &e))?,
            ),
            "priority" => MachineAttribute::Priority(
                value
                    .parse::<i64>()
                    .map_err(|e| invalid_value(name, &e))?,
            ),
            "description" => MachineAttribute::Description(value.to_string()),
            "classification" => MachineAttribute::Classification(value.to_string()),
            "buffer_size" => MachineAttribute::BufferSize(
                value
                    .parse::<usize>()
                    .map_err(|e| invalid_value(name, &e))?,
            ),
            "buffer_roll_type" | "buffer_roll_policy" => {
                MachineAttribute::BufferRollPolicy(value.parse::<RollPolicy>()?)
            }
            "interval" => MachineAttribute::Interval(
                value
                    .parse::<f64>()
                    .map_err(|e| invalid_value(name, &e))?,
            ),
            other => {
                return Err(AutomationError::InvalidAttribute(format!(
                    "Unknown attribute '{}'",
                    other
                )))
            }
        };
        attribute.validate()?;
        Ok(attribute)
    }
}

fn invalid_value(name: &str, e: &dyn fmt::Display) -> AutomationError {
    AutomationError::InvalidAttribute(format!("{}: {}", name, e))
}

/// Live mirror of a subscribed tag, in the tag's display unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessVariable {
    /// Tag name
    pub tag: String,
    /// Latest value in `unit`
    pub value: f64,
    /// Display unit of the tag
    pub unit: Unit,
    /// Timestamp of the latest value
    pub timestamp: DateTime<Utc>,
    /// Mirrors are written by the value store only
    pub read_only: bool,
}

/// Point-in-time view of a machine.
///
/// Process variables are flattened next to the typed attributes, keyed by
/// tag name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    /// Current state name
    pub state: String,
    /// Registry name
    pub name: String,
    /// Free-form description
    pub description: String,
    /// Machine category
    pub classification: String,
    /// Execution interval in seconds
    pub interval: f64,
    /// Capacity of every buffer
    pub buffer_size: usize,
    /// Buffer roll policy
    pub buffer_roll_type: RollPolicy,
    /// Alarm severity
    pub criticity: i64,
    /// Scheduling priority
    pub priority: i64,
    /// Process-variable mirrors keyed by tag name
    #[serde(flatten)]
    pub process_variables: BTreeMap<String, ProcessVariable>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_buffer_size_is_rejected() {
        assert!(MachineAttribute::BufferSize(0).validate().is_err());
        assert!(MachineAttribute::BufferSize(1).validate().is_ok());
    }

    #[test]
    fn interval_must_be_positive() {
        assert!(MachineAttribute::Interval(0.0).validate().is_err());
        assert!(MachineAttribute::Interval(-1.0).validate().is_err());
        assert!(MachineAttribute::Interval(f64::NAN).validate().is_err());
        assert!(MachineAttribute::Interval(0.25).validate().is_ok());
    }

    #[test]
    fn parse_form_values() {
        assert_eq!(
            MachineAttribute::parse("priority", "3").unwrap(),
            MachineAttribute::Priority(3)
        );
        assert_eq!(
            MachineAttribute::parse("buffer_roll_type", "forward").unwrap(),
            MachineAttribute::BufferRollPolicy(RollPolicy::Forward)
        );
        assert!(MachineAttribute::parse("buffer_size", "many").is_err());
        assert!(MachineAttribute::parse("colour", "blue").is_err());
        assert!(MachineAttribute::parse("interval", "0").is_err());
    }

    #[test]
    fn snapshot_flattens_process_variables() {
        let mut process_variables = BTreeMap::new();
        process_variables.insert(
            "PT-100".to_string(),
            ProcessVariable {
                tag: "PT-100".to_string(),
                value: 1.5,
                unit: Unit::Bar,
                timestamp: Utc::now(),
                read_only: true,
            },
        );
        let snapshot = MachineSnapshot {
            state: "wait".to_string(),
            name: "boiler".to_string(),
            description: String::new(),
            classification: "Generic".to_string(),
            interval: 1.0,
            buffer_size: 10,
            buffer_roll_type: RollPolicy::Backward,
            criticity: 2,
            priority: 1,
            process_variables,
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "wait");
        assert_eq!(json["buffer_roll_type"], "backward");
        assert_eq!(json["PT-100"]["value"], 1.5);
    }
}
