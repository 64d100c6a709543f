// Define message types for the runtime

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::motor::{Fault, FaultEvent};

// Command from teleop/scripts -> runtime
// Speeds in [-1, 1] keyed by motor name; motors not listed keep their last speed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriveCommand {
    pub speeds: BTreeMap<String, f64>,
}

impl DriveCommand {
    pub fn with(mut self, motor: impl Into<String>, speed: f64) -> Self {
        self.speeds.insert(motor.into(), speed);
        self
    }
}

// Operator request to pulse a driver's reset line (clears a latched short circuit)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetCommand {
    pub motor: String,
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
}

/// Fault published by runtime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaultReport {
    pub motor: String,
    pub motor_id: u8,
    pub fault: Fault,
}

impl From<&FaultEvent> for FaultReport {
    fn from(event: &FaultEvent) -> Self {
        Self {
            motor: event.motor.to_string(),
            motor_id: event.motor_id,
            fault: event.fault,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_command_json() {
        let cmd: DriveCommand =
            serde_json::from_str(r#"{"speeds":{"left_motor":0.5,"right_motor":-0.5}}"#).unwrap();
        assert_eq!(cmd, DriveCommand::default().with("left_motor", 0.5).with("right_motor", -0.5));
    }

    #[test]
    fn test_fault_report_json() {
        let report = FaultReport {
            motor: "left_flipper".to_string(),
            motor_id: 2,
            fault: Fault::ShortCircuitLatched,
        };
        assert_eq!(
            serde_json::to_string(&report).unwrap(),
            r#"{"motor":"left_flipper","motor_id":2,"fault":"short_circuit_latched"}"#
        );
        assert_eq!(serde_json::to_string(&RuntimeHealth::CmdStale).unwrap(), r#""cmd_stale""#);
    }
}
