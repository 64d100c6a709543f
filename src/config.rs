// Timeouts, topics, serial defaults and the motor layout file
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::motor::MotorConfig;

// Runtime loop frequency
pub const LOOP_HZ: u64 = 50;

// Command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Zenoh topics
pub const TOPIC_CMD_DRIVE: &str = "rover/cmd/drive"; // per-motor speeds
pub const TOPIC_CMD_RESET: &str = "rover/cmd/reset"; // driver reset requests
pub const TOPIC_HEALTH: &str = "rover/state/health"; // health status
pub const TOPIC_FAULTS: &str = "rover/state/faults"; // classified driver faults

// Microcontroller link
pub const SERIAL_PORT: &str = "/dev/ttyACM0";
pub const SERIAL_BAUDRATE: u32 = 9600;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid motor layout: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Motor name {0:?} is used more than once")]
    DuplicateMotor(String),
}

/// Serial port of the motor microcontroller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
}

fn default_baudrate() -> u32 {
    SERIAL_BAUDRATE
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: SERIAL_PORT.to_string(),
            baudrate: SERIAL_BAUDRATE,
        }
    }
}

/// Motor layout of the robot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Omit to run every motor on direct PWM
    #[serde(default)]
    pub serial: Option<SerialConfig>,
    pub motors: Vec<MotorConfig>,
}

impl Default for RuntimeConfig {
    /// Drive motors and flippers, all behind the microcontroller
    fn default() -> Self {
        Self {
            serial: Some(SerialConfig::default()),
            motors: vec![
                MotorConfig::new("left_motor", 11, 12, 13),
                MotorConfig::new("right_motor", 15, 16, 18),
                MotorConfig::new("left_flipper", 31, 32, 33),
                MotorConfig::new("right_flipper", 35, 36, 37),
            ],
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Motors are addressed by name in drive commands, so names must be unique
    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for motor in &self.motors {
            if !seen.insert(motor.name.as_str()) {
                return Err(ConfigError::DuplicateMotor(motor.name.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::DEFAULT_PWM_FREQUENCY;

    #[test]
    fn test_default_layout() {
        let config = RuntimeConfig::default();
        assert_eq!(config.motors.len(), 4);
        assert_eq!(config.motors[1].reset, 18);
        assert_eq!(config.serial.unwrap().baudrate, 9600);
    }

    #[test]
    fn test_parse_with_defaults() {
        let config = RuntimeConfig::from_json(
            r#"{
                "motors": [
                    { "name": "left", "fault_1": 1, "fault_2": 2, "reset": 3,
                      "start_input": 0.2, "max_speed": 0.8,
                      "pwm": { "pin": 4, "dir": 5 } },
                    { "name": "right", "fault_1": 6, "fault_2": 7, "reset": 8 }
                ]
            }"#,
        )
        .unwrap();

        assert!(config.serial.is_none());
        let left = &config.motors[0];
        assert_eq!(left.start_input, 0.2);
        assert_eq!(left.pwm.unwrap().frequency, DEFAULT_PWM_FREQUENCY);
        let right = &config.motors[1];
        assert_eq!(right.start_input, 0.0);
        assert_eq!(right.max_speed, 1.0);
        assert!(right.pwm.is_none());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = RuntimeConfig::from_json(
            r#"{ "motors": [
                { "name": "left", "fault_1": 1, "fault_2": 2, "reset": 3 },
                { "name": "left", "fault_1": 4, "fault_2": 5, "reset": 6 }
            ] }"#,
        );
        assert!(matches!(result, Err(ConfigError::DuplicateMotor(name)) if name == "left"));
    }

    #[test]
    fn test_missing_file() {
        let result = RuntimeConfig::load(Path::new("/nonexistent/motors.json"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
