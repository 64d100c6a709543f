use super::pins::PinError;

/// Errors raised by the motor core
#[derive(Debug, thiserror::Error)]
pub enum MotorError {
    #[error("All {capacity} motor slots are in use")]
    CapacityExceeded { capacity: usize },

    #[error("Invalid configuration for {motor}: {reason}")]
    InvalidConfiguration { motor: String, reason: String },

    #[error("Cannot drive {motor}: no serial or PWM driver enabled")]
    NoDriverConfigured { motor: String },

    #[error("Motor {motor} (ID# {id}) is not registered")]
    UnknownMotor { motor: String, id: u8 },

    #[error("Speed {speed} for {motor} is outside [-1, 1]")]
    SpeedOutOfRange { motor: String, speed: f64 },

    #[error("Pin error: {0}")]
    Pin(#[from] PinError),

    #[error("Serial link error: {0}")]
    Serial(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MotorError>;
