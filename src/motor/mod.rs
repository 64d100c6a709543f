// Motor actuation core
//
// Provides:
// - Dead-zone speed scaling and the single-byte microcontroller packet
// - Fault line monitoring for the motor drivers
// - The motor aggregate (serial or PWM output) and the bounded motor registry
// - Pin capability traits, with simulated and Raspberry Pi implementations

mod driver;
mod error;
pub mod fault;
pub mod packet;
pub mod pins;
mod registry;
#[cfg(feature = "rpi")]
pub mod rpi;
pub mod scaling;
pub mod sim;

pub use driver::{BackendKind, Motor, MotorConfig, PwmConfig, DEFAULT_PWM_FREQUENCY, RESET_PULSE};
pub use error::{MotorError, Result};
pub use fault::{Fault, FaultEvent, FaultMonitor, FaultSink};
pub use packet::MotorPacket;
pub use pins::{Level, Pin, PinController, PinError, SerialLink, SharedSerial};
pub use registry::{MotorRegistry, MAX_MOTORS};
pub use scaling::{scale_speed, Calibration};
