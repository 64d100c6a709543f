// Hardware capabilities consumed by the motor core
//
// The core never touches GPIO registers or serial devices directly; it talks to
// a `PinController` for digital I/O, edge interrupts and PWM, and to a
// `SerialLink` for the microcontroller byte stream.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serialport::{self, SerialPort};

/// Write timeout for the microcontroller link
pub const SERIAL_TIMEOUT_MS: u64 = 100;

/// Pin identifier as understood by the pin controller
pub type Pin = u8;

/// Logic level of a digital line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Low,
    High,
}

/// Input bias resistor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    Off,
    Down,
    Up,
}

/// Opaque handle to a running PWM channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PwmHandle(pub u32);

/// Callback fired by the pin controller on a rising edge.
///
/// May run on any thread the controller chooses, so it must be cheap and must
/// not block.
pub type EdgeCallback = Box<dyn Fn() + Send + Sync + 'static>;

/// Errors reported by a pin controller
#[derive(Debug, thiserror::Error)]
pub enum PinError {
    #[error("Pin {0} is not available on this controller")]
    Unavailable(Pin),

    #[error("Pin {pin} is not configured as {expected}")]
    NotConfigured { pin: Pin, expected: &'static str },

    #[error("Unknown PWM handle {0:?}")]
    UnknownPwm(PwmHandle),

    #[error("Pin {pin} hardware error: {reason}")]
    Hardware { pin: Pin, reason: String },
}

/// Digital I/O, edge interrupt and PWM primitives
pub trait PinController: Send + Sync {
    fn configure_input(&self, pin: Pin, pull: Pull) -> Result<(), PinError>;

    fn configure_output(&self, pin: Pin) -> Result<(), PinError>;

    fn read(&self, pin: Pin) -> Result<Level, PinError>;

    fn write(&self, pin: Pin, level: Level) -> Result<(), PinError>;

    /// Register `callback` to run on every rising edge of an input pin
    fn on_rising_edge(&self, pin: Pin, callback: EdgeCallback) -> Result<(), PinError>;

    /// Start a PWM signal at `frequency` Hz with 0% duty
    fn start_pwm(&self, pin: Pin, frequency: f64) -> Result<PwmHandle, PinError>;

    /// Set the duty cycle in percent (0..=100)
    fn set_duty_cycle(&self, handle: PwmHandle, percent: f64) -> Result<(), PinError>;

    /// Hand one pin back to the controller: detach its edge callbacks and stop
    /// any PWM running on it. Releasing a pin that is not claimed does nothing.
    fn release(&self, pin: Pin) -> Result<(), PinError>;

    /// Release every pin, interrupt and PWM channel held by the controller
    fn release_all(&self) -> Result<(), PinError>;
}

/// Byte sink towards the motor microcontroller
pub trait SerialLink: Send {
    fn write_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()>;
}

/// A serial link shared by every motor behind the same microcontroller
pub type SharedSerial = Arc<Mutex<dyn SerialLink>>;

impl SerialLink for Box<dyn SerialPort> {
    fn write_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.write_all(bytes)?;
        self.flush()
    }
}

/// Wrap a serial link so several motors can share it
pub fn shared<L: SerialLink + 'static>(link: L) -> SharedSerial {
    Arc::new(Mutex::new(link))
}

/// Open the microcontroller serial port
pub fn open_serial(port_name: &str, baudrate: u32) -> Result<Box<dyn SerialPort>, serialport::Error> {
    serialport::new(port_name, baudrate)
        .timeout(Duration::from_millis(SERIAL_TIMEOUT_MS))
        .open()
}
