// Motor aggregate for a Pololu High-Power 18v15 style driver
//
// A motor owns its two fault lines, its reset line and its calibration. After
// registration at least one output driver must be enabled: a serial link to a
// microcontroller that generates hardware PWM, or PWM straight from the pin
// controller. When both are present the serial link wins.

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use super::error::{MotorError, Result};
use super::fault::{FaultEdge, FaultSink};
use super::packet;
use super::pins::{EdgeCallback, Level, Pin, PinController, Pull, PwmHandle, SharedSerial};
use super::scaling::Calibration;

/// Default software PWM frequency in Hz
pub const DEFAULT_PWM_FREQUENCY: f64 = 28_000.0;

/// Minimum low pulse on the reset line that clears a latched driver
pub const RESET_PULSE: Duration = Duration::from_millis(100);

/// Wiring and calibration of one motor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorConfig {
    pub name: String,
    /// Driver fault line FF1
    pub fault_1: Pin,
    /// Driver fault line FF2
    pub fault_2: Pin,
    pub reset: Pin,
    #[serde(default)]
    pub start_input: f64,
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,
    /// Direct PWM wiring, if the driver is attached to the pin controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pwm: Option<PwmConfig>,
}

fn default_max_speed() -> f64 {
    1.0
}

impl MotorConfig {
    pub fn new(name: impl Into<String>, fault_1: Pin, fault_2: Pin, reset: Pin) -> Self {
        Self {
            name: name.into(),
            fault_1,
            fault_2,
            reset,
            start_input: 0.0,
            max_speed: default_max_speed(),
            pwm: None,
        }
    }

    pub fn with_calibration(mut self, start_input: f64, max_speed: f64) -> Self {
        self.start_input = start_input;
        self.max_speed = max_speed;
        self
    }

    pub fn with_pwm(mut self, pwm: PwmConfig) -> Self {
        self.pwm = Some(pwm);
        self
    }

    /// Check the calibration range. Out-of-range values are rejected, never clamped.
    pub fn calibration(&self) -> Result<Calibration> {
        let check = |field: &str, value: f64| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(MotorError::InvalidConfiguration {
                    motor: self.name.clone(),
                    reason: format!("{} should be between 0 and 1, got {}", field, value),
                })
            }
        };
        check("start_input", self.start_input)?;
        check("max_speed", self.max_speed)?;

        Ok(Calibration {
            start_input: self.start_input,
            max_speed: self.max_speed,
        })
    }
}

/// Direct PWM wiring
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PwmConfig {
    pub pin: Pin,
    pub dir: Pin,
    #[serde(default = "default_frequency")]
    pub frequency: f64,
}

fn default_frequency() -> f64 {
    DEFAULT_PWM_FREQUENCY
}

impl PwmConfig {
    pub fn new(pin: Pin, dir: Pin) -> Self {
        Self {
            pin,
            dir,
            frequency: DEFAULT_PWM_FREQUENCY,
        }
    }
}

/// Running PWM output stage
#[derive(Debug, Clone, Copy)]
struct PwmOutput {
    config: PwmConfig,
    handle: PwmHandle,
}

/// Active output path. Serial keeps an already started PWM stage idle.
enum Backend {
    None,
    Pwm(PwmOutput),
    Serial {
        link: SharedSerial,
        idle_pwm: Option<PwmOutput>,
    },
}

/// Which output path `drive` currently uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    None,
    Pwm,
    Serial,
}

pub struct Motor {
    id: u8,
    name: Arc<str>,
    fault_1: Pin,
    fault_2: Pin,
    reset: Pin,
    calibration: Calibration,
    hw: Arc<dyn PinController>,
    backend: Mutex<Backend>,
}

impl Motor {
    /// Set up the fault interrupts and reset the driver. Called by the registry
    /// with an id it has reserved.
    pub(crate) fn init(
        id: u8,
        config: &MotorConfig,
        calibration: Calibration,
        hw: Arc<dyn PinController>,
        faults: &FaultSink,
    ) -> Result<Self> {
        debug!("Initializing motor {}", config.name);
        let motor = Self {
            id,
            name: Arc::from(config.name.as_str()),
            fault_1: config.fault_1,
            fault_2: config.fault_2,
            reset: config.reset,
            calibration,
            hw,
            backend: Mutex::new(Backend::None),
        };

        if let Err(e) = motor.attach(faults) {
            warn!("Failed to initialize {}: {}", motor.name, e);
            if let Err(cleanup) = motor.release_pins() {
                warn!("Failed to release pins of {}: {}", motor.name, cleanup);
            }
            return Err(e);
        }
        Ok(motor)
    }

    fn attach(&self, faults: &FaultSink) -> Result<()> {
        debug!("Setting up fault interrupt for {}", self.name);
        for pin in [self.fault_1, self.fault_2] {
            self.hw.configure_input(pin, Pull::Down)?;
        }
        for pin in [self.fault_1, self.fault_2] {
            self.hw.on_rising_edge(pin, self.fault_callback(pin, faults))?;
        }

        debug!("Resetting motor driver for {}", self.name);
        self.hw.configure_output(self.reset)?;
        self.reset_driver()
    }

    /// Detach the fault interrupts and hand every pin back to the controller.
    ///
    /// The motor is left without a driver. Keeps going past individual
    /// failures and returns the first one.
    pub(crate) fn release_pins(&self) -> Result<()> {
        let backend = mem::replace(&mut *self.lock_backend(), Backend::None);
        let pwm = match backend {
            Backend::Pwm(output)
            | Backend::Serial {
                idle_pwm: Some(output),
                ..
            } => Some(output.config),
            Backend::None | Backend::Serial { idle_pwm: None, .. } => None,
        };

        let mut pins = vec![self.fault_1, self.fault_2, self.reset];
        if let Some(config) = pwm {
            pins.extend([config.pin, config.dir]);
        }

        let mut first_error = None;
        for pin in pins {
            if let Err(e) = self.hw.release(pin) {
                first_error.get_or_insert(e);
            }
        }
        debug!("Pins of {} released", self.name);
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Edge handler: sample both lines and hand off to the fault monitor
    fn fault_callback(&self, source: Pin, faults: &FaultSink) -> EdgeCallback {
        let hw = Arc::downgrade(&self.hw);
        let sink = faults.clone();
        let motor = Arc::clone(&self.name);
        let (motor_id, fault_1, fault_2) = (self.id, self.fault_1, self.fault_2);

        Box::new(move || {
            let Some(hw) = hw.upgrade() else {
                return;
            };
            let level = |pin| hw.read(pin).unwrap_or(Level::Low);
            sink.report(FaultEdge {
                motor_id,
                motor: Arc::clone(&motor),
                source,
                fault_1: level(fault_1),
                fault_2: level(fault_2),
            });
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// "name (ID# n)"
    pub fn label(&self) -> String {
        format!("{} (ID# {})", self.name, self.id)
    }

    pub fn backend(&self) -> BackendKind {
        match &*self.lock_backend() {
            Backend::None => BackendKind::None,
            Backend::Pwm(_) => BackendKind::Pwm,
            Backend::Serial { .. } => BackendKind::Serial,
        }
    }

    fn lock_backend(&self) -> MutexGuard<'_, Backend> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drive the motor straight from the pin controller.
    ///
    /// If serial is already enabled it stays authoritative and this PWM stage
    /// is kept idle at 0%.
    pub fn enable_pwm(&self, config: PwmConfig) -> Result<()> {
        debug!("Setting up PWM pins {} / {} for {}", config.pin, config.dir, self.name);
        self.hw.configure_output(config.pin)?;
        self.hw.configure_output(config.dir)?;

        debug!("Starting PWM driver at {} Hz", config.frequency);
        self.hw.write(config.dir, Level::Low)?;
        let handle = self.hw.start_pwm(config.pin, config.frequency)?;
        self.hw.set_duty_cycle(handle, 0.0)?;
        let output = PwmOutput { config, handle };

        let mut backend = self.lock_backend();
        *backend = match mem::replace(&mut *backend, Backend::None) {
            Backend::Serial { link, .. } => {
                info!("PWM enabled for {}, serial keeps priority", self.name);
                Backend::Serial {
                    link,
                    idle_pwm: Some(output),
                }
            }
            Backend::None | Backend::Pwm(_) => {
                info!("PWM enabled for {}", self.name);
                Backend::Pwm(output)
            }
        };
        Ok(())
    }

    /// Send speed commands to the microcontroller over `link`
    pub fn enable_serial(&self, link: SharedSerial) {
        let mut backend = self.lock_backend();
        *backend = match mem::replace(&mut *backend, Backend::None) {
            Backend::None => Backend::Serial {
                link,
                idle_pwm: None,
            },
            Backend::Pwm(output) => Backend::Serial {
                link,
                idle_pwm: Some(output),
            },
            Backend::Serial { idle_pwm, .. } => Backend::Serial { link, idle_pwm },
        };
        info!("Serial enabled for {}", self.name);
    }

    /// Drive the motor at `speed` in [-1, 1].
    ///
    /// Serial takes priority over PWM. Fails if neither is enabled or if the
    /// speed is out of range (NaN included); nothing is written in either case.
    pub fn drive(&self, speed: f64) -> Result<()> {
        if !(-1.0..=1.0).contains(&speed) {
            warn!("Rejected speed {} for {}", speed, self.name);
            return Err(MotorError::SpeedOutOfRange {
                motor: self.name.to_string(),
                speed,
            });
        }

        let backend = self.lock_backend();
        match &*backend {
            Backend::Serial { link, .. } => self.transmit(link, speed),
            Backend::Pwm(output) => self.pwm_drive(output, speed),
            Backend::None => {
                error!("Cannot drive {}! No serial or PWM enabled.", self.name);
                Err(MotorError::NoDriverConfigured {
                    motor: self.name.to_string(),
                })
            }
        }
    }

    fn transmit(&self, link: &SharedSerial, speed: f64) -> Result<()> {
        let byte = packet::encode(self.id, speed, &self.calibration);
        trace!("{} -> serial 0x{:02X}", self.name, byte);

        let mut link = link.lock().unwrap_or_else(PoisonError::into_inner);
        link.write_bytes(&[byte])?;
        Ok(())
    }

    fn pwm_drive(&self, output: &PwmOutput, speed: f64) -> Result<()> {
        let scaled = self.calibration.scale(speed);
        let direction = if scaled < 0.0 { Level::Low } else { Level::High };
        let duty = scaled.abs() * 100.0;
        trace!("{} -> PWM {:.2}% {:?}", self.name, duty, direction);

        self.hw.write(output.config.dir, direction)?;
        self.hw.set_duty_cycle(output.handle, duty)?;
        Ok(())
    }

    /// Command zero speed. A motor without any driver has nothing to stop.
    pub fn stop(&self) -> Result<()> {
        if self.backend() == BackendKind::None {
            debug!("{} has no driver enabled, nothing to stop", self.name);
            return Ok(());
        }
        self.drive(0.0)
    }

    /// Pulse the reset line low for `RESET_PULSE`.
    ///
    /// Clears a latched short-circuit fault. Blocks the calling thread for the
    /// whole pulse.
    pub fn reset_driver(&self) -> Result<()> {
        self.hw.write(self.reset, Level::Low)?;
        thread::sleep(RESET_PULSE);
        self.hw.write(self.reset, Level::High)?;
        debug!("Motor driver for {} reset", self.name);
        Ok(())
    }
}

impl fmt::Display for Motor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for Motor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Motor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("fault_1", &self.fault_1)
            .field("fault_2", &self.fault_2)
            .field("reset", &self.reset)
            .field("calibration", &self.calibration)
            .field("backend", &self.backend())
            .finish()
    }
}
