// Raspberry Pi pin controller built on rppal
//
// Pins are addressed by their physical header position (BOARD numbering) and
// mapped to BCM GPIO numbers here. Direct motor PWM uses rppal's software PWM
// on the output pin.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rppal::gpio::{self, Gpio, InputPin, OutputPin, Trigger};
use tracing::{debug, info};

use super::pins::{EdgeCallback, Level, Pin, PinController, PinError, Pull, PwmHandle};

/// Physical header pin -> BCM GPIO, for the 40-pin header
const BOARD_TO_BCM: [(Pin, u8); 26] = [
    (3, 2),
    (5, 3),
    (7, 4),
    (8, 14),
    (10, 15),
    (11, 17),
    (12, 18),
    (13, 27),
    (15, 22),
    (16, 23),
    (18, 24),
    (19, 10),
    (21, 9),
    (22, 25),
    (23, 11),
    (24, 8),
    (26, 7),
    (27, 0),
    (28, 1),
    (29, 5),
    (31, 6),
    (32, 12),
    (33, 13),
    (35, 19),
    (36, 16),
    (37, 26),
];

fn to_bcm(pin: Pin) -> Result<u8, PinError> {
    BOARD_TO_BCM
        .iter()
        .find(|&&(board, _)| board == pin)
        .map(|&(_, bcm)| bcm)
        .ok_or(PinError::Unavailable(pin))
}

fn hardware(pin: Pin) -> impl FnOnce(gpio::Error) -> PinError {
    move |e| PinError::Hardware {
        pin,
        reason: e.to_string(),
    }
}

fn to_rppal(level: Level) -> gpio::Level {
    match level {
        Level::Low => gpio::Level::Low,
        Level::High => gpio::Level::High,
    }
}

fn from_rppal(level: gpio::Level) -> Level {
    match level {
        gpio::Level::Low => Level::Low,
        gpio::Level::High => Level::High,
    }
}

#[derive(Default)]
struct Claimed {
    inputs: HashMap<Pin, InputPin>,
    outputs: HashMap<Pin, OutputPin>,
    pwm: HashMap<PwmHandle, (Pin, f64)>,
    next_pwm: u32,
}

pub struct RpiPins {
    gpio: Gpio,
    claimed: Mutex<Claimed>,
}

impl RpiPins {
    pub fn new() -> Result<Self, PinError> {
        let gpio = Gpio::new().map_err(|e| PinError::Hardware {
            pin: 0,
            reason: e.to_string(),
        })?;
        info!("Raspberry Pi GPIO opened");
        Ok(Self {
            gpio,
            claimed: Mutex::new(Claimed::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Claimed> {
        self.claimed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PinController for RpiPins {
    fn configure_input(&self, pin: Pin, pull: Pull) -> Result<(), PinError> {
        let raw = self.gpio.get(to_bcm(pin)?).map_err(hardware(pin))?;
        let input = match pull {
            Pull::Off => raw.into_input(),
            Pull::Down => raw.into_input_pulldown(),
            Pull::Up => raw.into_input_pullup(),
        };
        self.lock().inputs.insert(pin, input);
        Ok(())
    }

    fn configure_output(&self, pin: Pin) -> Result<(), PinError> {
        let output = self
            .gpio
            .get(to_bcm(pin)?)
            .map_err(hardware(pin))?
            .into_output();
        self.lock().outputs.insert(pin, output);
        Ok(())
    }

    fn read(&self, pin: Pin) -> Result<Level, PinError> {
        let claimed = self.lock();
        if let Some(input) = claimed.inputs.get(&pin) {
            return Ok(from_rppal(input.read()));
        }
        if let Some(output) = claimed.outputs.get(&pin) {
            let level = if output.is_set_high() { Level::High } else { Level::Low };
            return Ok(level);
        }
        Err(PinError::NotConfigured {
            pin,
            expected: "input or output",
        })
    }

    fn write(&self, pin: Pin, level: Level) -> Result<(), PinError> {
        let mut claimed = self.lock();
        let output = claimed.outputs.get_mut(&pin).ok_or(PinError::NotConfigured {
            pin,
            expected: "output",
        })?;
        output.write(to_rppal(level));
        Ok(())
    }

    fn on_rising_edge(&self, pin: Pin, callback: EdgeCallback) -> Result<(), PinError> {
        let mut claimed = self.lock();
        let input = claimed.inputs.get_mut(&pin).ok_or(PinError::NotConfigured {
            pin,
            expected: "input",
        })?;
        input
            .set_async_interrupt(Trigger::RisingEdge, move |_| callback())
            .map_err(hardware(pin))
    }

    fn start_pwm(&self, pin: Pin, frequency: f64) -> Result<PwmHandle, PinError> {
        let mut claimed = self.lock();
        let output = claimed.outputs.get_mut(&pin).ok_or(PinError::NotConfigured {
            pin,
            expected: "output",
        })?;
        output.set_pwm_frequency(frequency, 0.0).map_err(hardware(pin))?;

        let handle = PwmHandle(claimed.next_pwm);
        claimed.next_pwm += 1;
        claimed.pwm.insert(handle, (pin, frequency));
        debug!("Software PWM on pin {} at {} Hz", pin, frequency);
        Ok(handle)
    }

    fn set_duty_cycle(&self, handle: PwmHandle, percent: f64) -> Result<(), PinError> {
        let mut claimed = self.lock();
        let &(pin, frequency) = claimed.pwm.get(&handle).ok_or(PinError::UnknownPwm(handle))?;
        let output = claimed.outputs.get_mut(&pin).ok_or(PinError::NotConfigured {
            pin,
            expected: "output",
        })?;
        output
            .set_pwm_frequency(frequency, (percent / 100.0).clamp(0.0, 1.0))
            .map_err(hardware(pin))
    }

    fn release(&self, pin: Pin) -> Result<(), PinError> {
        let (input, output) = {
            let mut claimed = self.lock();
            claimed.pwm.retain(|_, &mut (owner, _)| owner != pin);
            (claimed.inputs.remove(&pin), claimed.outputs.remove(&pin))
        };
        // Same constraint as release_all: interrupt threads are joined on drop
        drop(input);
        drop(output);
        debug!("Pin {} released", pin);
        Ok(())
    }

    fn release_all(&self) -> Result<(), PinError> {
        // Dropping an InputPin joins its interrupt thread, which may be waiting
        // on this lock inside a callback; drop outside it.
        let claimed = std::mem::take(&mut *self.lock());
        drop(claimed);
        info!("GPIO released");
        Ok(())
    }
}
