// In-memory pin controller and serial link
//
// Used when running without hardware (--simulate) and by the tests. Levels,
// duty cycles and written bytes are recorded so they can be inspected, and
// fault edges can be injected with `set_input_level`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use super::pins::{EdgeCallback, Level, Pin, PinController, PinError, Pull, PwmHandle, SerialLink};

/// How a simulated pin is configured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input(Pull),
    Output,
}

/// State of a simulated PWM channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PwmChannel {
    pub pin: Pin,
    pub frequency: f64,
    pub duty_cycle: f64,
}

#[derive(Default)]
struct SimState {
    modes: HashMap<Pin, PinMode>,
    levels: HashMap<Pin, Level>,
    callbacks: HashMap<Pin, Vec<Arc<EdgeCallback>>>,
    pwm: HashMap<PwmHandle, PwmChannel>,
    next_pwm: u32,
    history: HashMap<Pin, Vec<Level>>,
    unavailable: HashSet<Pin>,
    releases: usize,
}

#[derive(Default)]
pub struct SimulatedPins {
    state: Mutex<SimState>,
}

impl SimulatedPins {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drive an input line from the outside, firing edge callbacks on a
    /// low-to-high transition.
    pub fn set_input_level(&self, pin: Pin, level: Level) -> Result<(), PinError> {
        let callbacks = {
            let mut state = self.lock();
            if !matches!(state.modes.get(&pin), Some(PinMode::Input(_))) {
                return Err(PinError::NotConfigured {
                    pin,
                    expected: "input",
                });
            }
            let previous = state.levels.insert(pin, level).unwrap_or(Level::Low);
            if previous == Level::Low && level == Level::High {
                state.callbacks.get(&pin).cloned().unwrap_or_default()
            } else {
                Vec::new()
            }
        };

        // Callbacks read pins, so the state lock must be free here
        for callback in callbacks {
            callback();
        }
        Ok(())
    }

    pub fn level(&self, pin: Pin) -> Option<Level> {
        self.lock().levels.get(&pin).copied()
    }

    pub fn mode(&self, pin: Pin) -> Option<PinMode> {
        self.lock().modes.get(&pin).copied()
    }

    /// Every level written to an output pin, oldest first
    pub fn history(&self, pin: Pin) -> Vec<Level> {
        self.lock().history.get(&pin).cloned().unwrap_or_default()
    }

    pub fn pwm_channel(&self, pin: Pin) -> Option<PwmChannel> {
        self.lock().pwm.values().find(|channel| channel.pin == pin).copied()
    }

    pub fn edge_callbacks(&self, pin: Pin) -> usize {
        self.lock().callbacks.get(&pin).map_or(0, Vec::len)
    }

    /// Make `pin` refuse to be configured, as if it were missing on the board
    pub fn mark_unavailable(&self, pin: Pin) {
        self.lock().unavailable.insert(pin);
    }

    /// How many times `release_all` has been called
    pub fn release_count(&self) -> usize {
        self.lock().releases
    }
}

impl PinController for SimulatedPins {
    fn configure_input(&self, pin: Pin, pull: Pull) -> Result<(), PinError> {
        let mut state = self.lock();
        if state.unavailable.contains(&pin) {
            return Err(PinError::Unavailable(pin));
        }
        state.modes.insert(pin, PinMode::Input(pull));
        let resting = if pull == Pull::Up { Level::High } else { Level::Low };
        state.levels.insert(pin, resting);
        Ok(())
    }

    fn configure_output(&self, pin: Pin) -> Result<(), PinError> {
        let mut state = self.lock();
        if state.unavailable.contains(&pin) {
            return Err(PinError::Unavailable(pin));
        }
        state.modes.insert(pin, PinMode::Output);
        state.levels.entry(pin).or_insert(Level::Low);
        Ok(())
    }

    fn read(&self, pin: Pin) -> Result<Level, PinError> {
        let state = self.lock();
        if !state.modes.contains_key(&pin) {
            return Err(PinError::NotConfigured {
                pin,
                expected: "input or output",
            });
        }
        Ok(state.levels.get(&pin).copied().unwrap_or(Level::Low))
    }

    fn write(&self, pin: Pin, level: Level) -> Result<(), PinError> {
        let mut state = self.lock();
        if state.modes.get(&pin) != Some(&PinMode::Output) {
            return Err(PinError::NotConfigured {
                pin,
                expected: "output",
            });
        }
        state.levels.insert(pin, level);
        state.history.entry(pin).or_default().push(level);
        trace!("Pin {} -> {:?}", pin, level);
        Ok(())
    }

    fn on_rising_edge(&self, pin: Pin, callback: EdgeCallback) -> Result<(), PinError> {
        let mut state = self.lock();
        if !matches!(state.modes.get(&pin), Some(PinMode::Input(_))) {
            return Err(PinError::NotConfigured {
                pin,
                expected: "input",
            });
        }
        state.callbacks.entry(pin).or_default().push(Arc::new(callback));
        Ok(())
    }

    fn start_pwm(&self, pin: Pin, frequency: f64) -> Result<PwmHandle, PinError> {
        let mut state = self.lock();
        if state.modes.get(&pin) != Some(&PinMode::Output) {
            return Err(PinError::NotConfigured {
                pin,
                expected: "output",
            });
        }
        let handle = PwmHandle(state.next_pwm);
        state.next_pwm += 1;
        state.pwm.insert(
            handle,
            PwmChannel {
                pin,
                frequency,
                duty_cycle: 0.0,
            },
        );
        Ok(handle)
    }

    fn set_duty_cycle(&self, handle: PwmHandle, percent: f64) -> Result<(), PinError> {
        let mut state = self.lock();
        let channel = state
            .pwm
            .get_mut(&handle)
            .ok_or(PinError::UnknownPwm(handle))?;
        if !(0.0..=100.0).contains(&percent) {
            return Err(PinError::Hardware {
                pin: channel.pin,
                reason: format!("duty cycle {}% out of range", percent),
            });
        }
        channel.duty_cycle = percent;
        trace!("PWM on pin {} -> {:.2}%", channel.pin, percent);
        Ok(())
    }

    fn release(&self, pin: Pin) -> Result<(), PinError> {
        let callbacks = {
            let mut state = self.lock();
            state.modes.remove(&pin);
            state.levels.remove(&pin);
            state.pwm.retain(|_, channel| channel.pin != pin);
            state.callbacks.remove(&pin)
        };
        drop(callbacks);
        trace!("Pin {} released", pin);
        Ok(())
    }

    fn release_all(&self) -> Result<(), PinError> {
        // Callbacks are dropped outside the lock
        let callbacks = {
            let mut state = self.lock();
            state.modes.clear();
            state.levels.clear();
            state.pwm.clear();
            state.releases += 1;
            std::mem::take(&mut state.callbacks)
        };
        drop(callbacks);
        debug!("Simulated pins released");
        Ok(())
    }
}

/// Serial link that records every byte written
#[derive(Debug, Clone, Default)]
pub struct SimulatedSerial {
    sent: Arc<Mutex<Vec<u8>>>,
}

impl SimulatedSerial {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<u8> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn last(&self) -> Option<u8> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .copied()
    }
}

impl SerialLink for SimulatedSerial {
    fn write_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        for byte in bytes {
            trace!("Serial tx {:#010b}", byte);
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_rising_edge_fires_once() {
        let pins = SimulatedPins::new();
        let hits = Arc::new(AtomicUsize::new(0));
        pins.configure_input(7, Pull::Down).unwrap();
        let counter = Arc::clone(&hits);
        pins.on_rising_edge(7, Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        pins.set_input_level(7, Level::High).unwrap();
        pins.set_input_level(7, Level::High).unwrap();
        pins.set_input_level(7, Level::Low).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_write_requires_output() {
        let pins = SimulatedPins::new();
        assert!(pins.write(3, Level::High).is_err());
        pins.configure_output(3).unwrap();
        assert!(pins.write(3, Level::High).is_ok());
    }

    #[test]
    fn test_release_detaches_one_pin() {
        let pins = SimulatedPins::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for pin in [7, 8] {
            pins.configure_input(pin, Pull::Down).unwrap();
            let counter = Arc::clone(&hits);
            pins.on_rising_edge(pin, Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pins.configure_output(4).unwrap();
        let handle = pins.start_pwm(4, 1000.0).unwrap();

        pins.release(7).unwrap();
        pins.release(4).unwrap();
        pins.release(9).unwrap();

        assert_eq!(pins.edge_callbacks(7), 0);
        assert_eq!(pins.mode(7), None);
        assert!(pins.set_input_level(7, Level::High).is_err());
        assert!(pins.set_duty_cycle(handle, 10.0).is_err());

        pins.set_input_level(8, Level::High).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(pins.release_count(), 0);
    }

    #[test]
    fn test_unavailable_pin_cannot_be_configured() {
        let pins = SimulatedPins::new();
        pins.mark_unavailable(3);
        assert!(matches!(pins.configure_output(3), Err(PinError::Unavailable(3))));
        assert!(matches!(
            pins.configure_input(3, Pull::Down),
            Err(PinError::Unavailable(3))
        ));
    }

    #[test]
    fn test_release_clears_everything() {
        let pins = SimulatedPins::new();
        pins.configure_output(4).unwrap();
        let handle = pins.start_pwm(4, 1000.0).unwrap();
        pins.release_all().unwrap();

        assert!(pins.set_duty_cycle(handle, 10.0).is_err());
        assert_eq!(pins.mode(4), None);
        assert_eq!(pins.release_count(), 1);
    }
}
