// Registry of live motors
//
// At most four motors can be registered at once, matching the two id bits of
// the serial packet. Ids are slot indices: a new motor takes the lowest free
// slot, and a slot is only freed by shutting down or deregistering its motor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use super::driver::{Motor, MotorConfig};
use super::error::{MotorError, Result};
use super::fault::FaultSink;
use super::pins::PinController;

/// Maximum number of motors registered at the same time
pub const MAX_MOTORS: usize = 4;

type Slots = [Option<Arc<Motor>>; MAX_MOTORS];

pub struct MotorRegistry {
    hw: Arc<dyn PinController>,
    faults: FaultSink,
    slots: Mutex<Slots>,
    released: AtomicBool,
}

impl MotorRegistry {
    pub fn new(hw: Arc<dyn PinController>, faults: FaultSink) -> Self {
        Self {
            hw,
            faults,
            slots: Mutex::new(Default::default()),
            released: AtomicBool::new(false),
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create, reset and register a motor.
    ///
    /// The slot stays locked for the whole initialisation so two concurrent
    /// registrations cannot take the same id.
    pub fn register(&self, config: &MotorConfig) -> Result<Arc<Motor>> {
        let calibration = config.calibration()?;

        let mut slots = self.lock_slots();
        let Some(slot) = slots.iter().position(Option::is_none) else {
            warn!("Cannot register {}, all {} motors in use", config.name, MAX_MOTORS);
            return Err(MotorError::CapacityExceeded {
                capacity: MAX_MOTORS,
            });
        };

        let motor = Arc::new(Motor::init(
            slot as u8,
            config,
            calibration,
            Arc::clone(&self.hw),
            &self.faults,
        )?);

        debug!("Registering motor {}", motor.label());
        slots[slot] = Some(Arc::clone(&motor));
        self.released.store(false, Ordering::SeqCst);
        info!("Motor {} initialized", motor.label());
        Ok(motor)
    }

    pub fn get(&self, id: u8) -> Option<Arc<Motor>> {
        self.lock_slots().get(id as usize)?.clone()
    }

    /// First live motor called `name`
    pub fn find(&self, name: &str) -> Option<Arc<Motor>> {
        self.lock_slots()
            .iter()
            .flatten()
            .find(|motor| motor.name() == name)
            .cloned()
    }

    /// Live motors in id order
    pub fn motors(&self) -> Vec<Arc<Motor>> {
        self.lock_slots().iter().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock_slots().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot holding exactly this motor instance
    fn slot_of<'a>(slots: &'a mut Slots, motor: &Motor) -> Result<&'a mut Option<Arc<Motor>>> {
        match slots.get_mut(motor.id() as usize) {
            Some(slot) if slot.as_deref().is_some_and(|live| std::ptr::eq(live, motor)) => Ok(slot),
            _ => Err(MotorError::UnknownMotor {
                motor: motor.name().to_string(),
                id: motor.id(),
            }),
        }
    }

    /// Remove a motor without commanding it. Its id becomes free and its pins
    /// go back to the controller.
    pub fn deregister(&self, motor: &Motor) -> Result<Arc<Motor>> {
        let mut slots = self.lock_slots();
        let slot = Self::slot_of(&mut slots, motor)?;
        debug!("Deregistering motor {}", motor.label());
        let removed = slot.take().ok_or_else(|| MotorError::UnknownMotor {
            motor: motor.name().to_string(),
            id: motor.id(),
        })?;
        // Released under the slot lock so a new registration cannot claim the
        // pins before the old interrupts are gone
        removed.release_pins()?;
        Ok(removed)
    }

    /// Stop and deregister a motor. Fails if it is not registered here.
    pub fn shutdown(&self, motor: &Motor) -> Result<()> {
        debug!("Shutting down motor {}", motor.label());
        let mut slots = self.lock_slots();
        let slot = Self::slot_of(&mut slots, motor)?;

        debug!("Stopping motor {}", motor.label());
        motor.stop()?;

        debug!("Deregistering motor {}", motor.label());
        slot.take();
        motor.release_pins()?;
        info!("Motor {} shut down", motor.label());
        Ok(())
    }

    /// Stop and deregister every motor, then release the pin controller.
    ///
    /// Keeps going past individual failures and returns the first one.
    pub fn shutdown_all(&self) -> Result<()> {
        info!("Shutting down all motors");
        let mut first_error = None;

        {
            let mut slots = self.lock_slots();
            for slot in slots.iter_mut() {
                let Some(motor) = slot.take() else {
                    continue;
                };
                debug!("Stopping motor {}", motor.label());
                if let Err(e) = motor.stop() {
                    warn!("Failed to stop {}: {}", motor.label(), e);
                    first_error.get_or_insert(e);
                }
                info!("Motor {} shut down", motor.label());
            }
        }

        if !self.released.swap(true, Ordering::SeqCst) {
            debug!("Releasing pin controller");
            if let Err(e) = self.hw.release_all() {
                warn!("Failed to release pins: {}", e);
                first_error.get_or_insert(e.into());
            }
        }

        info!("All motors shut down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for MotorRegistry {
    fn drop(&mut self) {
        // Leave the hardware stopped and released if the owner did not
        if !self.released.load(Ordering::SeqCst) {
            if let Err(e) = self.shutdown_all() {
                warn!("Failed to shut down motors on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::fault::FaultMonitor;
    use crate::motor::pins::PinError;
    use crate::motor::sim::SimulatedPins;
    use crate::motor::PwmConfig;

    fn registry() -> (Arc<SimulatedPins>, MotorRegistry) {
        let pins = Arc::new(SimulatedPins::new());
        let (sink, _monitor) = FaultMonitor::channel();
        let registry = MotorRegistry::new(pins.clone(), sink);
        (pins, registry)
    }

    fn config(index: u8) -> MotorConfig {
        MotorConfig::new(format!("motor_{index}"), index * 3 + 1, index * 3 + 2, index * 3 + 3)
    }

    #[test]
    fn test_ids_are_sequential() {
        let (_pins, registry) = registry();
        for index in 0..3 {
            let motor = registry.register(&config(index)).unwrap();
            assert_eq!(motor.id(), index);
        }
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_lowest_free_id_is_reused() {
        let (_pins, registry) = registry();
        let motors: Vec<_> = (0..3).map(|i| registry.register(&config(i)).unwrap()).collect();

        registry.shutdown(&motors[1]).unwrap();
        assert!(registry.get(1).is_none());

        let replacement = registry.register(&config(5)).unwrap();
        assert_eq!(replacement.id(), 1);
        assert_eq!(registry.find("motor_5").map(|m| m.id()), Some(1));
    }

    #[test]
    fn test_invalid_config_does_not_take_a_slot() {
        let (_pins, registry) = registry();
        let bad = config(0).with_calibration(0.0, 2.0);
        assert!(matches!(
            registry.register(&bad),
            Err(MotorError::InvalidConfiguration { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_second_shutdown_fails() {
        let (_pins, registry) = registry();
        let motor = registry.register(&config(0)).unwrap();

        registry.shutdown(&motor).unwrap();
        assert!(matches!(
            registry.shutdown(&motor),
            Err(MotorError::UnknownMotor { id: 0, .. })
        ));
    }

    #[test]
    fn test_foreign_motor_is_unknown() {
        let (_pins, first) = registry();
        let (_other_pins, second) = registry();
        let motor = first.register(&config(0)).unwrap();
        second.register(&config(1)).unwrap();

        assert!(matches!(
            second.deregister(&motor),
            Err(MotorError::UnknownMotor { .. })
        ));
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_failed_registration_leaves_no_interrupts() {
        let (pins, registry) = registry();
        pins.mark_unavailable(3);

        assert!(matches!(
            registry.register(&config(0)),
            Err(MotorError::Pin(PinError::Unavailable(3)))
        ));
        assert!(registry.is_empty());
        assert_eq!(pins.edge_callbacks(1), 0);
        assert_eq!(pins.edge_callbacks(2), 0);
    }

    #[test]
    fn test_shutdown_releases_motor_pins() {
        let (pins, registry) = registry();
        let motor = registry.register(&config(0)).unwrap();
        let other = registry.register(&config(1)).unwrap();
        motor.enable_pwm(PwmConfig::new(20, 21)).unwrap();

        registry.shutdown(&motor).unwrap();
        assert_eq!(pins.edge_callbacks(1), 0);
        assert_eq!(pins.edge_callbacks(2), 0);
        assert_eq!(pins.mode(3), None);
        assert!(pins.pwm_channel(20).is_none());

        // Other motors keep their interrupts
        assert_eq!(pins.edge_callbacks(4), 1);
        assert_eq!(pins.edge_callbacks(5), 1);
        assert_eq!(pins.release_count(), 0);

        registry.deregister(&other).unwrap();
        assert_eq!(pins.edge_callbacks(4), 0);
        assert_eq!(pins.mode(6), None);
    }

    #[test]
    fn test_drop_releases_pins() {
        let (pins, registry) = registry();
        registry.register(&config(0)).unwrap();
        drop(registry);
        assert_eq!(pins.release_count(), 1);
    }
}
