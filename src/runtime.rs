// 50 Hz loop with watchdog
// Note: a watchdog is a safety mechanism that triggers a safe action if something goes wrong
// Eg. without it if teleop crashes and stops sending commands, the motors would keep turning at the last speed

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::{
    CMD_TIMEOUT, LOOP_HZ, TOPIC_CMD_DRIVE, TOPIC_CMD_RESET, TOPIC_FAULTS, TOPIC_HEALTH,
};
use crate::messages::{DriveCommand, FaultReport, ResetCommand, RuntimeHealth};
use crate::motor::{FaultEvent, Motor, MotorConfig, MotorRegistry, SharedSerial};

/// What the loop sends to the motors this tick
#[derive(Debug, Clone, PartialEq)]
enum Actuation {
    /// Stop every live motor
    Stop,
    Drive(DriveCommand),
}

pub struct Runtime {
    registry: Arc<MotorRegistry>,
    latest_cmd: Option<DriveCommand>,
    cmd_received_at: Instant,
    cmd_timeout: Duration,
    health: RuntimeHealth,
}

impl Runtime {
    pub fn new(registry: Arc<MotorRegistry>) -> Self {
        Self::with_timeout(registry, CMD_TIMEOUT)
    }

    pub fn with_timeout(registry: Arc<MotorRegistry>, cmd_timeout: Duration) -> Self {
        Self {
            registry,
            latest_cmd: None,
            cmd_received_at: Instant::now(),
            cmd_timeout,
            health: RuntimeHealth::CmdStale, // Start stale until first cmd
        }
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    /// Process incoming command
    pub fn on_command(&mut self, cmd: DriveCommand) {
        debug!("Received command: {:?}", &cmd);
        self.latest_cmd = Some(cmd);
        self.cmd_received_at = Instant::now();
    }

    /// Compute actuation based on watchdog state
    fn compute_actuation(&mut self) -> Actuation {
        let cmd_age = self.cmd_received_at.elapsed();

        if cmd_age > self.cmd_timeout {
            // Watchdog triggered - stop the motors
            if self.health != RuntimeHealth::CmdStale {
                warn!("Command stale ({:?} old), stopping motors", cmd_age);
            }
            self.health = RuntimeHealth::CmdStale;
            Actuation::Stop
        } else if let Some(ref cmd) = self.latest_cmd {
            self.health = RuntimeHealth::Ok;
            Actuation::Drive(cmd.clone())
        } else {
            // No command ever received
            self.health = RuntimeHealth::CmdStale;
            Actuation::Stop
        }
    }

    /// Run one loop iteration against the motors
    pub fn tick(&mut self) -> RuntimeHealth {
        match self.compute_actuation() {
            Actuation::Stop => {
                for motor in self.registry.motors() {
                    if let Err(e) = motor.stop() {
                        warn!("Failed to stop {}: {}", motor.label(), e);
                    }
                }
            }
            Actuation::Drive(cmd) => {
                for (name, &speed) in &cmd.speeds {
                    let Some(motor) = self.registry.find(name) else {
                        warn!("Command for unknown motor {}", name);
                        continue;
                    };
                    if let Err(e) = motor.drive(speed) {
                        warn!("Failed to drive {}: {}", motor.label(), e);
                    }
                }
            }
        }
        self.health
    }

    /// Pulse a driver's reset line on a blocking worker so the loop keeps ticking
    pub fn request_reset(&self, cmd: &ResetCommand) -> Option<JoinHandle<()>> {
        let Some(motor) = self.registry.find(&cmd.motor) else {
            warn!("Reset requested for unknown motor {}", cmd.motor);
            return None;
        };

        info!("Resetting motor driver for {}", motor.label());
        Some(tokio::task::spawn_blocking(move || {
            if let Err(e) = motor.reset_driver() {
                warn!("Failed to reset {}: {}", motor.label(), e);
            }
        }))
    }
}

/// Register every configured motor and enable its drivers.
///
/// All motors share the microcontroller link when there is one; direct PWM is
/// enabled wherever it is wired (serial still wins for those motors).
pub fn register_motors(
    registry: &MotorRegistry,
    motors: &[MotorConfig],
    serial: Option<&SharedSerial>,
) -> crate::motor::Result<Vec<Arc<Motor>>> {
    let mut registered = Vec::with_capacity(motors.len());
    for config in motors {
        let motor = registry.register(config)?;
        if let Some(pwm) = config.pwm {
            motor.enable_pwm(pwm)?;
        }
        if let Some(link) = serial {
            motor.enable_serial(Arc::clone(link));
        }
        registered.push(motor);
    }
    Ok(registered)
}

pub async fn run(
    registry: Arc<MotorRegistry>,
    mut faults: broadcast::Receiver<FaultEvent>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let sub_drive = session.declare_subscriber(TOPIC_CMD_DRIVE).await?;
    let sub_reset = session.declare_subscriber(TOPIC_CMD_RESET).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;
    let pub_faults = session.declare_publisher(TOPIC_FAULTS).await?;

    let mut runtime = Runtime::new(registry);
    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        "Runtime started: {}Hz loop, {}ms watchdog timeout",
        LOOP_HZ,
        CMD_TIMEOUT.as_millis()
    );
    info!("Subscribed to: {}, {}", TOPIC_CMD_DRIVE, TOPIC_CMD_RESET);
    info!("Publishing to: {}, {}", TOPIC_HEALTH, TOPIC_FAULTS);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = &mut shutdown => {
                info!("Interrupted, leaving runtime loop");
                break;
            }
        }

        // 1. Drain all pending commands (non-blocking), keep latest
        while let Ok(Some(sample)) = sub_drive.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<DriveCommand>(&payload) {
                Ok(cmd) => runtime.on_command(cmd),
                Err(e) => warn!("Failed to parse command: {}", e),
            }
        }

        // 2. Operator resets run off the loop
        while let Ok(Some(sample)) = sub_reset.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<ResetCommand>(&payload) {
                Ok(cmd) => {
                    runtime.request_reset(&cmd);
                }
                Err(e) => warn!("Failed to parse reset request: {}", e),
            }
        }

        // 3. Drive motors (includes watchdog logic)
        let health = runtime.tick();

        // 4. Publish faults seen since the last tick
        loop {
            match faults.try_recv() {
                Ok(event) => {
                    let report_json = serde_json::to_string(&FaultReport::from(&event))?;
                    pub_faults.put(report_json).await?;
                }
                Err(TryRecvError::Lagged(missed)) => warn!("Dropped {} fault reports", missed),
                Err(_) => break,
            }
        }

        // 5. Publish health
        let health_json = serde_json::to_string(&health)?;
        pub_health.put(health_json).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::pins::shared;
    use crate::motor::sim::{SimulatedPins, SimulatedSerial};
    use crate::motor::{FaultMonitor, Level, MotorPacket, PwmConfig};

    fn setup() -> (Arc<SimulatedPins>, SimulatedSerial, Arc<MotorRegistry>) {
        let pins = Arc::new(SimulatedPins::new());
        let serial = SimulatedSerial::new();
        let (sink, _monitor) = FaultMonitor::channel();
        let registry = Arc::new(MotorRegistry::new(pins.clone(), sink));

        let link = shared(serial.clone());
        let motors = [
            MotorConfig::new("left_motor", 11, 12, 13),
            MotorConfig::new("right_motor", 15, 16, 18),
        ];
        register_motors(&registry, &motors, Some(&link)).unwrap();
        (pins, serial, registry)
    }

    #[test]
    fn test_starts_stale_and_stops_motors() {
        let (_pins, serial, registry) = setup();
        let mut runtime = Runtime::new(registry);
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);

        assert_eq!(runtime.tick(), RuntimeHealth::CmdStale);
        let stops: Vec<_> = serial.sent().into_iter().map(MotorPacket::from_byte).collect();
        assert_eq!(stops.len(), 2);
        assert!(stops.iter().all(|p| p.magnitude == 0));
    }

    #[test]
    fn test_drives_named_motors() {
        let (_pins, serial, registry) = setup();
        let mut runtime = Runtime::new(registry);

        runtime.on_command(DriveCommand::default().with("right_motor", -1.0).with("tail", 0.3));
        assert_eq!(runtime.tick(), RuntimeHealth::Ok);
        assert_eq!(serial.sent(), vec![0b01_1_11111]);
    }

    #[test]
    fn test_watchdog_stops_after_timeout() {
        let (_pins, serial, registry) = setup();
        let mut runtime = Runtime::with_timeout(registry, Duration::from_millis(20));

        runtime.on_command(DriveCommand::default().with("left_motor", 1.0));
        assert_eq!(runtime.tick(), RuntimeHealth::Ok);

        assert_eq!(runtime.health(), RuntimeHealth::Ok);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(runtime.tick(), RuntimeHealth::CmdStale);
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);
        assert_eq!(serial.last().map(|b| MotorPacket::from_byte(b).magnitude), Some(0));
    }

    #[test]
    fn test_pwm_only_motor_when_no_serial() {
        let pins = Arc::new(SimulatedPins::new());
        let (sink, _monitor) = FaultMonitor::channel();
        let registry = MotorRegistry::new(pins.clone(), sink);
        let config = MotorConfig::new("left", 1, 2, 3).with_pwm(PwmConfig::new(4, 5));

        let motors = register_motors(&registry, &[config], None).unwrap();
        motors[0].drive(-0.5).unwrap();
        assert_eq!(pins.level(5), Some(Level::Low));
        assert_eq!(pins.pwm_channel(4).unwrap().duty_cycle, 50.0);
    }

    #[tokio::test]
    async fn test_reset_request_runs_in_background() {
        let (pins, _serial, registry) = setup();
        let runtime = Runtime::new(registry);

        let handle = runtime
            .request_reset(&ResetCommand {
                motor: "right_motor".to_string(),
            })
            .unwrap();
        handle.await.unwrap();
        // Initial reset pulse plus the requested one
        assert_eq!(
            pins.history(18),
            vec![Level::Low, Level::High, Level::Low, Level::High]
        );

        assert!(runtime
            .request_reset(&ResetCommand {
                motor: "missing".to_string(),
            })
            .is_none());
    }
}
