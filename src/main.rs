use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use motor_drive_runtime::config::{RuntimeConfig, SerialConfig};
use motor_drive_runtime::motor::pins::{open_serial, shared};
use motor_drive_runtime::motor::sim::{SimulatedPins, SimulatedSerial};
use motor_drive_runtime::motor::{FaultMonitor, MotorRegistry, PinController, SharedSerial};
use motor_drive_runtime::runtime;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Motor actuation runtime: drives the robot's motors from network commands
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Motor layout (JSON). Defaults to the built-in four-motor layout
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Microcontroller serial port, overrides the layout file
    #[arg(short, long)]
    port: Option<String>,

    /// Run against simulated pins and serial link (no hardware)
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init(); // installs the subscriber globally

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), BoxError> {
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(port) = args.port {
        config.serial.get_or_insert_with(SerialConfig::default).port = port;
    }

    let hw = if args.simulate {
        info!("Using simulated pins");
        Arc::new(SimulatedPins::new()) as Arc<dyn PinController>
    } else {
        hardware_pins()?
    };

    let (sink, monitor) = FaultMonitor::channel();
    let fault_events = monitor.subscribe();
    let monitor_task = tokio::spawn(monitor.run());

    let registry = Arc::new(MotorRegistry::new(hw, sink));
    let serial = connect_microcontroller(&config, args.simulate);

    info!("Initializing motors");
    let result = match runtime::register_motors(&registry, &config.motors, serial.as_ref()) {
        Ok(motors) => {
            info!("{} motors ready", motors.len());
            runtime::run(Arc::clone(&registry), fault_events).await
        }
        Err(e) => Err(e.into()),
    };

    info!("Shutting down...");
    if let Err(e) = registry.shutdown_all() {
        warn!("Shutdown incomplete: {}", e);
    }
    monitor_task.abort();

    info!("All done");
    result
}

/// Open the microcontroller link. Without it, motors fall back to direct PWM.
fn connect_microcontroller(config: &RuntimeConfig, simulate: bool) -> Option<SharedSerial> {
    if simulate {
        return Some(shared(SimulatedSerial::new()));
    }

    let serial = config.serial.as_ref()?;
    info!("Connecting microcontroller on {}", serial.port);
    match open_serial(&serial.port, serial.baudrate) {
        Ok(port) => Some(shared(port)),
        Err(e) => {
            warn!("The microcontroller is not connected: {}", e);
            None
        }
    }
}

#[cfg(feature = "rpi")]
fn hardware_pins() -> Result<Arc<dyn PinController>, BoxError> {
    let pins = motor_drive_runtime::motor::rpi::RpiPins::new()?;
    Ok(Arc::new(pins))
}

#[cfg(not(feature = "rpi"))]
fn hardware_pins() -> Result<Arc<dyn PinController>, BoxError> {
    Err("built without the `rpi` feature; run with --simulate".into())
}
