use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use facewatch_vehicle::domain::motor::Polarity;
use facewatch_vehicle::domain::motor_driver::MotorDriver;
use facewatch_vehicle::domain::state_machine::VehicleStateMachine;
use facewatch_vehicle::infrastructure::control_server::ControlServer;
use facewatch_vehicle::infrastructure::logging_motor_driver::LoggingMotorDriver;
use facewatch_vehicle::infrastructure::sysfs_gpio_driver::{SysfsGpioDriver, DEFAULT_GPIO_ROOT};

/// Receives motion commands over TCP and drives the wheel motors.
#[derive(Parser)]
#[command(name = "facewatch-vehicle", version)]
struct Cli {
    /// Address to accept the controller on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Stop when no command arrives for this long.
    #[arg(long, default_value_t = 3000)]
    timeout_ms: u64,

    /// Wiring correction per motor (FR,BR,FL,BL), each 1 or -1.
    #[arg(long, default_value = "-1,1,1,1", allow_hyphen_values = true)]
    polarity: Polarity,

    #[arg(long, value_enum, default_value_t = DriverKind::Log)]
    driver: DriverKind,

    /// IN1,IN2 GPIO pairs for FR, BR, FL, BL.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "16,17,18,19,27,26,25,33"
    )]
    gpio_pins: Vec<u32>,

    #[arg(long, default_value = DEFAULT_GPIO_ROOT)]
    gpio_root: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum DriverKind {
    /// Log motor outputs only.
    Log,
    /// Drive H-bridges through sysfs GPIO.
    Gpio,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let driver: Box<dyn MotorDriver> = match cli.driver {
        DriverKind::Log => Box::new(LoggingMotorDriver::new()),
        DriverKind::Gpio => Box::new(SysfsGpioDriver::open(&cli.gpio_root, &cli.gpio_pins)?),
    };
    let machine = VehicleStateMachine::new(
        driver,
        cli.polarity,
        Duration::from_millis(cli.timeout_ms),
    )?;
    let mut server = ControlServer::bind(cli.listen.as_str(), machine)?;

    let stop = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        log::info!("Interrupted, stopping motors");
        handler_flag.store(true, Ordering::Relaxed);
    })?;

    server.run(&stop)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["facewatch-vehicle"]).unwrap();
        assert_eq!(cli.listen, "0.0.0.0:8080");
        assert_eq!(cli.timeout_ms, 3000);
        assert_eq!(cli.polarity, Polarity::default());
        assert_eq!(cli.driver, DriverKind::Log);
        assert_eq!(cli.gpio_pins, vec![16, 17, 18, 19, 27, 26, 25, 33]);
    }

    #[test]
    fn test_polarity_with_leading_negative() {
        let cli =
            Cli::try_parse_from(["facewatch-vehicle", "--polarity", "-1,-1,1,1"]).unwrap();
        assert_eq!(cli.polarity, Polarity::new([-1, -1, 1, 1]).unwrap());
    }

    #[test]
    fn test_rejects_bad_polarity() {
        assert!(Cli::try_parse_from(["facewatch-vehicle", "--polarity", "1,2,1,1"]).is_err());
    }

    #[test]
    fn test_gpio_driver_and_pins() {
        let cli = Cli::try_parse_from([
            "facewatch-vehicle",
            "--driver",
            "gpio",
            "--gpio-pins",
            "1,2,3,4,5,6,7,8",
        ])
        .unwrap();
        assert_eq!(cli.driver, DriverKind::Gpio);
        assert_eq!(cli.gpio_pins, (1..=8).collect::<Vec<u32>>());
    }
}
