use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::motor::{Direction, MotorOutputs, ALL_STOPPED};
use crate::domain::motor_driver::{DriverError, MotorDriver};

pub const DEFAULT_GPIO_ROOT: &str = "/sys/class/gpio";

/// IN1/IN2 pairs for FR, BR, FL, BL on the reference wiring.
pub const DEFAULT_PINS: [u32; 8] = [16, 17, 18, 19, 27, 26, 25, 33];

/// One H-bridge channel: two GPIO lines per motor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Bridge {
    in1: u32,
    in2: u32,
}

impl Bridge {
    fn levels(direction: Direction) -> (u8, u8) {
        match direction {
            Direction::Forward => (1, 0),
            Direction::Backward => (0, 1),
            Direction::Stopped => (0, 0),
        }
    }
}

/// Drives the H-bridge inputs through the Linux sysfs GPIO interface.
pub struct SysfsGpioDriver {
    root: PathBuf,
    bridges: [Bridge; 4],
}

impl SysfsGpioDriver {
    /// Exports and configures every pin as an output, all low.
    ///
    /// `pins` holds IN1, IN2 for each motor in FR, BR, FL, BL order.
    pub fn open(root: impl Into<PathBuf>, pins: &[u32]) -> Result<Self, DriverError> {
        if pins.len() != 8 {
            return Err(DriverError::PinCount(pins.len()));
        }
        let root = root.into();
        let mut bridges = [Bridge { in1: 0, in2: 0 }; 4];
        for (bridge, pair) in bridges.iter_mut().zip(pins.chunks_exact(2)) {
            *bridge = Bridge {
                in1: pair[0],
                in2: pair[1],
            };
        }

        for &pin in pins {
            export(&root, pin)?;
            write_pin_file(&root, pin, "direction", "out")?;
        }

        let mut driver = Self { root, bridges };
        driver.apply(&ALL_STOPPED)?;
        log::info!(
            "GPIO driver ready at {} with pins {:?}",
            driver.root.display(),
            pins
        );
        Ok(driver)
    }

    fn write_level(&self, pin: u32, level: u8) -> Result<(), DriverError> {
        write_pin_file(&self.root, pin, "value", if level == 0 { "0" } else { "1" })
    }
}

impl MotorDriver for SysfsGpioDriver {
    /// Writes every pin even after a failure and reports the first error.
    fn apply(&mut self, outputs: &MotorOutputs) -> Result<(), DriverError> {
        let mut first_error = None;
        for (bridge, &direction) in self.bridges.iter().zip(outputs) {
            let (in1, in2) = Bridge::levels(direction);
            for (pin, level) in [(bridge.in1, in1), (bridge.in2, in2)] {
                if let Err(e) = self.write_level(pin, level) {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for SysfsGpioDriver {
    fn drop(&mut self) {
        if let Err(e) = self.apply(&ALL_STOPPED) {
            log::error!("Failed to stop motors on shutdown: {e}");
        }
    }
}

fn pin_dir(root: &Path, pin: u32) -> PathBuf {
    root.join(format!("gpio{pin}"))
}

fn export(root: &Path, pin: u32) -> Result<(), DriverError> {
    let dir = pin_dir(root, pin);
    if dir.is_dir() {
        return Ok(());
    }
    fs::write(root.join("export"), pin.to_string())
        .map_err(|source| DriverError::Write { pin, source })?;
    if !dir.is_dir() {
        return Err(DriverError::PinUnavailable { pin, path: dir });
    }
    Ok(())
}

fn write_pin_file(root: &Path, pin: u32, file: &str, value: &str) -> Result<(), DriverError> {
    fs::write(pin_dir(root, pin).join(file), value)
        .map_err(|source| DriverError::Write { pin, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::motor::Polarity;
    use crate::domain::state_machine::{VehicleState, VehicleStateMachine};
    use facewatch_core::control::domain::command::Command;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn fake_sysfs(pins: &[u32]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for pin in pins {
            fs::create_dir(dir.path().join(format!("gpio{pin}"))).unwrap();
        }
        dir
    }

    fn read(root: &Path, pin: u32, file: &str) -> String {
        fs::read_to_string(pin_dir(root, pin).join(file)).unwrap()
    }

    #[test]
    fn test_open_configures_outputs_low() {
        let sysfs = fake_sysfs(&DEFAULT_PINS);
        let _driver = SysfsGpioDriver::open(sysfs.path(), &DEFAULT_PINS).unwrap();
        for pin in DEFAULT_PINS {
            assert_eq!(read(sysfs.path(), pin, "direction"), "out");
            assert_eq!(read(sysfs.path(), pin, "value"), "0");
        }
    }

    #[test]
    fn test_apply_writes_bridge_levels() {
        let sysfs = fake_sysfs(&DEFAULT_PINS);
        let mut driver = SysfsGpioDriver::open(sysfs.path(), &DEFAULT_PINS).unwrap();
        driver
            .apply(&[
                Direction::Forward,
                Direction::Backward,
                Direction::Stopped,
                Direction::Forward,
            ])
            .unwrap();

        let levels: Vec<String> = DEFAULT_PINS
            .iter()
            .map(|&pin| read(sysfs.path(), pin, "value"))
            .collect();
        assert_eq!(levels, ["1", "0", "0", "1", "0", "0", "1", "0"]);
    }

    #[test]
    fn test_drop_sets_all_low() {
        let sysfs = fake_sysfs(&DEFAULT_PINS);
        {
            let mut driver = SysfsGpioDriver::open(sysfs.path(), &DEFAULT_PINS).unwrap();
            driver.apply(&[Direction::Forward; 4]).unwrap();
        }
        for pin in DEFAULT_PINS {
            assert_eq!(read(sysfs.path(), pin, "value"), "0");
        }
    }

    #[test]
    fn test_pin_failure_mid_command_leaves_vehicle_stopped() {
        let sysfs = fake_sysfs(&DEFAULT_PINS);
        let driver = SysfsGpioDriver::open(sysfs.path(), &DEFAULT_PINS).unwrap();
        let mut machine = VehicleStateMachine::new(
            Box::new(driver),
            Polarity::default(),
            Duration::from_secs(3),
        )
        .unwrap();
        machine.apply(Command::Forward, Instant::now()).unwrap();

        // FL IN1 becomes unwritable
        let broken = pin_dir(sysfs.path(), 27).join("value");
        fs::remove_file(&broken).unwrap();
        fs::create_dir(&broken).unwrap();

        let result = machine.apply(Command::Backward, Instant::now());
        assert!(matches!(result, Err(DriverError::Write { pin: 27, .. })));
        assert_eq!(machine.state(), VehicleState::Stopped);
        assert_eq!(machine.outputs(), ALL_STOPPED);
        for pin in DEFAULT_PINS.iter().filter(|&&p| p != 27) {
            assert_eq!(read(sysfs.path(), *pin, "value"), "0", "GPIO {pin}");
        }
    }

    #[test]
    fn test_wrong_pin_count() {
        let sysfs = fake_sysfs(&[]);
        let result = SysfsGpioDriver::open(sysfs.path(), &[1, 2, 3]);
        assert!(matches!(result, Err(DriverError::PinCount(3))));
    }

    #[test]
    fn test_pin_that_fails_to_export() {
        let sysfs = fake_sysfs(&DEFAULT_PINS[..7]);
        let result = SysfsGpioDriver::open(sysfs.path(), &DEFAULT_PINS);
        assert!(matches!(
            result,
            Err(DriverError::PinUnavailable { pin: 33, .. })
        ));
    }
}
