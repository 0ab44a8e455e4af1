use std::path::PathBuf;

use thiserror::Error;

use crate::domain::motor::MotorOutputs;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("expected 8 GPIO pins (IN1/IN2 per motor), got {0}")]
    PinCount(usize),
    #[error("GPIO {pin} is not available at {path}")]
    PinUnavailable { pin: u32, path: PathBuf },
    #[error("failed to write GPIO {pin}: {source}")]
    Write {
        pin: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Hardware port for the four wheel motors.
///
/// `apply` receives every motor's output at once. On error some pins may
/// already hold the new values; callers drive everything low in response.
pub trait MotorDriver: Send {
    fn apply(&mut self, outputs: &MotorOutputs) -> Result<(), DriverError>;
}
