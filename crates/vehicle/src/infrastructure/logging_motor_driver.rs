use crate::domain::motor::{Motor, MotorOutputs, ALL_STOPPED};
use crate::domain::motor_driver::{DriverError, MotorDriver};

/// Motor driver for machines without GPIO: logs each change of outputs.
pub struct LoggingMotorDriver {
    last: Option<MotorOutputs>,
    writes: u64,
}

impl LoggingMotorDriver {
    pub fn new() -> Self {
        Self {
            last: None,
            writes: 0,
        }
    }

    /// Number of driver calls that changed the outputs.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn last(&self) -> MotorOutputs {
        self.last.unwrap_or(ALL_STOPPED)
    }
}

impl Default for LoggingMotorDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MotorDriver for LoggingMotorDriver {
    fn apply(&mut self, outputs: &MotorOutputs) -> Result<(), DriverError> {
        if self.last.as_ref() == Some(outputs) {
            return Ok(());
        }
        let line = Motor::ALL
            .iter()
            .map(|m| format!("{}={}", m.name(), outputs[m.index()]))
            .collect::<Vec<_>>()
            .join(" ");
        log::info!("motors: {line}");
        self.last = Some(*outputs);
        self.writes += 1;
        Ok(())
    }
}
