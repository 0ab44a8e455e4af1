use std::fmt;
use std::time::{Duration, Instant};

use facewatch_core::control::domain::command::Command;

use crate::domain::motor::{motor_outputs, Motor, MotorOutputs, Polarity, ALL_STOPPED};
use crate::domain::motor_driver::{DriverError, MotorDriver};

/// Motion state of the vehicle. Exactly one per command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VehicleState {
    Stopped,
    MovingForward,
    MovingBackward,
    StrafeLeft,
    StrafeRight,
    DiagForwardLeft,
    DiagForwardRight,
    DiagBackwardLeft,
    DiagBackwardRight,
    RotatingLeft,
    RotatingRight,
}

impl From<Command> for VehicleState {
    fn from(command: Command) -> Self {
        match command {
            Command::Stop => VehicleState::Stopped,
            Command::Forward => VehicleState::MovingForward,
            Command::Backward => VehicleState::MovingBackward,
            Command::StrafeLeft => VehicleState::StrafeLeft,
            Command::StrafeRight => VehicleState::StrafeRight,
            Command::DiagForwardLeft => VehicleState::DiagForwardLeft,
            Command::DiagForwardRight => VehicleState::DiagForwardRight,
            Command::DiagBackwardLeft => VehicleState::DiagBackwardLeft,
            Command::DiagBackwardRight => VehicleState::DiagBackwardRight,
            Command::RotateLeft => VehicleState::RotatingLeft,
            Command::RotateRight => VehicleState::RotatingRight,
        }
    }
}

impl fmt::Display for VehicleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Drives the motors from received commands.
///
/// Every transition recomputes all four outputs from the direction table
/// and writes them in one driver call. If that write fails, every motor is
/// driven low and the machine falls back to `Stopped`. With no command for
/// longer than `command_timeout` the next [`tick`](Self::tick) stops the
/// vehicle.
pub struct VehicleStateMachine {
    driver: Box<dyn MotorDriver>,
    polarity: Polarity,
    enabled: [bool; 4],
    command_timeout: Duration,
    state: VehicleState,
    command: Command,
    outputs: MotorOutputs,
    last_command_at: Option<Instant>,
}

impl VehicleStateMachine {
    /// Creates the machine and drives every motor to a stop.
    pub fn new(
        driver: Box<dyn MotorDriver>,
        polarity: Polarity,
        command_timeout: Duration,
    ) -> Result<Self, DriverError> {
        let mut machine = Self {
            driver,
            polarity,
            enabled: [true; 4],
            command_timeout,
            state: VehicleState::Stopped,
            command: Command::Stop,
            outputs: ALL_STOPPED,
            last_command_at: None,
        };
        machine.driver.apply(&ALL_STOPPED)?;
        Ok(machine)
    }

    pub fn state(&self) -> VehicleState {
        self.state
    }

    pub fn outputs(&self) -> MotorOutputs {
        self.outputs
    }

    pub fn is_enabled(&self, motor: Motor) -> bool {
        self.enabled[motor.index()]
    }

    /// Handles a command received at `now`.
    pub fn apply(&mut self, command: Command, now: Instant) -> Result<(), DriverError> {
        self.last_command_at = Some(now);
        self.transition(command)
    }

    /// Stops the vehicle without counting as a received command.
    pub fn stop(&mut self) -> Result<(), DriverError> {
        self.transition(Command::Stop)
    }

    /// Enforces the command timeout. Returns `true` if it stopped the vehicle.
    pub fn tick(&mut self, now: Instant) -> Result<bool, DriverError> {
        if self.state == VehicleState::Stopped {
            return Ok(false);
        }
        let stale = self
            .last_command_at
            .map_or(true, |at| now.saturating_duration_since(at) > self.command_timeout);
        if !stale {
            return Ok(false);
        }
        log::warn!(
            "No command for over {:?}; stopping from {}",
            self.command_timeout,
            self.state
        );
        self.stop()?;
        Ok(true)
    }

    /// Enables or disables one motor and rewrites the current outputs.
    pub fn set_enabled(&mut self, motor: Motor, enabled: bool) -> Result<(), DriverError> {
        let previous = self.enabled[motor.index()];
        self.enabled[motor.index()] = enabled;
        if let Err(e) = self.transition(self.command) {
            self.enabled[motor.index()] = previous;
            return Err(e);
        }
        Ok(())
    }

    fn transition(&mut self, command: Command) -> Result<(), DriverError> {
        let outputs = motor_outputs(command, &self.polarity, self.enabled);
        if let Err(e) = self.driver.apply(&outputs) {
            self.fail_safe(&e);
            return Err(e);
        }
        let state = VehicleState::from(command);
        if state != self.state {
            log::info!("{} -> {state}", self.state);
        }
        self.state = state;
        self.command = command;
        self.outputs = outputs;
        Ok(())
    }

    /// A failed write may have left some motors on the new command and some
    /// on the old one, so every output is driven low and the machine stops.
    fn fail_safe(&mut self, cause: &DriverError) {
        log::error!("Motor write failed, stopping all motors: {cause}");
        if let Err(e) = self.driver.apply(&ALL_STOPPED) {
            log::error!("Failed to stop motors: {e}");
        }
        self.state = VehicleState::Stopped;
        self.command = Command::Stop;
        self.outputs = ALL_STOPPED;
    }
}
