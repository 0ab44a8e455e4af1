use std::fmt;
use std::str::FromStr;

use facewatch_core::control::domain::command::Command;
use thiserror::Error;

/// Wheel motors, in wiring order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Motor {
    FrontRight = 0,
    BackRight = 1,
    FrontLeft = 2,
    BackLeft = 3,
}

impl Motor {
    pub const ALL: [Motor; 4] = [
        Motor::FrontRight,
        Motor::BackRight,
        Motor::FrontLeft,
        Motor::BackLeft,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Motor::FrontRight => "front_right",
            Motor::BackRight => "back_right",
            Motor::FrontLeft => "front_left",
            Motor::BackLeft => "back_left",
        }
    }
}

/// Rotation of a single motor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    Backward,
    #[default]
    Stopped,
}

impl Direction {
    fn from_sign(sign: i8) -> Self {
        match sign.signum() {
            1 => Direction::Forward,
            -1 => Direction::Backward,
            _ => Direction::Stopped,
        }
    }

    pub fn sign(self) -> i8 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
            Direction::Stopped => 0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Forward => "F",
            Direction::Backward => "B",
            Direction::Stopped => "0",
        })
    }
}

/// Physical outputs for all four motors, indexed by [`Motor::index`].
pub type MotorOutputs = [Direction; 4];

pub const ALL_STOPPED: MotorOutputs = [Direction::Stopped; 4];

const F: i8 = 1;
const B: i8 = -1;

/// Logical wheel directions per command, before polarity correction.
/// Rows are indexed by command code; columns are FR, BR, FL, BL.
const DIRECTION_TABLE: [[i8; 4]; 11] = [
    [0, 0, 0, 0], // stop
    [F, F, F, F], // forward
    [B, B, B, B], // backward
    [F, B, B, F], // strafe left
    [B, F, F, B], // strafe right
    [F, 0, 0, F], // diagonal forward left
    [0, F, F, 0], // diagonal forward right
    [0, B, B, 0], // diagonal backward left
    [B, 0, 0, B], // diagonal backward right
    [F, F, B, B], // rotate left
    [B, B, F, F], // rotate right
];

/// Logical direction each motor should turn for `command`.
pub fn logical_directions(command: Command) -> MotorOutputs {
    DIRECTION_TABLE[command.code() as usize].map(Direction::from_sign)
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PolarityError {
    #[error("expected 4 comma-separated values, got {0}")]
    WrongCount(usize),
    #[error("polarity must be 1 or -1, got {0:?}")]
    InvalidValue(String),
}

/// Per-motor wiring correction: `-1` for a motor wired in reverse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Polarity([i8; 4]);

impl Polarity {
    pub fn new(signs: [i8; 4]) -> Result<Self, PolarityError> {
        match signs.iter().find(|s| !matches!(s, 1 | -1)) {
            Some(bad) => Err(PolarityError::InvalidValue(bad.to_string())),
            None => Ok(Self(signs)),
        }
    }

    pub fn sign(&self, motor: Motor) -> i8 {
        self.0[motor.index()]
    }
}

/// The front-right motor of the reference chassis is wired in reverse.
impl Default for Polarity {
    fn default() -> Self {
        Self([-1, 1, 1, 1])
    }
}

impl FromStr for Polarity {
    type Err = PolarityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(PolarityError::WrongCount(parts.len()));
        }
        let mut signs = [0i8; 4];
        for (slot, part) in signs.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| PolarityError::InvalidValue(part.to_string()))?;
        }
        Self::new(signs)
    }
}

/// Requested direction, wiring correction and enable flag of one motor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MotorState {
    pub requested: Direction,
    pub polarity: i8,
    pub enabled: bool,
}

impl MotorState {
    /// Physical direction to drive: corrected, or stopped when disabled.
    pub fn output(&self) -> Direction {
        if !self.enabled {
            return Direction::Stopped;
        }
        Direction::from_sign(self.requested.sign() * self.polarity)
    }
}

/// Physical outputs for `command`: table lookup, polarity correction, then
/// disabled motors forced to stop.
pub fn motor_outputs(command: Command, polarity: &Polarity, enabled: [bool; 4]) -> MotorOutputs {
    let logical = logical_directions(command);
    Motor::ALL.map(|motor| {
        MotorState {
            requested: logical[motor.index()],
            polarity: polarity.sign(motor),
            enabled: enabled[motor.index()],
        }
        .output()
    })
}
