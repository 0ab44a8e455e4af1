use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Discrete vehicle motion command.
///
/// The discriminant is the wire value: the control channel carries one ASCII
/// decimal token per command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Command {
    Stop = 0,
    Forward = 1,
    Backward = 2,
    StrafeLeft = 3,
    StrafeRight = 4,
    DiagForwardLeft = 5,
    DiagForwardRight = 6,
    DiagBackwardLeft = 7,
    DiagBackwardRight = 8,
    RotateLeft = 9,
    RotateRight = 10,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("empty command token")]
    Empty,
    #[error("command token is not an integer: {0:?}")]
    NotANumber(String),
    #[error("command value out of range 0..=10: {0}")]
    OutOfRange(i64),
}

impl Command {
    pub const ALL: [Command; 11] = [
        Command::Stop,
        Command::Forward,
        Command::Backward,
        Command::StrafeLeft,
        Command::StrafeRight,
        Command::DiagForwardLeft,
        Command::DiagForwardRight,
        Command::DiagBackwardLeft,
        Command::DiagBackwardRight,
        Command::RotateLeft,
        Command::RotateRight,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Command> {
        Self::ALL.get(code as usize).copied()
    }

    /// Wire form: decimal value terminated by a newline.
    pub fn to_wire(self) -> String {
        format!("{}\n", self.code())
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Stop => "stop",
            Command::Forward => "forward",
            Command::Backward => "backward",
            Command::StrafeLeft => "strafe_left",
            Command::StrafeRight => "strafe_right",
            Command::DiagForwardLeft => "diag_forward_left",
            Command::DiagForwardRight => "diag_forward_right",
            Command::DiagBackwardLeft => "diag_backward_left",
            Command::DiagBackwardRight => "diag_backward_right",
            Command::RotateLeft => "rotate_left",
            Command::RotateRight => "rotate_right",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// Parses a single wire token. Surrounding whitespace is ignored.
impl FromStr for Command {
    type Err = CommandParseError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let token = token.trim();
        if token.is_empty() {
            return Err(CommandParseError::Empty);
        }
        let value: i64 = token
            .parse()
            .map_err(|_| CommandParseError::NotANumber(token.to_string()))?;
        u8::try_from(value)
            .ok()
            .and_then(Command::from_code)
            .ok_or(CommandParseError::OutOfRange(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_codes_match_position() {
        for (i, cmd) in Command::ALL.iter().enumerate() {
            assert_eq!(cmd.code() as usize, i);
            assert_eq!(Command::from_code(i as u8), Some(*cmd));
        }
    }

    #[test]
    fn test_from_code_out_of_range() {
        assert_eq!(Command::from_code(11), None);
    }

    #[rstest]
    #[case::stop("0", Command::Stop)]
    #[case::forward("1", Command::Forward)]
    #[case::rotate_right("10", Command::RotateRight)]
    #[case::with_newline("4\n", Command::StrafeRight)]
    #[case::with_crlf("9\r\n", Command::RotateLeft)]
    #[case::padded("  2 ", Command::Backward)]
    fn test_parse_valid(#[case] token: &str, #[case] expected: Command) {
        assert_eq!(token.parse::<Command>(), Ok(expected));
    }

    #[rstest]
    #[case::empty("", CommandParseError::Empty)]
    #[case::blank("  \n", CommandParseError::Empty)]
    #[case::word("forward", CommandParseError::NotANumber("forward".into()))]
    #[case::too_big("11", CommandParseError::OutOfRange(11))]
    #[case::negative("-1", CommandParseError::OutOfRange(-1))]
    fn test_parse_invalid(#[case] token: &str, #[case] expected: CommandParseError) {
        assert_eq!(token.parse::<Command>(), Err(expected));
    }

    #[test]
    fn test_wire_form() {
        assert_eq!(Command::Stop.to_wire(), "0\n");
        assert_eq!(Command::RotateRight.to_wire(), "10\n");
    }

    #[test]
    fn test_serde_uses_snake_case_names() {
        let json = serde_json::to_string(&Command::DiagForwardLeft).unwrap();
        assert_eq!(json, "\"diag_forward_left\"");
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Command::DiagForwardLeft);
    }
}
