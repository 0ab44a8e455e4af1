use thiserror::Error;

use crate::control::domain::command::Command;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("cannot resolve vehicle address {0}")]
    Resolve(String),
    #[error("failed to connect to vehicle at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("vehicle link is not connected")]
    NotConnected,
    #[error("failed to send {command} to vehicle: {source}")]
    Send {
        command: Command,
        #[source]
        source: std::io::Error,
    },
}

/// Link that carries commands to the vehicle.
///
/// Sends are fire-and-forget: the vehicle sends no acknowledgement.
pub trait CommandChannel: Send {
    fn send(&mut self, command: Command) -> Result<(), ControlError>;

    /// Drops the current link, if any, and establishes a new one.
    fn reconnect(&mut self) -> Result<(), ControlError>;
}
