use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::control::domain::command::Command;
use crate::control::domain::command_channel::{CommandChannel, ControlError};

/// Sends newline-terminated command tokens over a TCP connection.
///
/// Connects lazily on the first send. A failed write drops the connection so
/// the next attempt starts from a fresh socket.
pub struct TcpCommandChannel {
    address: String,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpCommandChannel {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
            stream: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn resolve(&self) -> Result<Vec<SocketAddr>, ControlError> {
        let addrs: Vec<SocketAddr> = self
            .address
            .to_socket_addrs()
            .map_err(|_| ControlError::Resolve(self.address.clone()))?
            .collect();
        if addrs.is_empty() {
            return Err(ControlError::Resolve(self.address.clone()));
        }
        Ok(addrs)
    }

    fn connect(&mut self) -> Result<(), ControlError> {
        let mut last_error = None;
        for addr in self.resolve()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    let configured = stream
                        .set_nodelay(true)
                        .and_then(|_| stream.set_write_timeout(Some(self.timeout)));
                    if let Err(e) = configured {
                        last_error = Some(e);
                        continue;
                    }
                    log::info!("Connected to vehicle at {addr}");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(ControlError::Connect {
            address: self.address.clone(),
            source: last_error
                .unwrap_or_else(|| std::io::Error::other("no address to connect to")),
        })
    }
}

impl CommandChannel for TcpCommandChannel {
    fn send(&mut self, command: Command) -> Result<(), ControlError> {
        if self.stream.is_none() {
            self.connect()?;
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(ControlError::NotConnected);
        };
        let written = stream
            .write_all(command.to_wire().as_bytes())
            .and_then(|_| stream.flush());
        if let Err(source) = written {
            self.stream = None;
            return Err(ControlError::Send { command, source });
        }
        log::debug!("Sent {command}");
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), ControlError> {
        self.stream = None;
        self.connect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        (listener, address)
    }

    fn read_lines(stream: TcpStream, count: usize) -> Vec<String> {
        BufReader::new(stream)
            .lines()
            .take(count)
            .map(|l| l.unwrap())
            .collect()
    }

    #[test]
    fn test_sends_newline_terminated_codes() {
        let (listener, address) = listener();
        let mut channel = TcpCommandChannel::new(address, Duration::from_millis(500));

        channel.send(Command::Forward).unwrap();
        channel.send(Command::RotateRight).unwrap();
        channel.send(Command::Stop).unwrap();

        let (stream, _) = listener.accept().unwrap();
        assert_eq!(read_lines(stream, 3), vec!["1", "10", "0"]);
    }

    #[test]
    fn test_connects_lazily() {
        let (_listener, address) = listener();
        let channel = TcpCommandChannel::new(address, Duration::from_millis(500));
        assert!(!channel.is_connected());
    }

    #[test]
    fn test_unreachable_vehicle_is_connect_error() {
        // Bind then drop to get a port nobody listens on
        let (listener, address) = listener();
        drop(listener);
        let mut channel = TcpCommandChannel::new(address, Duration::from_millis(200));
        assert!(matches!(
            channel.send(Command::Stop),
            Err(ControlError::Connect { .. })
        ));
        assert!(!channel.is_connected());
    }

    #[test]
    fn test_unresolvable_address_is_resolve_error() {
        let mut channel = TcpCommandChannel::new("not an address", Duration::from_millis(200));
        assert!(matches!(
            channel.send(Command::Stop),
            Err(ControlError::Resolve(_))
        ));
    }

    #[test]
    fn test_reconnect_opens_fresh_connection() {
        let (listener, address) = listener();
        let mut channel = TcpCommandChannel::new(address, Duration::from_millis(500));
        channel.send(Command::Forward).unwrap();
        let (first, _) = listener.accept().unwrap();

        channel.reconnect().unwrap();
        channel.send(Command::Backward).unwrap();
        let (second, _) = listener.accept().unwrap();

        assert_eq!(read_lines(first, 1), vec!["1"]);
        assert_eq!(read_lines(second, 1), vec!["2"]);
    }
}
