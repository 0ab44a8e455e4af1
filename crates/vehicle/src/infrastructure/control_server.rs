use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use facewatch_core::control::domain::command::Command;
use thiserror::Error;

use crate::domain::motor_driver::DriverError;
use crate::domain::state_machine::VehicleStateMachine;

/// Longest token accepted before a newline.
const MAX_TOKEN_LEN: usize = 32;
/// Bytes read from the client in one poll, so the timeout check keeps running.
const READ_BUDGET: usize = 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Driver(#[from] DriverError),
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    pending: Vec<u8>,
}

impl Connection {
    /// Moves every complete token out of `pending`. A partial token that
    /// already exceeds `MAX_TOKEN_LEN` is discarded and reads as Stop.
    fn take_tokens(&mut self, commands: &mut Vec<Command>) {
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            commands.push(parse_token(&line[..end]));
        }
        if self.pending.len() > MAX_TOKEN_LEN {
            log::warn!(
                "Discarding {} bytes without a newline from {}",
                self.pending.len(),
                self.peer
            );
            self.pending.clear();
            commands.push(Command::Stop);
        }
    }
}

/// Single-connection command server for the vehicle.
///
/// Runs cooperatively on one thread: each [`poll_once`](Self::poll_once)
/// accepts, reads whatever bytes are available and applies complete tokens,
/// then enforces the command timeout. A newly accepted client replaces the
/// current one and the vehicle stops in between.
pub struct ControlServer {
    listener: TcpListener,
    connection: Option<Connection>,
    machine: VehicleStateMachine,
}

impl ControlServer {
    pub fn bind(
        address: impl ToSocketAddrs + ToString,
        machine: VehicleStateMachine,
    ) -> Result<Self, ServerError> {
        let bind_error = |source: io::Error| ServerError::Bind {
            address: address.to_string(),
            source,
        };
        let listener = TcpListener::bind(&address).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        Ok(Self {
            listener,
            connection: None,
            machine,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn machine(&self) -> &VehicleStateMachine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut VehicleStateMachine {
        &mut self.machine
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Serves until `stop` is set, then stops the vehicle.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), ServerError> {
        if let Ok(addr) = self.local_addr() {
            log::info!("Listening for commands on {addr}");
        }
        let served = loop {
            if stop.load(Ordering::Relaxed) {
                break Ok(());
            }
            if let Err(e) = self.poll_once(Instant::now()) {
                break Err(e);
            }
            thread::sleep(POLL_INTERVAL);
        };
        self.disconnect("server shutting down");
        self.machine.stop()?;
        served
    }

    /// One pass of the server loop at time `now`.
    pub fn poll_once(&mut self, now: Instant) -> Result<(), ServerError> {
        self.accept_pending()?;
        self.read_available(now)?;
        self.machine.tick(now)?;
        Ok(())
    }

    fn accept_pending(&mut self) -> Result<(), ServerError> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let configured = stream
                        .set_nonblocking(true)
                        .and_then(|_| stream.set_nodelay(true));
                    if let Err(e) = configured {
                        log::warn!("Rejected {peer}: {e}");
                        continue;
                    }
                    if self.connection.is_some() {
                        self.disconnect("superseded by a new client");
                        self.machine.stop()?;
                    }
                    log::info!("Client connected: {peer}");
                    self.connection = Some(Connection {
                        stream,
                        peer,
                        pending: Vec::new(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    return Ok(());
                }
            }
        }
    }

    fn read_available(&mut self, now: Instant) -> Result<(), ServerError> {
        let Some(connection) = self.connection.as_mut() else {
            return Ok(());
        };
        let mut buf = [0u8; 256];
        let mut budget = READ_BUDGET;
        let mut commands = Vec::new();
        let closed = loop {
            if budget == 0 {
                break None;
            }
            let limit = budget.min(buf.len());
            match connection.stream.read(&mut buf[..limit]) {
                Ok(0) => break Some("disconnected".to_string()),
                Ok(n) => {
                    budget -= n;
                    connection.pending.extend_from_slice(&buf[..n]);
                    connection.take_tokens(&mut commands);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break None,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Some(format!("read failed: {e}")),
            }
        };

        for command in commands {
            log::debug!("Received {command}");
            self.machine.apply(command, now)?;
        }
        if let Some(reason) = closed {
            self.disconnect(&reason);
            self.machine.stop()?;
        }
        Ok(())
    }

    fn disconnect(&mut self, reason: &str) {
        if let Some(connection) = self.connection.take() {
            log::info!("Client {} closed: {reason}", connection.peer);
        }
    }
}

/// Decodes one line; anything that is not a valid command becomes Stop.
fn parse_token(line: &[u8]) -> Command {
    let parsed = std::str::from_utf8(line)
        .map_err(|_| format!("non-UTF-8 token {line:?}"))
        .and_then(|token| token.parse::<Command>().map_err(|e| e.to_string()));
    match parsed {
        Ok(command) => command,
        Err(e) => {
            log::warn!("Invalid command, stopping: {e}");
            Command::Stop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::motor::Polarity;
    use crate::domain::state_machine::VehicleState;
    use crate::infrastructure::logging_motor_driver::LoggingMotorDriver;
    use rstest::rstest;
    use std::io::Write;

    fn server(timeout: Duration) -> ControlServer {
        let machine = VehicleStateMachine::new(
            Box::new(LoggingMotorDriver::new()),
            Polarity::default(),
            timeout,
        )
        .unwrap();
        ControlServer::bind("127.0.0.1:0", machine).unwrap()
    }

    fn connect(server: &ControlServer) -> TcpStream {
        TcpStream::connect(server.local_addr().unwrap()).unwrap()
    }

    /// Polls until `state` is reached or two seconds pass.
    fn poll_until(server: &mut ControlServer, state: VehicleState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            server.poll_once(Instant::now()).unwrap();
            if server.machine().state() == state {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn poll_until_connected(server: &mut ControlServer) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !server.is_connected() && Instant::now() < deadline {
            server.poll_once(Instant::now()).unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        assert!(server.is_connected());
    }

    #[rstest]
    #[case(b"1\n", VehicleState::MovingForward)]
    #[case(b"9\r\n", VehicleState::RotatingLeft)]
    #[case(b" 4 \n", VehicleState::StrafeRight)]
    fn test_token_sets_state(#[case] bytes: &[u8], #[case] expected: VehicleState) {
        let mut server = server(Duration::from_secs(3));
        let mut client = connect(&server);
        client.write_all(bytes).unwrap();
        assert!(poll_until(&mut server, expected));
    }

    #[test]
    fn test_token_split_across_writes() {
        let mut server = server(Duration::from_secs(3));
        let mut client = connect(&server);
        poll_until_connected(&mut server);
        client.write_all(b"1").unwrap();
        client.flush().unwrap();
        thread::sleep(Duration::from_millis(20));
        server.poll_once(Instant::now()).unwrap();
        client.write_all(b"0\n").unwrap();
        assert!(poll_until(&mut server, VehicleState::RotatingRight));
    }

    #[rstest]
    #[case::out_of_range(b"42\n")]
    #[case::word(b"go\n")]
    #[case::negative(b"-1\n")]
    #[case::no_newline(&[b'7'; 64])]
    fn test_invalid_token_stops(#[case] bytes: &[u8]) {
        let mut server = server(Duration::from_secs(3));
        let mut client = connect(&server);
        client.write_all(b"1\n").unwrap();
        assert!(poll_until(&mut server, VehicleState::MovingForward));

        client.write_all(bytes).unwrap();
        assert!(poll_until(&mut server, VehicleState::Stopped));
        assert!(server.is_connected());
    }

    #[test]
    fn test_flood_is_read_in_bounded_slices() {
        let mut server = server(Duration::from_secs(3));
        let mut client = connect(&server);
        poll_until_connected(&mut server);

        let mut flood = b"2\n".repeat(5000);
        flood.extend_from_slice(b"1\n");
        client.write_all(&flood).unwrap();
        thread::sleep(Duration::from_millis(50));

        server.poll_once(Instant::now()).unwrap();
        assert_eq!(server.machine().state(), VehicleState::MovingBackward);
        assert!(server.connection.as_ref().unwrap().pending.len() <= MAX_TOKEN_LEN);

        assert!(poll_until(&mut server, VehicleState::MovingForward));
    }

    #[test]
    fn test_endless_token_never_buffers_more_than_a_read() {
        let mut server = server(Duration::from_secs(3));
        let mut client = connect(&server);
        poll_until_connected(&mut server);

        client.write_all(&[b'7'; 8192]).unwrap();
        thread::sleep(Duration::from_millis(50));
        for _ in 0..4 {
            server.poll_once(Instant::now()).unwrap();
            assert!(server.connection.as_ref().unwrap().pending.len() <= MAX_TOKEN_LEN);
        }
        assert_eq!(server.machine().state(), VehicleState::Stopped);
    }

    #[test]
    fn test_disconnect_stops() {
        let mut server = server(Duration::from_secs(3));
        let mut client = connect(&server);
        client.write_all(b"2\n").unwrap();
        assert!(poll_until(&mut server, VehicleState::MovingBackward));

        drop(client);
        assert!(poll_until(&mut server, VehicleState::Stopped));
        assert!(!server.is_connected());
    }

    #[test]
    fn test_new_client_supersedes_old() {
        let mut server = server(Duration::from_secs(3));
        let mut first = connect(&server);
        first.write_all(b"1\n").unwrap();
        assert!(poll_until(&mut server, VehicleState::MovingForward));

        let mut second = connect(&server);
        assert!(poll_until(&mut server, VehicleState::Stopped));

        second.write_all(b"2\n").unwrap();
        assert!(poll_until(&mut server, VehicleState::MovingBackward));

        // The replaced client is no longer read
        let _ = first.write_all(b"1\n");
        for _ in 0..10 {
            server.poll_once(Instant::now()).unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(server.machine().state(), VehicleState::MovingBackward);
    }

    #[test]
    fn test_timeout_stops_while_connected() {
        let mut server = server(Duration::from_millis(100));
        let mut client = connect(&server);
        client.write_all(b"3\n").unwrap();
        assert!(poll_until(&mut server, VehicleState::StrafeLeft));

        server
            .poll_once(Instant::now() + Duration::from_secs(1))
            .unwrap();
        assert_eq!(server.machine().state(), VehicleState::Stopped);
    }

    #[test]
    fn test_run_returns_stopped_when_flag_set() {
        let mut server = server(Duration::from_secs(3));
        let stop = AtomicBool::new(true);
        server.run(&stop).unwrap();
        assert_eq!(server.machine().state(), VehicleState::Stopped);
    }

    #[test]
    fn test_bind_failure_reports_address() {
        let taken = server(Duration::from_secs(3));
        let address = taken.local_addr().unwrap().to_string();
        let machine = VehicleStateMachine::new(
            Box::new(LoggingMotorDriver::new()),
            Polarity::default(),
            Duration::from_secs(3),
        )
        .unwrap();
        let err = ControlServer::bind(address.as_str(), machine).err().unwrap();
        assert!(err.to_string().contains(&address));
    }
}
