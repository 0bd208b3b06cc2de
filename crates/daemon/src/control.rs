//! The remote-control socket: a local UNIX stream socket speaking a
//! line-oriented protocol, plus the matching command-line client.
//!
//! On connect the server greets with a banner starting with `DHCPKit `.
//! Commands are UTF-8 lines; every response ends with a line that is
//! either `OK` or `OK:<data>`, and unrecognised commands answer
//! `UNKNOWN`. `quit` ends the session.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::VERSION;

/// Commands the server understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// List the available commands.
    Help,
    /// Report the processed-message counter.
    Stats,
    /// Reload the configuration and handler.
    Reload,
    /// Shut the server down.
    Shutdown,
    /// Close this control connection.
    Quit,
    /// Anything else.
    Unknown(String),
}

impl ControlCommand {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        Some(match line {
            "help" => ControlCommand::Help,
            "stats" => ControlCommand::Stats,
            "reload" => ControlCommand::Reload,
            "shutdown" => ControlCommand::Shutdown,
            "quit" => ControlCommand::Quit,
            other => ControlCommand::Unknown(other.to_owned()),
        })
    }
}

/// Side effects a control connection asks the supervisor to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Reload configuration and handler.
    Reload,
    /// Begin a graceful shutdown.
    Shutdown,
}

/// The listening end of the control socket. Removes a stale socket file
/// on bind and its own file on drop.
#[derive(Debug)]
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Binds the control socket at `path`.
    pub fn bind(path: &Path) -> io::Result<Self> {
        // A socket file left behind by an unclean shutdown would make the
        // bind fail. Anything else at that path is not ours to delete.
        if let Ok(metadata) = fs::symlink_metadata(path) {
            use std::os::unix::fs::FileTypeExt;
            if metadata.file_type().is_socket() {
                fs::remove_file(path)?;
            }
        }

        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        info!("Listening for control connections on {}", path.display());

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// The listening socket, for readiness registration.
    #[must_use]
    pub fn listener(&self) -> &UnixListener {
        &self.listener
    }

    /// Accepts one pending control connection, greeting it with the
    /// banner. Returns `None` when nothing was pending or setup failed.
    pub fn accept_connection(&self) -> Option<ControlConnection> {
        let (stream, _) = self.listener.accept().ok()?;
        match ControlConnection::new(stream) {
            Ok(connection) => {
                debug!("Accepted control connection");
                Some(connection)
            }
            Err(error) => {
                warn!("Could not set up control connection: {error}");
                None
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// One accepted control session.
#[derive(Debug)]
pub struct ControlConnection {
    stream: UnixStream,
    buffer: Vec<u8>,
    closed: bool,
}

impl ControlConnection {
    fn new(stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let mut connection = Self {
            stream,
            buffer: Vec::new(),
            closed: false,
        };
        connection.send_line(&format!("DHCPKit DHCPv6 server {VERSION} ready"))?;
        Ok(connection)
    }

    /// The underlying stream, for readiness registration.
    #[must_use]
    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Whether the session has ended; finished connections are removed
    /// from the multiplexer.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.stream.write_all(line.as_bytes())?;
        self.stream.write_all(b"\n")?;
        Ok(())
    }

    /// Reads whatever arrived, executes complete command lines and
    /// returns the actions the supervisor has to perform. The counter is
    /// reported by `stats`.
    pub fn handle_ready(&mut self, messages_processed: u64) -> Vec<ControlAction> {
        let mut chunk = [0u8; 1024];
        match self.stream.read(&mut chunk) {
            Ok(0) => {
                self.closed = true;
                return Vec::new();
            }
            Ok(received) => self.buffer.extend_from_slice(&chunk[..received]),
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(_) => {
                self.closed = true;
                return Vec::new();
            }
        }

        let mut actions = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&byte| byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let Ok(line) = std::str::from_utf8(&line[..line.len() - 1]) else {
                let _ = self.send_line("UNKNOWN");
                continue;
            };

            let Some(command) = ControlCommand::parse(line) else {
                continue;
            };
            if let Some(action) = self.execute(&command, messages_processed) {
                actions.push(action);
            }
            if self.closed {
                break;
            }
        }
        actions
    }

    fn execute(
        &mut self,
        command: &ControlCommand,
        messages_processed: u64,
    ) -> Option<ControlAction> {
        match command {
            ControlCommand::Help => {
                let _ = self.send_line("Recognised commands:");
                for name in ["help", "stats", "reload", "shutdown", "quit"] {
                    let _ = self.send_line(&format!("  {name}"));
                }
                let _ = self.send_line("OK");
                None
            }
            ControlCommand::Stats => {
                let _ = self.send_line(&format!("OK:{messages_processed}"));
                None
            }
            ControlCommand::Reload => {
                let _ = self.send_line("OK");
                Some(ControlAction::Reload)
            }
            ControlCommand::Shutdown => {
                let _ = self.send_line("OK");
                Some(ControlAction::Shutdown)
            }
            ControlCommand::Quit => {
                let _ = self.send_line("OK");
                let _ = self.stream.shutdown(std::net::Shutdown::Both);
                self.closed = true;
                None
            }
            ControlCommand::Unknown(command) => {
                debug!("Unknown control command: {command}");
                let _ = self.send_line("UNKNOWN");
                None
            }
        }
    }
}

/// The control client used by `ipv6-dhcpctl`.
pub mod client {
    use std::ffi::OsString;
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixStream;
    use std::path::Path;
    use std::time::Duration;

    use clap::{Arg, ArgAction, Command};
    use thiserror::Error;

    /// Errors talking to the server.
    #[derive(Debug, Error)]
    pub enum ControlClientError {
        /// The socket did not greet like a DHCPKit server.
        #[error("socket doesn't seem to be for DHCPKit")]
        WrongServer,

        /// The server did not understand the command.
        #[error("server doesn't understand '{0}'")]
        UnknownCommand(String),

        /// The connection failed.
        #[error("communication error: {0}")]
        Communication(#[from] std::io::Error),
    }

    /// Sends one command and collects the response lines (without the
    /// terminating `OK`).
    pub fn execute_command(
        socket_path: &Path,
        command: &str,
    ) -> Result<Vec<String>, ControlClientError> {
        let stream = UnixStream::connect(socket_path)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;

        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = stream;

        let mut banner = String::new();
        reader.read_line(&mut banner)?;
        if !banner.starts_with("DHCPKit ") {
            return Err(ControlClientError::WrongServer);
        }

        writer.write_all(command.as_bytes())?;
        writer.write_all(b"\n")?;

        let mut output = Vec::new();
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            let line = line.trim_end_matches('\n');

            if line == "UNKNOWN" {
                return Err(ControlClientError::UnknownCommand(command.to_owned()));
            } else if line == "OK" {
                break;
            } else if let Some(data) = line.strip_prefix("OK:") {
                output.push(data.to_owned());
                break;
            }
            output.push(line.to_owned());
        }

        // Tell the server we are done; failures here are uninteresting.
        let _ = writer.write_all(b"quit\n");

        Ok(output)
    }

    fn build_command() -> Command {
        Command::new("ipv6-dhcpctl")
            .about("Remote control utility for the IPv6 DHCP server")
            .arg(
                Arg::new("command")
                    .required(true)
                    .help("The command to send to the server"),
            )
            .arg(
                Arg::new("control-socket")
                    .short('c')
                    .long("control-socket")
                    .value_name("FILENAME")
                    .default_value("/var/run/ipv6-dhcpd.sock")
                    .help("location of domain socket for server control"),
            )
            .arg(
                Arg::new("verbosity")
                    .short('v')
                    .long("verbosity")
                    .action(ArgAction::Count)
                    .help("increase output verbosity"),
            )
    }

    /// The `ipv6-dhcpctl` entry point.
    pub fn run<I>(args: I) -> i32
    where
        I: IntoIterator<Item = OsString>,
    {
        let matches = match build_command().try_get_matches_from(args) {
            Ok(matches) => matches,
            Err(error) => {
                let _ = error.print();
                return error.exit_code();
            }
        };

        let command: &String = matches
            .get_one("command")
            .expect("the command argument is required");
        let socket_path: &String = matches
            .get_one("control-socket")
            .expect("the control-socket argument has a default");

        match execute_command(Path::new(socket_path), command) {
            Ok(lines) => {
                for line in lines {
                    println!("{line}");
                }
                0
            }
            Err(error) => {
                eprintln!("Error: {error}");
                1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ControlAction, ControlServer, client};
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};

    struct TestServer {
        server: ControlServer,
        dir: tempfile::TempDir,
    }

    fn bind_server() -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let server = ControlServer::bind(&dir.path().join("control.sock")).unwrap();
        TestServer { server, dir }
    }

    fn connect(test: &TestServer) -> UnixStream {
        let stream = UnixStream::connect(test.dir.path().join("control.sock")).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Pumps the connection in a background thread so a test can block on
    /// reading responses. The thread ends when the connection closes or
    /// after a few seconds.
    fn pump_in_background(mut connection: super::ControlConnection, messages: u64) {
        std::thread::spawn(move || {
            for _ in 0..5000 {
                let _ = connection.handle_ready(messages);
                if connection.is_closed() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        });
    }

    fn accept(test: &mut TestServer) -> super::ControlConnection {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(connection) = test.server.accept_connection() {
                return connection;
            }
            assert!(Instant::now() < deadline, "no connection accepted");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn greets_with_the_banner() {
        let mut test = bind_server();
        let stream = connect(&test);
        let _connection = accept(&mut test);

        let mut reader = BufReader::new(stream);
        let mut banner = String::new();
        reader.read_line(&mut banner).unwrap();
        assert!(banner.starts_with("DHCPKit "));
    }

    #[test]
    fn stats_reports_the_counter() {
        let mut test = bind_server();
        let mut stream = connect(&test);
        let connection = accept(&mut test);
        pump_in_background(connection, 1234);

        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut banner = String::new();
        reader.read_line(&mut banner).unwrap();

        stream.write_all(b"stats\n").unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line.trim_end(), "OK:1234");
    }

    #[test]
    fn unknown_commands_answer_unknown() {
        let mut test = bind_server();
        let mut stream = connect(&test);
        let connection = accept(&mut test);
        pump_in_background(connection, 0);

        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut banner = String::new();
        reader.read_line(&mut banner).unwrap();

        stream.write_all(b"make-coffee\n").unwrap();

        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line.trim_end(), "UNKNOWN");
    }

    #[test]
    fn reload_and_shutdown_become_actions() {
        let mut test = bind_server();
        let mut stream = connect(&test);
        let mut connection = accept(&mut test);

        stream.write_all(b"reload\nshutdown\n").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut actions = Vec::new();
        while actions.len() < 2 && Instant::now() < deadline {
            actions.extend(connection.handle_ready(0));
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(
            actions,
            vec![ControlAction::Reload, ControlAction::Shutdown]
        );
    }

    #[test]
    fn the_client_round_trips_a_command() {
        let mut test = bind_server();
        let socket_path = test.dir.path().join("control.sock");

        let client_thread = std::thread::spawn(move || {
            client::execute_command(&socket_path, "stats")
        });

        let mut connection = accept(&mut test);
        // Serve until the client has seen its response and quit.
        let deadline = Instant::now() + Duration::from_secs(5);
        while !connection.is_closed() && Instant::now() < deadline {
            let _ = connection.handle_ready(42);
            std::thread::sleep(Duration::from_millis(1));
        }

        let output = client_thread.join().unwrap().unwrap();
        assert_eq!(output, vec!["42".to_owned()]);
    }

    #[test]
    fn the_socket_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let server = ControlServer::bind(&path).unwrap();
        assert!(path.exists());
        drop(server);
        assert!(!path.exists());
    }
}
