//! TCP listeners: an acceptor for the listening socket and a per-stream
//! listener for each accepted connection.
//!
//! DHCPv6 over TCP (as used for bulk leasequery) frames every message with
//! a big-endian 16-bit length prefix. Each connection keeps its own receive
//! buffer; replies are framed the same way and serialised through a
//! per-connection write lock so concurrent workers cannot interleave them.

use std::io::{self, Read, Write};
use std::net::{Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use protocol::{DhcpOption, RelayMessage, SERVER_PORT, is_global_unicast};
use tracing::{error, info, trace, warn};

use crate::bundle::{IncomingPacketBundle, MessageId};
use crate::config::Ipv6Prefix;
use crate::listeners::{RecvError, Replier, SetupError};

/// How long one reply send may take before the connection is considered
/// stuck.
const SEND_TIMEOUT: Duration = Duration::from_secs(300);

/// Wrapper for a listening TCP socket. Not a packet listener itself:
/// DHCPv6 messages arrive on the connections this acceptor produces.
#[derive(Debug)]
pub struct TcpConnectionListener {
    interface_name: String,
    listen_socket: Arc<TcpListener>,
    listen_address: Ipv6Addr,
    global_address: Ipv6Addr,
    marks: Vec<String>,
    max_connections: usize,
    allow_from: Vec<Ipv6Prefix>,
    /// Weak references to the accepted streams, so closed connections drop
    /// out of the count naturally.
    open_connections: Vec<Weak<TcpStream>>,
    expected_port: u16,
}

impl TcpConnectionListener {
    /// Wraps a bound and listening TCP socket after validating it: IPv6,
    /// port 547, an explicit global unicast bind address.
    pub fn new(
        interface_name: &str,
        listen_socket: Arc<TcpListener>,
        global_address: Option<Ipv6Addr>,
        marks: Vec<String>,
        max_connections: usize,
        allow_from: Vec<Ipv6Prefix>,
    ) -> Result<Self, SetupError> {
        Self::with_server_port(
            interface_name,
            listen_socket,
            global_address,
            marks,
            max_connections,
            allow_from,
            SERVER_PORT,
        )
    }

    pub(crate) fn with_server_port(
        interface_name: &str,
        listen_socket: Arc<TcpListener>,
        global_address: Option<Ipv6Addr>,
        marks: Vec<String>,
        max_connections: usize,
        allow_from: Vec<Ipv6Prefix>,
        expected_port: u16,
    ) -> Result<Self, SetupError> {
        listen_socket.set_nonblocking(true)?;

        let SocketAddr::V6(listen) = listen_socket.local_addr()? else {
            return Err(SetupError::NotTcp);
        };

        if listen.port() != expected_port {
            return Err(SetupError::WrongPort(expected_port));
        }

        if listen.ip().is_unspecified() {
            return Err(SetupError::WildcardAddress);
        }

        let global_address = match global_address {
            Some(address) => address,
            None if is_global_unicast(*listen.ip()) => *listen.ip(),
            None => return Err(SetupError::NoGlobalAddress(interface_name.to_owned())),
        };

        Ok(Self {
            interface_name: interface_name.to_owned(),
            listen_socket,
            listen_address: *listen.ip(),
            global_address,
            marks,
            max_connections,
            allow_from,
            open_connections: Vec::new(),
            expected_port,
        })
    }

    /// The address this acceptor is bound to.
    #[must_use]
    pub fn listen_address(&self) -> Ipv6Addr {
        self.listen_address
    }

    /// The listening socket, for readiness registration and recycling.
    #[must_use]
    pub fn listen_socket(&self) -> &Arc<TcpListener> {
        &self.listen_socket
    }

    /// The number of connections still alive.
    #[must_use]
    pub fn open_connection_count(&mut self) -> usize {
        self.open_connections
            .retain(|connection| connection.strong_count() > 0);
        self.open_connections.len()
    }

    /// Accepts one incoming connection, enforcing the connection cap and
    /// the allow-list. Returns `None` when nothing was accepted, either
    /// because the socket had nothing pending or because the connection was
    /// rejected and shut down.
    pub fn accept_connection(&mut self) -> Option<TcpConnection> {
        let (stream, client) = match self.listen_socket.accept() {
            Ok(accepted) => accepted,
            Err(_) => return None,
        };

        let SocketAddr::V6(client) = client else {
            return None;
        };

        if self.open_connection_count() >= self.max_connections {
            warn!(
                "More than {max_connections} open TCP connections, \
                 rejecting connection from {client_addr} port {port}",
                max_connections = self.max_connections,
                client_addr = client.ip(),
                port = client.port(),
            );
            let _ = stream.shutdown(Shutdown::Both);
            return None;
        }

        if !self.allow_from.is_empty()
            && !self
                .allow_from
                .iter()
                .any(|prefix| prefix.contains(*client.ip()))
        {
            error!(
                "Rejecting TCP connection from {client_addr} port {port}",
                client_addr = client.ip(),
                port = client.port(),
            );
            let _ = stream.shutdown(Shutdown::Both);
            return None;
        }

        info!(
            "Incoming TCP connection from {client_addr} port {port}",
            client_addr = client.ip(),
            port = client.port(),
        );

        match TcpConnection::with_server_port(
            &self.interface_name,
            stream,
            self.global_address,
            self.marks.clone(),
            self.expected_port,
        ) {
            Ok(connection) => {
                self.open_connections
                    .push(Arc::downgrade(connection.stream()));
                Some(connection)
            }
            Err(error) => {
                error!("Could not set up accepted TCP connection: {error}");
                None
            }
        }
    }
}

/// One accepted TCP connection, acting as a listener for the framed
/// DHCPv6 messages arriving on it.
#[derive(Debug)]
pub struct TcpConnection {
    interface_name: String,
    interface_id: Vec<u8>,
    stream: Arc<TcpStream>,
    write_lock: Arc<Mutex<()>>,
    global_address: Ipv6Addr,
    marks: Vec<String>,
    interface_index: u32,
    client_address: Ipv6Addr,
    client_port: u16,
    buffer: Vec<u8>,
}

impl TcpConnection {
    pub(crate) fn with_server_port(
        interface_name: &str,
        stream: TcpStream,
        global_address: Ipv6Addr,
        marks: Vec<String>,
        expected_port: u16,
    ) -> Result<Self, SetupError> {
        stream.set_nonblocking(true)?;

        let SocketAddr::V6(local) = stream.local_addr()? else {
            return Err(SetupError::NotTcp);
        };
        if local.port() != expected_port {
            return Err(SetupError::WrongPort(expected_port));
        }

        let SocketAddr::V6(peer) = stream.peer_addr()? else {
            return Err(SetupError::NotTcp);
        };

        Ok(Self {
            interface_name: interface_name.to_owned(),
            interface_id: interface_name.as_bytes().to_vec(),
            stream: Arc::new(stream),
            write_lock: Arc::new(Mutex::new(())),
            global_address,
            marks,
            interface_index: local.scope_id(),
            client_address: *peer.ip(),
            client_port: peer.port(),
            buffer: Vec::new(),
        })
    }

    /// The underlying stream, for readiness registration.
    #[must_use]
    pub fn stream(&self) -> &Arc<TcpStream> {
        &self.stream
    }

    /// The peer this connection talks to.
    #[must_use]
    pub fn client_address(&self) -> Ipv6Addr {
        self.client_address
    }

    /// Reads up to `wanted` bytes into the receive buffer. A closed peer
    /// surfaces as [`RecvError::Closed`]; a socket with nothing more to
    /// read simply adds nothing.
    fn fill_buffer(&mut self, wanted: usize) -> Result<(), RecvError> {
        let mut chunk = vec![0u8; wanted];
        match (&*self.stream).read(&mut chunk) {
            Ok(0) => {
                info!(
                    "TCP connection to {client_addr} port {port} closed",
                    client_addr = self.client_address,
                    port = self.client_port,
                );
                Err(RecvError::Closed)
            }
            Ok(received) => {
                self.buffer.extend_from_slice(&chunk[..received]);
                Ok(())
            }
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(())
            }
            Err(error) => Err(RecvError::Io(error)),
        }
    }

    /// Receives one length-prefixed message. Raises
    /// [`RecvError::Incomplete`] while the buffer does not yet hold a full
    /// frame; the buffered bytes are kept for the next readiness event.
    pub fn recv_request(&mut self) -> Result<(IncomingPacketBundle, Replier), RecvError> {
        if self.buffer.len() < 2 {
            self.fill_buffer(2 - self.buffer.len())?;
        }

        if self.buffer.len() >= 2 {
            let message_length = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;

            let missing = (message_length + 2).saturating_sub(self.buffer.len());
            if missing > 0 {
                self.fill_buffer(missing)?;
            }

            if self.buffer.len() >= message_length + 2 {
                return Ok(self.packet_from_buffer(message_length));
            }
        }

        Err(RecvError::Incomplete)
    }

    /// Extracts the first complete frame from the buffer and builds the
    /// bundle and replier for it.
    fn packet_from_buffer(&mut self, message_length: usize) -> (IncomingPacketBundle, Replier) {
        let data = self.buffer[2..2 + message_length].to_vec();
        self.buffer.drain(..2 + message_length);

        let message_id = MessageId::next();
        trace!(
            target: "packets",
            "{message_id}: Received message from {client_addr} port {port}",
            client_addr = self.client_address,
            port = self.client_port,
        );

        let bundle = IncomingPacketBundle {
            message_id,
            data,
            source_address: self.client_address,
            link_address: self.global_address,
            interface_index: self.interface_index,
            received_over_multicast: false,
            received_over_tcp: true,
            marks: self.marks.clone(),
            relay_options: vec![DhcpOption::InterfaceId(self.interface_id.clone())],
        };

        let replier = Replier::Tcp(TcpReplier {
            stream: Arc::clone(&self.stream),
            write_lock: Arc::clone(&self.write_lock),
            client_address: self.client_address,
            client_port: self.client_port,
        });

        (bundle, replier)
    }

    /// The interface this connection arrived on.
    #[must_use]
    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    #[cfg(test)]
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }
}

/// Sends framed replies back over the originating connection. Unlike UDP,
/// a TCP connection may carry several replies.
#[derive(Debug)]
pub struct TcpReplier {
    stream: Arc<TcpStream>,
    write_lock: Arc<Mutex<()>>,
    client_address: Ipv6Addr,
    client_port: u16,
}

impl TcpReplier {
    /// Serialises the relayed message, prepends the 16-bit length and
    /// writes the whole frame under the connection's write lock, bounded
    /// by the send timeout. A failed send leaves the connection open.
    pub fn send_reply(&self, outgoing: &RelayMessage) -> bool {
        let Some(relayed) = outgoing.relayed_message() else {
            error!("Outgoing message carries no relayed message, not sending a reply");
            return false;
        };

        let message_data = relayed.to_vec();
        let mut frame = Vec::with_capacity(2 + message_data.len());
        frame.extend_from_slice(&(message_data.len() as u16).to_be_bytes());
        frame.extend_from_slice(&message_data);

        let result = {
            let _guard = self
                .write_lock
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            send_all(&self.stream, &frame, SEND_TIMEOUT)
        };

        match result {
            Ok(()) => {
                trace!(
                    target: "packets",
                    "Sent {message_type:?} to {client_addr} port {port}",
                    message_type = relayed.msg_type(),
                    client_addr = self.client_address,
                    port = self.client_port,
                );
                true
            }
            Err(error) => {
                error!(
                    "Could not send {message_type:?} to {client_addr} port {port}: {error}",
                    message_type = relayed.msg_type(),
                    client_addr = self.client_address,
                    port = self.client_port,
                );
                false
            }
        }
    }
}

/// Writes the whole buffer to a non-blocking stream, waiting for
/// writability between short writes, giving up at the deadline.
fn send_all(stream: &TcpStream, mut data: &[u8], timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    while !data.is_empty() {
        match (&*stream).write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(written) => data = &data[written..],
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                wait_writable(stream, deadline)?;
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
    Ok(())
}

fn wait_writable(stream: &TcpStream, deadline: Instant) -> io::Result<()> {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(io::ErrorKind::TimedOut.into());
        }
        let wait_ms = (deadline - now).as_millis().min(60_000) as u16;

        let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLOUT)];
        match poll(&mut fds, PollTimeout::from(wait_ms)) {
            Ok(0) => {}
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => {}
            Err(errno) => return Err(io::Error::from(errno)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{TcpConnection, TcpConnectionListener};
    use crate::config::Ipv6Prefix;
    use crate::listeners::RecvError;
    use std::io::{Read, Write};
    use std::net::{Ipv6Addr, TcpListener, TcpStream};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    const GLOBAL: &str = "2001:db8::1";

    fn connected_pair() -> (TcpConnection, TcpStream) {
        let listener = TcpListener::bind("[::1]:0").unwrap();
        let local = listener.local_addr().unwrap();
        let client = TcpStream::connect(local).unwrap();
        let (server_stream, _) = listener.accept().unwrap();

        let connection = TcpConnection::with_server_port(
            "eth0",
            server_stream,
            GLOBAL.parse().unwrap(),
            vec![],
            local.port(),
        )
        .unwrap();
        (connection, client)
    }

    /// Calls `recv_request` until it produces a frame, allowing for the
    /// bytes still being in flight on loopback.
    fn recv_frame(connection: &mut TcpConnection) -> Vec<u8> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match connection.recv_request() {
                Ok((bundle, _replier)) => return bundle.data,
                Err(RecvError::Incomplete) => {
                    assert!(Instant::now() < deadline, "no frame arrived in time");
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(error) => panic!("unexpected receive error: {error}"),
            }
        }
    }

    #[test]
    fn framing_splits_consecutive_messages() {
        let (mut connection, _client) = connected_pair();

        connection.feed(b"\x00\x05HELLO\x00\x03BYE");
        let (first, _) = connection.recv_request().unwrap();
        assert_eq!(first.data, b"HELLO");
        let (second, _) = connection.recv_request().unwrap();
        assert_eq!(second.data, b"BYE");
        assert!(matches!(
            connection.recv_request(),
            Err(RecvError::Incomplete)
        ));
    }

    #[test]
    fn partial_frames_stay_buffered_until_complete() {
        let (mut connection, _client) = connected_pair();

        connection.feed(b"\x00\x05HEL");
        assert!(matches!(
            connection.recv_request(),
            Err(RecvError::Incomplete)
        ));

        connection.feed(b"LO");
        let (bundle, _) = connection.recv_request().unwrap();
        assert_eq!(bundle.data, b"HELLO");

        connection.feed(b"\x00\x03BYE");
        let (bundle, _) = connection.recv_request().unwrap();
        assert_eq!(bundle.data, b"BYE");
    }

    #[test]
    fn bundles_carry_the_connection_metadata() {
        let (mut connection, _client) = connected_pair();
        connection.feed(b"\x00\x01x");
        let (bundle, replier) = connection.recv_request().unwrap();
        assert!(bundle.received_over_tcp);
        assert!(!bundle.received_over_multicast);
        assert_eq!(bundle.source_address, Ipv6Addr::LOCALHOST);
        assert_eq!(bundle.link_address, GLOBAL.parse::<Ipv6Addr>().unwrap());
        assert_eq!(bundle.interface_id(), Some(&b"eth0"[..]));
        assert!(replier.can_send_multiple());
    }

    #[test]
    fn frames_arrive_over_a_real_socket() {
        let (mut connection, mut client) = connected_pair();

        client.write_all(b"\x00\x05HELLO").unwrap();
        assert_eq!(recv_frame(&mut connection), b"HELLO");

        client.write_all(b"\x00\x03BYE").unwrap();
        assert_eq!(recv_frame(&mut connection), b"BYE");
    }

    #[test]
    fn closed_peers_surface_as_closed() {
        let (mut connection, client) = connected_pair();
        drop(client);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match connection.recv_request() {
                Err(RecvError::Closed) => break,
                Err(RecvError::Incomplete) => {
                    assert!(Instant::now() < deadline, "close never observed");
                    std::thread::sleep(Duration::from_millis(1));
                }
                other => panic!("expected Closed, got {other:?}"),
            }
        }
    }

    #[test]
    fn tcp_replies_are_framed_on_the_wire() {
        let (mut connection, mut client) = connected_pair();
        connection.feed(b"\x00\x01x");
        let (_bundle, replier) = connection.recv_request().unwrap();

        let advertise = protocol::Message::Client(protocol::ClientMessage {
            msg_type: protocol::MessageType::Advertise,
            transaction_id: [1, 2, 3],
            options: vec![],
        });
        let outgoing = protocol::RelayMessage {
            msg_type: protocol::MessageType::RelayReply,
            hop_count: 0,
            link_address: GLOBAL.parse().unwrap(),
            peer_address: Ipv6Addr::LOCALHOST,
            options: vec![protocol::DhcpOption::RelayMessage(Box::new(
                advertise.clone(),
            ))],
        };
        assert!(replier.send_reply(&outgoing));

        let expected = advertise.to_vec();
        let mut frame = vec![0u8; 2 + expected.len()];
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.read_exact(&mut frame).unwrap();
        assert_eq!(frame[..2], (expected.len() as u16).to_be_bytes());
        assert_eq!(&frame[2..], expected.as_slice());
    }

    #[test]
    fn acceptor_enforces_the_connection_cap() {
        let listener = TcpListener::bind("[::1]:0").unwrap();
        let local = listener.local_addr().unwrap();

        let mut acceptor = TcpConnectionListener::with_server_port(
            "eth0",
            Arc::new(listener),
            Some(GLOBAL.parse().unwrap()),
            vec![],
            1,
            vec![],
            local.port(),
        )
        .unwrap();

        let _first_client = TcpStream::connect(local).unwrap();
        let first = wait_accept(&mut acceptor);
        assert!(first.is_some());
        assert_eq!(acceptor.open_connection_count(), 1);

        // The second connection exceeds the cap of one and is shut down.
        let _second_client = TcpStream::connect(local).unwrap();
        let second = wait_accept_rejection(&mut acceptor);
        assert!(second.is_none());

        // Dropping the first connection frees a slot again.
        drop(first);
        assert_eq!(acceptor.open_connection_count(), 0);
    }

    #[test]
    fn acceptor_enforces_the_allow_list() {
        let listener = TcpListener::bind("[::1]:0").unwrap();
        let local = listener.local_addr().unwrap();

        let mut acceptor = TcpConnectionListener::with_server_port(
            "eth0",
            Arc::new(listener),
            Some(GLOBAL.parse().unwrap()),
            vec![],
            10,
            vec!["2001:db8::/32".parse::<Ipv6Prefix>().unwrap()],
            local.port(),
        )
        .unwrap();

        // Loopback is not inside 2001:db8::/32.
        let _client = TcpStream::connect(local).unwrap();
        assert!(wait_accept_rejection(&mut acceptor).is_none());
        assert_eq!(acceptor.open_connection_count(), 0);
    }

    fn wait_accept(acceptor: &mut TcpConnectionListener) -> Option<TcpConnection> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(connection) = acceptor.accept_connection() {
                return Some(connection);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Polls until the pending connection has been processed (and
    /// rejected); `accept_connection` returns `None` either way, so give
    /// the acceptor a moment to actually see the connection.
    fn wait_accept_rejection(acceptor: &mut TcpConnectionListener) -> Option<TcpConnection> {
        let deadline = Instant::now() + Duration::from_millis(500);
        while Instant::now() < deadline {
            if let Some(connection) = acceptor.accept_connection() {
                return Some(connection);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        None
    }
}
