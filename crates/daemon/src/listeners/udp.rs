//! UDP listeners and repliers.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6, UdpSocket};
use std::sync::Arc;

use protocol::{CLIENT_PORT, DhcpOption, MessageType, RelayMessage, SERVER_PORT, is_link_local};
use tracing::{error, trace};

use crate::bundle::{IncomingPacketBundle, MessageId};
use crate::listeners::{RecvError, Replier, SetupError};

const RECEIVE_BUFFER_SIZE: usize = 65536;

/// A listening UDP socket paired with the socket replies are sent from.
/// For multicast listeners the reply socket is a separate link-local
/// socket on the same interface; unicast listeners reply from the socket
/// they listen on.
#[derive(Debug)]
pub struct UdpListener {
    interface_name: String,
    interface_id: Vec<u8>,
    listen_socket: Arc<UdpSocket>,
    reply_socket: Arc<UdpSocket>,
    interface_index: u32,
    listen_address: Ipv6Addr,
    global_address: Ipv6Addr,
    marks: Vec<String>,
}

/// The pure part of the constructor checks, separated so the full matrix is
/// testable without binding privileged ports. Returns the effective global
/// address.
fn validate(
    interface_name: &str,
    listen: SocketAddrV6,
    reply: SocketAddrV6,
    separate_reply_socket: bool,
    expected_port: u16,
    global_address: Option<Ipv6Addr>,
) -> Result<Ipv6Addr, SetupError> {
    if listen.port() != expected_port || reply.port() != expected_port {
        return Err(SetupError::WrongPort(expected_port));
    }

    if listen.scope_id() != reply.scope_id() {
        return Err(SetupError::InterfaceMismatch);
    }

    if listen.ip().is_unspecified() || reply.ip().is_unspecified() {
        return Err(SetupError::WildcardAddress);
    }

    if listen.ip().is_multicast() && !is_link_local(*reply.ip()) {
        return Err(SetupError::ReplyNotLinkLocal);
    }

    if !listen.ip().is_multicast() && separate_reply_socket {
        return Err(SetupError::SeparateReplySocket);
    }

    match global_address {
        Some(address) => Ok(address),
        None if !is_link_local(*listen.ip()) && !listen.ip().is_multicast() => Ok(*listen.ip()),
        None => Err(SetupError::NoGlobalAddress(interface_name.to_owned())),
    }
}

fn local_v6(socket: &UdpSocket) -> Result<SocketAddrV6, SetupError> {
    match socket.local_addr()? {
        SocketAddr::V6(address) => Ok(address),
        SocketAddr::V4(_) => Err(SetupError::NotUdp),
    }
}

impl UdpListener {
    /// Wraps the given sockets after validating them: both IPv6 UDP, both
    /// on port 547, both on the same interface, explicitly bound, with a
    /// link-local reply socket for multicast listeners and no separate
    /// reply socket for unicast ones. The global address falls back to the
    /// listen address when that is usable for link identification.
    pub fn new(
        interface_name: &str,
        listen_socket: Arc<UdpSocket>,
        reply_socket: Option<Arc<UdpSocket>>,
        global_address: Option<Ipv6Addr>,
        marks: Vec<String>,
    ) -> Result<Self, SetupError> {
        Self::with_server_port(
            interface_name,
            listen_socket,
            reply_socket,
            global_address,
            marks,
            SERVER_PORT,
        )
    }

    /// [`UdpListener::new`] with the expected port as a parameter, so tests
    /// can exercise the constructor on unprivileged ports.
    pub(crate) fn with_server_port(
        interface_name: &str,
        listen_socket: Arc<UdpSocket>,
        reply_socket: Option<Arc<UdpSocket>>,
        global_address: Option<Ipv6Addr>,
        marks: Vec<String>,
        expected_port: u16,
    ) -> Result<Self, SetupError> {
        let separate_reply_socket = reply_socket.is_some();
        let reply_socket = reply_socket.unwrap_or_else(|| Arc::clone(&listen_socket));

        let listen = local_v6(&listen_socket)?;
        let reply = local_v6(&reply_socket)?;

        let global_address = validate(
            interface_name,
            listen,
            reply,
            separate_reply_socket,
            expected_port,
            global_address,
        )?;

        Ok(Self {
            interface_name: interface_name.to_owned(),
            interface_id: interface_name.as_bytes().to_vec(),
            listen_socket,
            reply_socket,
            interface_index: listen.scope_id(),
            listen_address: *listen.ip(),
            global_address,
            marks,
        })
    }

    /// The address this listener receives on.
    #[must_use]
    pub fn listen_address(&self) -> Ipv6Addr {
        self.listen_address
    }

    /// The global address identifying the receiving link.
    #[must_use]
    pub fn global_address(&self) -> Ipv6Addr {
        self.global_address
    }

    /// The interface this listener is bound on.
    #[must_use]
    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    /// The listening socket, for readiness registration and recycling.
    #[must_use]
    pub fn listen_socket(&self) -> &Arc<UdpSocket> {
        &self.listen_socket
    }

    /// The reply socket, for recycling across reloads.
    #[must_use]
    pub fn reply_socket(&self) -> &Arc<UdpSocket> {
        &self.reply_socket
    }

    /// Drains one datagram and turns it into a bundle plus a replier bound
    /// to the reply socket. Must only be called when the listening socket
    /// is ready.
    pub fn recv_request(&mut self) -> Result<(IncomingPacketBundle, Replier), RecvError> {
        let mut buffer = vec![0u8; RECEIVE_BUFFER_SIZE];
        let (length, sender) = self.listen_socket.recv_from(&mut buffer)?;
        buffer.truncate(length);

        let SocketAddr::V6(sender) = sender else {
            // An IPv6 socket never reports an IPv4 peer.
            return Err(RecvError::Ignore);
        };

        let message_id = MessageId::next();
        trace!(
            target: "packets",
            "{message_id}: Received message from {client_addr} port {port} on {interface}",
            client_addr = sender.ip(),
            port = sender.port(),
            interface = self.interface_name,
        );

        let bundle = IncomingPacketBundle {
            message_id,
            data: buffer,
            source_address: *sender.ip(),
            link_address: self.global_address,
            interface_index: self.interface_index,
            received_over_multicast: self.listen_address.is_multicast(),
            received_over_tcp: false,
            marks: self.marks.clone(),
            relay_options: vec![DhcpOption::InterfaceId(self.interface_id.clone())],
        };

        let replier = Replier::Udp(UdpReplier::new(Arc::clone(&self.reply_socket)));

        Ok((bundle, replier))
    }
}

/// Sends one reply from the listener's reply socket.
#[derive(Debug)]
pub struct UdpReplier {
    reply_socket: Arc<UdpSocket>,
    client_port: u16,
    server_port: u16,
}

impl UdpReplier {
    fn new(reply_socket: Arc<UdpSocket>) -> Self {
        Self::with_ports(reply_socket, CLIENT_PORT, SERVER_PORT)
    }

    /// [`UdpReplier`] with the destination ports as parameters, so tests
    /// can deliver to unprivileged receivers.
    pub(crate) fn with_ports(
        reply_socket: Arc<UdpSocket>,
        client_port: u16,
        server_port: u16,
    ) -> Self {
        Self {
            reply_socket,
            client_port,
            server_port,
        }
    }

    /// Where the reply inside `outgoing` has to go: relays (a nested
    /// relay-reply) are addressed on the server port, clients on the client
    /// port, both at the outer wrapper's peer-address. The egress scope id
    /// comes from the interface-id option when its bytes name a local
    /// interface, 0 otherwise.
    fn destination_for(&self, outgoing: &RelayMessage) -> Option<SocketAddrV6> {
        let relayed = outgoing.relayed_message()?;
        let port = if relayed.msg_type() == MessageType::RelayReply {
            self.server_port
        } else {
            self.client_port
        };

        let interface_index = outgoing
            .interface_id()
            .and_then(interface_index_for_id)
            .unwrap_or(0);

        Some(SocketAddrV6::new(
            outgoing.peer_address,
            port,
            0,
            interface_index,
        ))
    }

    /// Serialises the relayed message and sends it in one datagram.
    /// Success means the full serialised length went out.
    pub fn send_reply(&self, outgoing: &RelayMessage) -> bool {
        let Some(relayed) = outgoing.relayed_message() else {
            error!("Outgoing message carries no relayed message, not sending a reply");
            return false;
        };
        let Some(destination) = self.destination_for(outgoing) else {
            return false;
        };

        let data = relayed.to_vec();
        let success = match self.reply_socket.send_to(&data, SocketAddr::V6(destination)) {
            Ok(sent_length) => sent_length == data.len(),
            Err(error) => {
                error!(
                    "Could not send {message_type:?} to {client_addr} port {port}: {error}",
                    message_type = relayed.msg_type(),
                    client_addr = destination.ip(),
                    port = destination.port(),
                );
                return false;
            }
        };

        if success {
            trace!(
                target: "packets",
                "Sent {message_type:?} to {client_addr} port {port}",
                message_type = relayed.msg_type(),
                client_addr = destination.ip(),
                port = destination.port(),
            );
        } else {
            error!(
                "Could not send {message_type:?} to {client_addr} port {port}",
                message_type = relayed.msg_type(),
                client_addr = destination.ip(),
                port = destination.port(),
            );
        }

        success
    }
}

/// Resolves the interface named by an interface-id option to its index.
fn interface_index_for_id(interface_id: &[u8]) -> Option<u32> {
    let name = std::str::from_utf8(interface_id).ok()?;
    nix::net::if_::if_nametoindex(name).ok()
}
