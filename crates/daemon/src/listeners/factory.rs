//! Builds listeners from configuration, recycling sockets from the
//! previous generation across reloads so established bindings (and the
//! multicast group memberships that come with them) survive.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6, TcpListener, UdpSocket};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use protocol::{
    ALL_DHCP_RELAY_AGENTS_AND_SERVERS, SERVER_PORT, is_global_unicast, is_link_local,
};

use crate::config::ListenerConfig;
use crate::ifaces;
use crate::listeners::{ServerListener, SetupError, TcpConnectionListener, UdpListener};

const TCP_LISTEN_BACKLOG: i32 = 10;

/// Creates the listener described by one configuration entry. The old
/// listeners are searched for sockets that can be reused.
pub fn create_listener(
    config: &ListenerConfig,
    old_listeners: &[ServerListener],
) -> Result<ServerListener, SetupError> {
    match config {
        ListenerConfig::MulticastInterface {
            interface,
            reply_from,
            link_address,
            listen_to_self,
            marks,
        } => create_multicast_interface(
            interface,
            *reply_from,
            *link_address,
            *listen_to_self,
            marks.clone(),
            old_listeners,
        ),
        ListenerConfig::Unicast { address, marks } => {
            create_unicast(*address, marks.clone(), old_listeners)
        }
        ListenerConfig::UnicastTcp {
            address,
            max_connections,
            allow_from,
            marks,
        } => create_unicast_tcp(
            *address,
            *max_connections,
            allow_from.clone(),
            marks.clone(),
            old_listeners,
        ),
    }
}

fn create_multicast_interface(
    interface: &str,
    reply_from: Option<Ipv6Addr>,
    link_address: Option<Ipv6Addr>,
    listen_to_self: bool,
    marks: Vec<String>,
    old_listeners: &[ServerListener],
) -> Result<ServerListener, SetupError> {
    let interface_index = ifaces::interface_index(interface)?;
    let interface_addresses = ifaces::addresses_on(interface)?;

    // Pick the first link-local address as reply-from if none is
    // configured; a configured one that is not link-local is an error,
    // not something to silently fall through from.
    let reply_from = match reply_from {
        Some(address) => {
            if !is_link_local(address) {
                return Err(SetupError::ReplyFromNotLinkLocal);
            }
            if !interface_addresses.contains(&address) {
                return Err(SetupError::AddressNotOnInterface {
                    address,
                    interface: interface.to_owned(),
                });
            }
            address
        }
        None => ifaces::first_link_local(interface)?
            .ok_or_else(|| SetupError::NoLinkLocalAddress(interface.to_owned()))?,
    };

    // The link-address is extra information for the handlers; it does not
    // have to exist on the interface, but it does have to be global.
    let link_address = match link_address {
        Some(address) => {
            if !is_global_unicast(address) {
                return Err(SetupError::LinkAddressNotGlobal);
            }
            address
        }
        None => ifaces::first_global_unicast(interface)?.unwrap_or(Ipv6Addr::UNSPECIFIED),
    };

    let multicast = ALL_DHCP_RELAY_AGENTS_AND_SERVERS;
    let listen_socket =
        match recycle_udp_socket(old_listeners, multicast, SERVER_PORT, interface_index) {
            Some(socket) => {
                debug!("Recycling existing multicast socket on {interface}");
                socket
            }
            None => {
                debug!("Listening for multicast requests on {interface}");
                let socket = udp_socket()?;
                socket.bind(&SocketAddrV6::new(multicast, SERVER_PORT, 0, interface_index).into())?;
                socket.join_multicast_v6(&multicast, interface_index)?;
                socket.set_nonblocking(true)?;
                Arc::new(UdpSocket::from(socket))
            }
        };

    listen_socket.set_multicast_loop_v6(listen_to_self)?;

    let reply_socket =
        match recycle_udp_socket(old_listeners, reply_from, SERVER_PORT, interface_index) {
            Some(socket) => {
                debug!("Recycling existing reply socket for {reply_from} on {interface}");
                socket
            }
            None => {
                debug!("Sending replies from {reply_from}");
                let socket = udp_socket()?;
                socket
                    .bind(&SocketAddrV6::new(reply_from, SERVER_PORT, 0, interface_index).into())?;
                socket.set_nonblocking(true)?;
                Arc::new(UdpSocket::from(socket))
            }
        };

    Ok(ServerListener::Udp(UdpListener::new(
        interface,
        listen_socket,
        Some(reply_socket),
        Some(link_address),
        marks,
    )?))
}

fn create_unicast(
    address: Ipv6Addr,
    marks: Vec<String>,
    old_listeners: &[ServerListener],
) -> Result<ServerListener, SetupError> {
    if !is_global_unicast(address) {
        return Err(SetupError::ListenAddressNotGlobal);
    }

    let interface = ifaces::interface_for_address(address)?
        .ok_or(SetupError::AddressNotFound(address))?;

    let socket = match recycle_udp_socket(old_listeners, address, SERVER_PORT, 0) {
        Some(socket) => {
            debug!("Recycling existing socket for {address} on {interface}");
            socket
        }
        None => {
            debug!("Creating socket for {address} on {interface}");
            let socket = udp_socket()?;
            socket.bind(&SocketAddrV6::new(address, SERVER_PORT, 0, 0).into())?;
            socket.set_nonblocking(true)?;
            Arc::new(UdpSocket::from(socket))
        }
    };

    Ok(ServerListener::Udp(UdpListener::new(
        &interface, socket, None, None, marks,
    )?))
}

fn create_unicast_tcp(
    address: Ipv6Addr,
    max_connections: usize,
    allow_from: Vec<crate::config::Ipv6Prefix>,
    marks: Vec<String>,
    old_listeners: &[ServerListener],
) -> Result<ServerListener, SetupError> {
    if !is_global_unicast(address) {
        return Err(SetupError::ListenAddressNotGlobal);
    }

    let interface = ifaces::interface_for_address(address)?
        .ok_or(SetupError::AddressNotFound(address))?;

    let socket = match recycle_tcp_socket(old_listeners, address, SERVER_PORT) {
        Some(socket) => {
            debug!("Recycling existing TCP socket for {address} on {interface}");
            socket
        }
        None => {
            debug!("Creating TCP socket for {address} on {interface}");
            let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
            socket.set_only_v6(true)?;
            socket.set_reuse_address(true)?;
            socket.bind(&SocketAddrV6::new(address, SERVER_PORT, 0, 0).into())?;
            socket.listen(TCP_LISTEN_BACKLOG)?;
            Arc::new(TcpListener::from(socket))
        }
    };

    Ok(ServerListener::TcpAcceptor(TcpConnectionListener::new(
        &interface,
        socket,
        None,
        marks,
        max_connections,
        allow_from,
    )?))
}

fn udp_socket() -> Result<Socket, SetupError> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(true)?;
    Ok(socket)
}

/// Finds a socket from the previous listener generation bound to exactly
/// this address, port and interface.
fn recycle_udp_socket(
    old_listeners: &[ServerListener],
    address: Ipv6Addr,
    port: u16,
    interface_index: u32,
) -> Option<Arc<UdpSocket>> {
    for listener in old_listeners {
        let ServerListener::Udp(listener) = listener else {
            continue;
        };
        for socket in [listener.listen_socket(), listener.reply_socket()] {
            if let Ok(SocketAddr::V6(local)) = socket.local_addr() {
                if *local.ip() == address
                    && local.port() == port
                    && local.scope_id() == interface_index
                {
                    return Some(Arc::clone(socket));
                }
            }
        }
    }
    None
}

fn recycle_tcp_socket(
    old_listeners: &[ServerListener],
    address: Ipv6Addr,
    port: u16,
) -> Option<Arc<TcpListener>> {
    for listener in old_listeners {
        let ServerListener::TcpAcceptor(listener) = listener else {
            continue;
        };
        if let Ok(SocketAddr::V6(local)) = listener.listen_socket().local_addr() {
            if *local.ip() == address && local.port() == port {
                return Some(Arc::clone(listener.listen_socket()));
            }
        }
    }
    None
}
