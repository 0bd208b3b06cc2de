//! Listeners bundle a receiving socket with the matching way to reply.
//!
//! Each listener produces [`IncomingPacketBundle`](crate::bundle::IncomingPacketBundle)s
//! plus a [`Replier`] that
//! knows how to deliver the response: over the reply socket for UDP, over
//! the originating connection for TCP. The supervisor multiplexes on the
//! listeners' file descriptors and calls [`UdpListener::recv_request`] /
//! [`TcpConnection::recv_request`] only when the descriptor is ready, so
//! those never block.

pub mod factory;
pub mod tcp;
pub mod udp;

use std::io;

use protocol::RelayMessage;
use thiserror::Error;

pub use tcp::{TcpConnection, TcpConnectionListener, TcpReplier};
pub use udp::{UdpListener, UdpReplier};

/// Why a listener could not be created.
#[derive(Debug, Error)]
pub enum SetupError {
    /// One of the sockets is not an IPv6 UDP socket.
    #[error("listen and reply sockets have to be IPv6 UDP sockets")]
    NotUdp,

    /// The socket is not an IPv6 TCP socket.
    #[error("TCP listen sockets have to be IPv6 TCP sockets")]
    NotTcp,

    /// A socket is bound to the wrong port.
    #[error("listen and reply sockets have to be on port {0}")]
    WrongPort(u16),

    /// Listen and reply sockets disagree about the interface.
    #[error("listen and reply sockets have to be on the same interface")]
    InterfaceMismatch,

    /// Binding to the unspecified address is not supported.
    #[error("this server only supports listening on an explicit address, not on the wildcard")]
    WildcardAddress,

    /// A multicast listener's reply socket is not on a link-local address.
    #[error("multicast listening addresses need a link-local reply socket")]
    ReplyNotLinkLocal,

    /// A unicast listener was given a separate reply socket.
    #[error("unicast listening addresses can't use separate reply sockets")]
    SeparateReplySocket,

    /// No usable global address for link identification.
    #[error("cannot determine global address on interface {0}")]
    NoGlobalAddress(String),

    /// The configured interface does not exist.
    #[error("interface {0} not found")]
    UnknownInterface(String),

    /// The configured address is not present on the named interface.
    #[error("cannot find address {address} on interface {interface}")]
    AddressNotOnInterface {
        /// The address that was looked for.
        address: std::net::Ipv6Addr,
        /// The interface that was searched.
        interface: String,
    },

    /// The configured address is not present on any interface.
    #[error("cannot find address {0} on any interface")]
    AddressNotFound(std::net::Ipv6Addr),

    /// A multicast interface has no link-local address to reply from.
    #[error("no link-local address found on interface {0}")]
    NoLinkLocalAddress(String),

    /// The configured reply-from address is not link-local.
    #[error("the reply-from address must be a link-local address")]
    ReplyFromNotLinkLocal,

    /// The configured link-address is not global unicast.
    #[error("the link-address must be a global unicast address")]
    LinkAddressNotGlobal,

    /// The configured listener address is not global unicast.
    #[error("the listener address must be a global unicast address")]
    ListenAddressNotGlobal,

    /// The underlying socket operation failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Non-fatal control flow out of `recv_request`.
#[derive(Debug, Error)]
pub enum RecvError {
    /// Drop quietly; nothing useful was received.
    #[error("message ignored")]
    Ignore,

    /// The stream does not contain a complete message yet; the buffer is
    /// kept and a later readiness event continues where this one stopped.
    #[error("incomplete message")]
    Incomplete,

    /// The peer is gone; remove this listener from the multiplexer.
    #[error("listener closed")]
    Closed,

    /// The socket failed in an unexpected way.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A listener the supervisor multiplexes on: either a UDP listener that
/// produces bundles directly, or a TCP acceptor that produces
/// [`TcpConnection`] listeners.
#[derive(Debug)]
pub enum ServerListener {
    /// A unicast or multicast UDP listener.
    Udp(UdpListener),
    /// A listening TCP socket accepting connections.
    TcpAcceptor(TcpConnectionListener),
}

/// The reply channel handed out together with each bundle.
#[derive(Debug)]
pub enum Replier {
    /// Replies go out over a UDP reply socket.
    Udp(UdpReplier),
    /// Replies go back over the originating TCP connection.
    Tcp(TcpReplier),
}

impl Replier {
    /// Whether this replier may deliver more than one response.
    #[must_use]
    pub fn can_send_multiple(&self) -> bool {
        match self {
            Replier::Udp(_) => false,
            Replier::Tcp(_) => true,
        }
    }

    /// Sends one reply. The outgoing message must be the full relay-reply
    /// wrapper; the replier serialises the relayed message inside it.
    /// Returns whether sending succeeded.
    #[must_use]
    pub fn send_reply(&self, outgoing: &RelayMessage) -> bool {
        match self {
            Replier::Udp(replier) => replier.send_reply(outgoing),
            Replier::Tcp(replier) => replier.send_reply(outgoing),
        }
    }
}
