#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! DHCPv6 wire codec for the server core: parsing and serialising the
//! messages described in RFC 8415, including the nested relay-forward /
//! relay-reply wrapping used by relay agents. The server core only relies on
//! a narrow surface: [`Message::parse`] producing the consumed length
//! together with the decoded message, [`Message::to_vec`] producing wire
//! bytes, and the accessors on [`RelayMessage`] for walking a relay chain and
//! finding options.
//!
//! # Design
//!
//! Messages are a sum type: [`Message::Client`] for the fixed
//! msg-type/transaction-id header and [`Message::Relay`] for the
//! hop-count/link-address/peer-address header. Options are kept as an
//! ordered list of [`DhcpOption`] values; unrecognised options round-trip
//! through [`DhcpOption::Unknown`] untouched. Only the option types the
//! server core inspects are decoded structurally; everything else is opaque
//! payload by design.
//!
//! # Invariants
//!
//! - Serialising a parsed message reproduces the input bytes exactly
//!   (options keep their original order, unknown options keep their bytes).
//! - A relay message always serialises to at least 34 bytes.
//! - Parsing never panics on arbitrary input; truncated or structurally
//!   invalid input yields a [`ParseError`].

mod codec;
pub mod error;
pub mod message;
pub mod options;

pub use error::ParseError;
pub use message::{ClientMessage, Message, MessageType, RelayMessage};
pub use options::{DhcpOption, OptionCode};

use std::net::Ipv6Addr;

/// UDP port DHCPv6 servers and relay agents listen on.
pub const SERVER_PORT: u16 = 547;

/// UDP port DHCPv6 clients listen on.
pub const CLIENT_PORT: u16 = 546;

/// The `All_DHCP_Relay_Agents_and_Servers` link-scoped multicast group
/// (RFC 8415 section 7.1).
pub const ALL_DHCP_RELAY_AGENTS_AND_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 1, 2);

/// The `All_DHCP_Servers` site-scoped multicast group (RFC 8415 section 7.1).
pub const ALL_DHCP_SERVERS: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 1, 3);

/// Maximum hop count a relay agent may forward (RFC 8415 section 7.6).
pub const HOP_COUNT_LIMIT: u8 = 32;

/// Whether an address is routable global unicast for the purpose of link
/// identification: not unspecified, not loopback, not multicast and not
/// link-local. Unique-local addresses count as global here, matching how
/// operators use them for link-addresses on internal networks.
#[must_use]
pub fn is_global_unicast(address: Ipv6Addr) -> bool {
    !address.is_unspecified()
        && !address.is_loopback()
        && !address.is_multicast()
        && !is_link_local(address)
}

/// Whether an address is in fe80::/10.
#[must_use]
pub fn is_link_local(address: Ipv6Addr) -> bool {
    (address.segments()[0] & 0xffc0) == 0xfe80
}
