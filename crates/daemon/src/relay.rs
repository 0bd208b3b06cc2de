//! The "internal relay" normalisation.
//!
//! Every incoming message is wrapped in a synthetic relay-forward, as if it
//! had been forwarded by a relay co-located with the server. Handlers then
//! see one uniform shape, with the receiving interface, link identity and
//! sender captured in the wrapper, whether or not the client's message
//! travelled through real relays. On the way out, the handler must return a
//! relay-reply wrapper that matches the request's wrapper; the checks here
//! stop replies from leaking onto the wrong link.

use std::net::Ipv6Addr;

use protocol::{DhcpOption, Message, MessageType, ParseError, RelayMessage};
use thiserror::Error;

use crate::bundle::IncomingPacketBundle;

/// Why a reply violates the wrapping contract.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplyError {
    /// The outer message is not a relay-reply.
    #[error("the reply has to be wrapped in a relay-reply message")]
    NotARelayReply,

    /// The reply names a different link than the request.
    #[error(
        "the relay-reply link-address {actual} does not match \
         the relay-forward link-address {expected}"
    )]
    LinkAddressMismatch {
        /// The link-address of the original bundle.
        expected: Ipv6Addr,
        /// The link-address the handler put into the reply.
        actual: Ipv6Addr,
    },

    /// The reply echoes a different interface-id than the listener
    /// injected.
    #[error("the interface-id in the reply does not match the interface-id of the request")]
    InterfaceIdMismatch,

    /// The relay-reply wrapper carries no message.
    #[error("the relay-reply message does not contain a message")]
    MissingRelayedMessage,
}

/// Parses the bundle's wire bytes and wraps the message the way an
/// internal relay would: hop count one above an already-relayed message
/// (zero otherwise), the listener's global address as link-address, the
/// sender as peer-address, and the listener's relay options followed by
/// the relay-message option with the original message.
pub fn wrap_incoming(bundle: &IncomingPacketBundle) -> Result<RelayMessage, ParseError> {
    let (_, message) = Message::parse(&bundle.data)?;

    let hop_count = match &message {
        Message::Relay(relay) if relay.msg_type == MessageType::RelayForward => {
            relay.hop_count.saturating_add(1)
        }
        _ => 0,
    };

    let mut options = bundle.relay_options.clone();
    options.push(DhcpOption::RelayMessage(Box::new(message)));

    Ok(RelayMessage {
        msg_type: MessageType::RelayForward,
        hop_count,
        link_address: bundle.link_address,
        peer_address: bundle.source_address,
        options,
    })
}

/// Verifies that a reply honours the wrapper of the request it answers.
/// On violation no bytes must be sent.
pub fn validate_reply(
    bundle: &IncomingPacketBundle,
    reply: &RelayMessage,
) -> Result<(), ReplyError> {
    if reply.msg_type != MessageType::RelayReply {
        return Err(ReplyError::NotARelayReply);
    }

    if reply.link_address != bundle.link_address {
        return Err(ReplyError::LinkAddressMismatch {
            expected: bundle.link_address,
            actual: reply.link_address,
        });
    }

    if let Some(interface_id) = reply.interface_id() {
        if Some(interface_id) != bundle.interface_id() {
            return Err(ReplyError::InterfaceIdMismatch);
        }
    }

    if reply.relayed_message().is_none() {
        return Err(ReplyError::MissingRelayedMessage);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ReplyError, validate_reply, wrap_incoming};
    use crate::bundle::{IncomingPacketBundle, MessageId};
    use protocol::{ClientMessage, DhcpOption, Message, MessageType, ParseError, RelayMessage};
    use std::net::Ipv6Addr;

    const LINK: &str = "2001:db8::1";

    fn bundle_for(data: Vec<u8>, source: &str, multicast: bool) -> IncomingPacketBundle {
        IncomingPacketBundle {
            message_id: MessageId::next(),
            data,
            source_address: source.parse().unwrap(),
            link_address: LINK.parse().unwrap(),
            interface_index: 42,
            received_over_multicast: multicast,
            received_over_tcp: false,
            marks: vec![],
            relay_options: vec![DhcpOption::InterfaceId(b"eth0".to_vec())],
        }
    }

    fn solicit_bytes() -> Vec<u8> {
        vec![0x01, 0xab, 0xcd, 0xef]
    }

    fn relayed_solicit_bytes(hop_count: u8) -> Vec<u8> {
        let inner = solicit_bytes();
        let mut bytes = vec![0x0c, hop_count];
        bytes.extend_from_slice(&LINK.parse::<Ipv6Addr>().unwrap().octets());
        bytes.extend_from_slice(&"fe80::2".parse::<Ipv6Addr>().unwrap().octets());
        bytes.extend_from_slice(&[0x00, 0x09]);
        bytes.extend_from_slice(&(inner.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&inner);
        bytes
    }

    #[test]
    fn wraps_a_multicast_solicit() {
        let bundle = bundle_for(solicit_bytes(), "2001:db8::babe", true);
        let wrapped = wrap_incoming(&bundle).unwrap();

        assert_eq!(wrapped.msg_type, MessageType::RelayForward);
        assert_eq!(wrapped.hop_count, 0);
        assert_eq!(wrapped.link_address, LINK.parse::<Ipv6Addr>().unwrap());
        assert_eq!(
            wrapped.peer_address,
            "2001:db8::babe".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(wrapped.interface_id(), Some(&b"eth0"[..]));

        // Exactly one interface-id option, and the relayed message is the
        // original solicit.
        let interface_ids = wrapped
            .options
            .iter()
            .filter(|option| matches!(option, DhcpOption::InterfaceId(_)))
            .count();
        assert_eq!(interface_ids, 1);
        assert_eq!(
            wrapped.relayed_message().unwrap().to_vec(),
            solicit_bytes()
        );
    }

    #[test]
    fn wrapping_increments_the_hop_count_of_relayed_messages() {
        let bundle = bundle_for(relayed_solicit_bytes(1), "2001:db8::ff", false);
        let wrapped = wrap_incoming(&bundle).unwrap();

        assert_eq!(wrapped.hop_count, 2);
        assert_eq!(
            wrapped.peer_address,
            "2001:db8::ff".parse::<Ipv6Addr>().unwrap()
        );

        // The original relay wrapper is preserved one level down.
        let original = wrapped.relayed_message().unwrap().as_relay().unwrap();
        assert_eq!(original.hop_count, 1);
    }

    #[test]
    fn wrapping_rejects_garbage() {
        let bundle = bundle_for(vec![0x0c, 0x00, 0x01], "2001:db8::1", false);
        assert!(matches!(
            wrap_incoming(&bundle).unwrap_err(),
            ParseError::Truncated { .. }
        ));
    }

    fn advertise() -> Message {
        Message::Client(ClientMessage {
            msg_type: MessageType::Advertise,
            transaction_id: [0xab, 0xcd, 0xef],
            options: vec![],
        })
    }

    fn reply_with(link_address: &str, interface_id: Option<&[u8]>) -> RelayMessage {
        let mut options = Vec::new();
        if let Some(id) = interface_id {
            options.push(DhcpOption::InterfaceId(id.to_vec()));
        }
        options.push(DhcpOption::RelayMessage(Box::new(advertise())));
        RelayMessage {
            msg_type: MessageType::RelayReply,
            hop_count: 0,
            link_address: link_address.parse().unwrap(),
            peer_address: "fe80::babe".parse().unwrap(),
            options,
        }
    }

    #[test]
    fn accepts_a_matching_reply() {
        let bundle = bundle_for(solicit_bytes(), "fe80::babe", true);
        let reply = reply_with(LINK, Some(b"eth0"));
        assert_eq!(validate_reply(&bundle, &reply), Ok(()));
    }

    #[test]
    fn accepts_a_reply_without_interface_id() {
        let bundle = bundle_for(solicit_bytes(), "fe80::babe", true);
        let reply = reply_with(LINK, None);
        assert_eq!(validate_reply(&bundle, &reply), Ok(()));
    }

    #[test]
    fn rejects_a_wrong_link_address() {
        let bundle = bundle_for(solicit_bytes(), "fe80::babe", true);
        let reply = reply_with("2001:db8::bad", Some(b"eth0"));
        assert_eq!(
            validate_reply(&bundle, &reply),
            Err(ReplyError::LinkAddressMismatch {
                expected: LINK.parse().unwrap(),
                actual: "2001:db8::bad".parse().unwrap(),
            })
        );
    }

    #[test]
    fn rejects_a_wrong_interface_id() {
        let bundle = bundle_for(solicit_bytes(), "fe80::babe", true);
        let reply = reply_with(LINK, Some(b"eth1"));
        assert_eq!(
            validate_reply(&bundle, &reply),
            Err(ReplyError::InterfaceIdMismatch)
        );
    }

    #[test]
    fn rejects_a_forward_wrapper() {
        let bundle = bundle_for(solicit_bytes(), "fe80::babe", true);
        let mut reply = reply_with(LINK, Some(b"eth0"));
        reply.msg_type = MessageType::RelayForward;
        assert_eq!(
            validate_reply(&bundle, &reply),
            Err(ReplyError::NotARelayReply)
        );
    }

    #[test]
    fn rejects_an_empty_wrapper() {
        let bundle = bundle_for(solicit_bytes(), "fe80::babe", true);
        let reply = RelayMessage {
            msg_type: MessageType::RelayReply,
            hop_count: 0,
            link_address: LINK.parse().unwrap(),
            peer_address: "fe80::babe".parse().unwrap(),
            options: vec![DhcpOption::InterfaceId(b"eth0".to_vec())],
        };
        assert_eq!(
            validate_reply(&bundle, &reply),
            Err(ReplyError::MissingRelayedMessage)
        );
    }
}
