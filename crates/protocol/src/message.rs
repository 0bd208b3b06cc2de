//! DHCPv6 messages (RFC 8415 sections 8 and 9).
//!
//! Client/server messages carry a one-byte message type, a three-byte
//! transaction id and options. Relay agent messages carry a hop count, a
//! link-address identifying the client's link and a peer-address naming the
//! next hop, with the relayed message nested inside a relay-message option.

use std::net::Ipv6Addr;

use crate::codec::{Decoder, Encoder};
use crate::error::ParseError;
use crate::options::{self, DhcpOption, OptionCode};

/// DHCPv6 message types (RFC 8415 section 7.3 plus later assignments).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// SOLICIT (1)
    Solicit,
    /// ADVERTISE (2)
    Advertise,
    /// REQUEST (3)
    Request,
    /// CONFIRM (4)
    Confirm,
    /// RENEW (5)
    Renew,
    /// REBIND (6)
    Rebind,
    /// REPLY (7)
    Reply,
    /// RELEASE (8)
    Release,
    /// DECLINE (9)
    Decline,
    /// RECONFIGURE (10)
    Reconfigure,
    /// INFORMATION-REQUEST (11)
    InformationRequest,
    /// RELAY-FORW (12)
    RelayForward,
    /// RELAY-REPL (13)
    RelayReply,
    /// LEASEQUERY (14, RFC 5007)
    LeaseQuery,
    /// LEASEQUERY-REPLY (15, RFC 5007)
    LeaseQueryReply,
    /// Any other message type.
    Unknown(u8),
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        use MessageType::{
            Advertise, Confirm, Decline, InformationRequest, LeaseQuery, LeaseQueryReply, Rebind,
            Reconfigure, RelayForward, RelayReply, Release, Renew, Reply, Request, Solicit,
            Unknown,
        };
        match value {
            1 => Solicit,
            2 => Advertise,
            3 => Request,
            4 => Confirm,
            5 => Renew,
            6 => Rebind,
            7 => Reply,
            8 => Release,
            9 => Decline,
            10 => Reconfigure,
            11 => InformationRequest,
            12 => RelayForward,
            13 => RelayReply,
            14 => LeaseQuery,
            15 => LeaseQueryReply,
            other => Unknown(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        use MessageType::{
            Advertise, Confirm, Decline, InformationRequest, LeaseQuery, LeaseQueryReply, Rebind,
            Reconfigure, RelayForward, RelayReply, Release, Renew, Reply, Request, Solicit,
            Unknown,
        };
        match value {
            Solicit => 1,
            Advertise => 2,
            Request => 3,
            Confirm => 4,
            Renew => 5,
            Rebind => 6,
            Reply => 7,
            Release => 8,
            Decline => 9,
            Reconfigure => 10,
            InformationRequest => 11,
            RelayForward => 12,
            RelayReply => 13,
            LeaseQuery => 14,
            LeaseQueryReply => 15,
            Unknown(other) => other,
        }
    }
}

impl MessageType {
    /// Whether this is one of the two relay agent message types.
    #[must_use]
    pub fn is_relay(self) -> bool {
        matches!(self, MessageType::RelayForward | MessageType::RelayReply)
    }
}

/// A decoded DHCPv6 message: either a client/server exchange message or a
/// relay agent wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A message with the msg-type / transaction-id header.
    Client(ClientMessage),
    /// A relay-forward or relay-reply wrapper.
    Relay(RelayMessage),
}

/// A client/server message: fixed header plus options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    /// The message type.
    pub msg_type: MessageType,
    /// The three-byte transaction id shared by all messages of an exchange.
    pub transaction_id: [u8; 3],
    /// Options in wire order.
    pub options: Vec<DhcpOption>,
}

/// A relay agent message: relay header plus options, one of which nests the
/// relayed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    /// [`MessageType::RelayForward`] or [`MessageType::RelayReply`].
    pub msg_type: MessageType,
    /// Number of relay agents that have already forwarded this message.
    pub hop_count: u8,
    /// A global address identifying the link the client is on.
    pub link_address: Ipv6Addr,
    /// The address of the relay or client this wrapper was received from.
    pub peer_address: Ipv6Addr,
    /// Options in wire order, normally including a relay-message option.
    pub options: Vec<DhcpOption>,
}

impl Message {
    /// Parses one DHCPv6 message from the start of `data`, returning the
    /// number of bytes consumed together with the message. For datagram
    /// input the consumed length equals the input length.
    pub fn parse(data: &[u8]) -> Result<(usize, Message), ParseError> {
        let mut decoder = Decoder::new(data);
        let message = Self::decode(&mut decoder, 0)?;
        Ok((decoder.offset(), message))
    }

    /// Parses a message nested inside a relay-message option. Nesting is
    /// bounded by the hop count limit so a crafted packet cannot recurse
    /// the decoder into the ground.
    pub(crate) fn decode_nested(data: &[u8], depth: u8) -> Result<Message, ParseError> {
        if depth >= crate::HOP_COUNT_LIMIT {
            return Err(ParseError::RelayNestingTooDeep(crate::HOP_COUNT_LIMIT));
        }
        let mut decoder = Decoder::new(data);
        Self::decode(&mut decoder, depth + 1)
    }

    fn decode(decoder: &mut Decoder<'_>, depth: u8) -> Result<Message, ParseError> {
        let msg_type = MessageType::from(decoder.read_u8()?);
        if msg_type.is_relay() {
            Ok(Message::Relay(RelayMessage {
                msg_type,
                hop_count: decoder.read_u8()?,
                link_address: Ipv6Addr::from(decoder.read_array::<16>()?),
                peer_address: Ipv6Addr::from(decoder.read_array::<16>()?),
                options: options::decode_options(decoder, depth)?,
            }))
        } else {
            Ok(Message::Client(ClientMessage {
                msg_type,
                transaction_id: decoder.read_array::<3>()?,
                options: options::decode_options(decoder, depth)?,
            }))
        }
    }

    /// Serialises the message to wire bytes.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            Message::Client(message) => {
                encoder.write_u8(u8::from(message.msg_type));
                encoder.write_slice(&message.transaction_id);
                for option in &message.options {
                    option.encode(&mut encoder);
                }
            }
            Message::Relay(message) => {
                encoder.write_u8(u8::from(message.msg_type));
                encoder.write_u8(message.hop_count);
                encoder.write_slice(&message.link_address.octets());
                encoder.write_slice(&message.peer_address.octets());
                for option in &message.options {
                    option.encode(&mut encoder);
                }
            }
        }
        encoder.into_vec()
    }

    /// The message type of the outermost layer.
    #[must_use]
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Client(message) => message.msg_type,
            Message::Relay(message) => message.msg_type,
        }
    }

    /// The relay wrapper, when this message is one.
    #[must_use]
    pub fn as_relay(&self) -> Option<&RelayMessage> {
        match self {
            Message::Relay(message) => Some(message),
            Message::Client(_) => None,
        }
    }
}

impl ClientMessage {
    /// The first option with the given code, if any.
    #[must_use]
    pub fn find_option(&self, code: OptionCode) -> Option<&DhcpOption> {
        options::find_option(&self.options, code)
    }
}

impl RelayMessage {
    /// The first option with the given code, if any.
    #[must_use]
    pub fn find_option(&self, code: OptionCode) -> Option<&DhcpOption> {
        options::find_option(&self.options, code)
    }

    /// The message nested directly inside this wrapper's relay-message
    /// option, which may itself be another relay wrapper.
    #[must_use]
    pub fn relayed_message(&self) -> Option<&Message> {
        match self.find_option(OptionCode::RelayMessage) {
            Some(DhcpOption::RelayMessage(message)) => Some(message.as_ref()),
            _ => None,
        }
    }

    /// The innermost non-relay message of the chain, walking through any
    /// number of nested relay wrappers.
    #[must_use]
    pub fn inner_message(&self) -> Option<&ClientMessage> {
        let mut current = self.relayed_message()?;
        loop {
            match current {
                Message::Client(message) => return Some(message),
                Message::Relay(relay) => current = relay.relayed_message()?,
            }
        }
    }

    /// The bytes of this wrapper's interface-id option, if present.
    #[must_use]
    pub fn interface_id(&self) -> Option<&[u8]> {
        match self.find_option(OptionCode::InterfaceId) {
            Some(DhcpOption::InterfaceId(data)) => Some(data.as_slice()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A SOLICIT with a client-id option, as a client on the wire would
    /// send it.
    fn solicit_packet() -> Vec<u8> {
        let mut packet = vec![0x01, 0xab, 0xcd, 0xef];
        packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x04, 0xde, 0xad, 0xbe, 0xef]);
        packet
    }

    /// The solicit above wrapped by one relay agent.
    fn relayed_solicit_packet() -> Vec<u8> {
        let solicit = solicit_packet();
        let mut packet = vec![0x0c, 0x01];
        packet.extend_from_slice(&"2001:db8:ffff:1::1".parse::<Ipv6Addr>().unwrap().octets());
        packet.extend_from_slice(&"fe80::3631:c4ff:fe3c:b2f1".parse::<Ipv6Addr>().unwrap().octets());
        packet.extend_from_slice(&[0x00, 0x12, 0x00, 0x07]);
        packet.extend_from_slice(b"Fa2/3:1");
        packet.extend_from_slice(&[0x00, 0x09]);
        packet.extend_from_slice(&(solicit.len() as u16).to_be_bytes());
        packet.extend_from_slice(&solicit);
        packet
    }

    #[test]
    fn parses_and_reserialises_a_solicit() {
        let packet = solicit_packet();
        let (length, message) = Message::parse(&packet).unwrap();
        assert_eq!(length, packet.len());
        assert_eq!(message.msg_type(), MessageType::Solicit);

        let Message::Client(client) = &message else {
            panic!("expected a client message");
        };
        assert_eq!(client.transaction_id, [0xab, 0xcd, 0xef]);
        assert_eq!(client.options.len(), 1);
        assert_eq!(
            client.find_option(OptionCode::ClientId),
            Some(&DhcpOption::ClientId(vec![0xde, 0xad, 0xbe, 0xef]))
        );

        assert_eq!(message.to_vec(), packet);
    }

    #[test]
    fn parses_and_reserialises_a_relayed_solicit() {
        let packet = relayed_solicit_packet();
        let (length, message) = Message::parse(&packet).unwrap();
        assert_eq!(length, packet.len());
        assert_eq!(message.msg_type(), MessageType::RelayForward);

        let relay = message.as_relay().unwrap();
        assert_eq!(relay.hop_count, 1);
        assert_eq!(
            relay.link_address,
            "2001:db8:ffff:1::1".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(
            relay.peer_address,
            "fe80::3631:c4ff:fe3c:b2f1".parse::<Ipv6Addr>().unwrap()
        );
        assert_eq!(relay.interface_id(), Some(&b"Fa2/3:1"[..]));

        let inner = relay.inner_message().unwrap();
        assert_eq!(inner.msg_type, MessageType::Solicit);
        assert_eq!(inner.transaction_id, [0xab, 0xcd, 0xef]);

        assert_eq!(message.to_vec(), packet);
    }

    #[test]
    fn walks_a_doubly_relayed_chain() {
        let once = relayed_solicit_packet();
        let mut twice = vec![0x0c, 0x02];
        twice.extend_from_slice(&"2001:db8::2".parse::<Ipv6Addr>().unwrap().octets());
        twice.extend_from_slice(&"fe80::1".parse::<Ipv6Addr>().unwrap().octets());
        twice.extend_from_slice(&[0x00, 0x09]);
        twice.extend_from_slice(&(once.len() as u16).to_be_bytes());
        twice.extend_from_slice(&once);

        let (_, message) = Message::parse(&twice).unwrap();
        let outer = message.as_relay().unwrap();
        assert_eq!(outer.hop_count, 2);

        let middle = outer.relayed_message().unwrap().as_relay().unwrap();
        assert_eq!(middle.hop_count, 1);

        let inner = outer.inner_message().unwrap();
        assert_eq!(inner.msg_type, MessageType::Solicit);
    }

    #[test]
    fn truncated_relay_header_is_rejected() {
        let packet = [0x0c, 0x00, 0x20, 0x01];
        let err = Message::parse(&packet).unwrap_err();
        assert!(matches!(err, ParseError::Truncated { .. }));
    }

    #[test]
    fn truncated_client_header_is_rejected() {
        let err = Message::parse(&[0x01, 0xab]).unwrap_err();
        assert!(matches!(err, ParseError::Truncated { .. }));
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(
            Message::parse(&[]).unwrap_err(),
            ParseError::Truncated { .. }
        ));
    }

    #[test]
    fn unknown_message_types_parse_as_client_messages() {
        let packet = [0xfe, 0x00, 0x00, 0x01];
        let (_, message) = Message::parse(&packet).unwrap();
        assert_eq!(message.msg_type(), MessageType::Unknown(0xfe));
        assert_eq!(message.to_vec(), packet);
    }

    #[test]
    fn excessive_relay_nesting_is_rejected() {
        // Build a chain nested one level past the hop count limit.
        let mut message = solicit_packet();
        for hop in 0..=crate::HOP_COUNT_LIMIT {
            let mut wrapper = vec![0x0c, hop];
            wrapper.extend_from_slice(&Ipv6Addr::UNSPECIFIED.octets());
            wrapper.extend_from_slice(&Ipv6Addr::UNSPECIFIED.octets());
            wrapper.extend_from_slice(&[0x00, 0x09]);
            wrapper.extend_from_slice(&(message.len() as u16).to_be_bytes());
            wrapper.extend_from_slice(&message);
            message = wrapper;
        }

        let err = Message::parse(&message).unwrap_err();
        assert_eq!(
            err,
            ParseError::RelayNestingTooDeep(crate::HOP_COUNT_LIMIT)
        );
    }

    #[test]
    fn relay_without_relay_message_option_has_no_inner() {
        let mut packet = vec![0x0d, 0x00];
        packet.extend_from_slice(&Ipv6Addr::UNSPECIFIED.octets());
        packet.extend_from_slice(&Ipv6Addr::UNSPECIFIED.octets());
        let (_, message) = Message::parse(&packet).unwrap();
        let relay = message.as_relay().unwrap();
        assert_eq!(relay.relayed_message(), None);
        assert_eq!(relay.inner_message(), None);
    }
}
