//! DHCPv6 options (RFC 8415 section 21).
//!
//! Options are stored serially with no padding, each as a two-byte code, a
//! two-byte length and the payload. Only the options the server core needs
//! to inspect are decoded structurally; everything else round-trips as
//! [`DhcpOption::Unknown`].

use crate::codec::{Decoder, Encoder};
use crate::error::ParseError;
use crate::message::Message;

/// DHCPv6 option codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionCode {
    /// OPTION_CLIENTID (1)
    ClientId,
    /// OPTION_SERVERID (2)
    ServerId,
    /// OPTION_RELAY_MSG (9)
    RelayMessage,
    /// OPTION_STATUS_CODE (13)
    StatusCode,
    /// OPTION_INTERFACE_ID (18)
    InterfaceId,
    /// Any other option code, carried through opaquely.
    Unknown(u16),
}

impl From<u16> for OptionCode {
    fn from(code: u16) -> Self {
        match code {
            1 => OptionCode::ClientId,
            2 => OptionCode::ServerId,
            9 => OptionCode::RelayMessage,
            13 => OptionCode::StatusCode,
            18 => OptionCode::InterfaceId,
            other => OptionCode::Unknown(other),
        }
    }
}

impl From<OptionCode> for u16 {
    fn from(code: OptionCode) -> Self {
        match code {
            OptionCode::ClientId => 1,
            OptionCode::ServerId => 2,
            OptionCode::RelayMessage => 9,
            OptionCode::StatusCode => 13,
            OptionCode::InterfaceId => 18,
            OptionCode::Unknown(other) => other,
        }
    }
}

/// A single DHCPv6 option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    /// The client's DUID, kept opaque.
    ClientId(Vec<u8>),
    /// The server's DUID, kept opaque.
    ServerId(Vec<u8>),
    /// A complete DHCPv6 message relayed inside a relay-forward or
    /// relay-reply wrapper.
    RelayMessage(Box<Message>),
    /// A status code with its human-readable message.
    StatusCode {
        /// Numeric status (RFC 8415 section 21.13).
        code: u16,
        /// UTF-8 status text.
        message: String,
    },
    /// The opaque interface identifier a relay inserts so replies can be
    /// routed back out of the right interface.
    InterfaceId(Vec<u8>),
    /// Any option this codec does not interpret.
    Unknown {
        /// The option code.
        code: u16,
        /// The raw option payload.
        data: Vec<u8>,
    },
}

impl DhcpOption {
    /// The code identifying this option on the wire.
    #[must_use]
    pub fn code(&self) -> OptionCode {
        match self {
            DhcpOption::ClientId(_) => OptionCode::ClientId,
            DhcpOption::ServerId(_) => OptionCode::ServerId,
            DhcpOption::RelayMessage(_) => OptionCode::RelayMessage,
            DhcpOption::StatusCode { .. } => OptionCode::StatusCode,
            DhcpOption::InterfaceId(_) => OptionCode::InterfaceId,
            DhcpOption::Unknown { code, .. } => OptionCode::Unknown(*code),
        }
    }

    pub(crate) fn decode(decoder: &mut Decoder<'_>, depth: u8) -> Result<Self, ParseError> {
        let header_offset = decoder.offset();
        let code = decoder.read_u16()?;
        let length = decoder.read_u16()? as usize;
        if decoder.remaining() < length {
            return Err(ParseError::OptionOverrun {
                code,
                offset: header_offset,
                declared: length,
                available: decoder.remaining(),
            });
        }
        let data = decoder.read_slice(length)?;

        let option = match OptionCode::from(code) {
            OptionCode::ClientId => DhcpOption::ClientId(data.to_vec()),
            OptionCode::ServerId => DhcpOption::ServerId(data.to_vec()),
            OptionCode::RelayMessage => {
                if data.is_empty() {
                    return Err(ParseError::EmptyRelayMessage);
                }
                let message = Message::decode_nested(data, depth)?;
                DhcpOption::RelayMessage(Box::new(message))
            }
            OptionCode::StatusCode => {
                if data.len() < 2 {
                    return Err(ParseError::ShortStatusCode);
                }
                let status = u16::from_be_bytes([data[0], data[1]]);
                let message = std::str::from_utf8(&data[2..])
                    .map_err(|_| ParseError::StatusMessageEncoding)?
                    .to_owned();
                DhcpOption::StatusCode {
                    code: status,
                    message,
                }
            }
            OptionCode::InterfaceId => DhcpOption::InterfaceId(data.to_vec()),
            OptionCode::Unknown(code) => DhcpOption::Unknown {
                code,
                data: data.to_vec(),
            },
        };

        Ok(option)
    }

    pub(crate) fn encode(&self, encoder: &mut Encoder) {
        let payload = match self {
            DhcpOption::ClientId(data)
            | DhcpOption::ServerId(data)
            | DhcpOption::InterfaceId(data) => data.clone(),
            DhcpOption::RelayMessage(message) => message.to_vec(),
            DhcpOption::StatusCode { code, message } => {
                let mut data = Vec::with_capacity(2 + message.len());
                data.extend_from_slice(&code.to_be_bytes());
                data.extend_from_slice(message.as_bytes());
                data
            }
            DhcpOption::Unknown { data, .. } => data.clone(),
        };

        encoder.write_u16(u16::from(self.code()));
        encoder.write_u16(payload.len() as u16);
        encoder.write_slice(&payload);
    }
}

/// Decodes options until the input is exhausted, preserving order. The
/// depth counts how many relay-message options enclose this option list;
/// it bounds the recursion through nested relay wrappers.
pub(crate) fn decode_options(
    decoder: &mut Decoder<'_>,
    depth: u8,
) -> Result<Vec<DhcpOption>, ParseError> {
    let mut options = Vec::new();
    while !decoder.is_empty() {
        options.push(DhcpOption::decode(decoder, depth)?);
    }
    Ok(options)
}

/// Returns the first option with the given code, mirroring the "first option
/// of a type wins" rule the server core relies on.
#[must_use]
pub(crate) fn find_option(options: &[DhcpOption], code: OptionCode) -> Option<&DhcpOption> {
    options.iter().find(|option| option.code() == code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> Result<DhcpOption, ParseError> {
        DhcpOption::decode(&mut Decoder::new(bytes), 0)
    }

    #[test]
    fn unknown_options_round_trip() {
        let bytes = [0x00, 0x17, 0x00, 0x03, 0xaa, 0xbb, 0xcc];
        let option = decode_one(&bytes).unwrap();
        assert_eq!(
            option,
            DhcpOption::Unknown {
                code: 23,
                data: vec![0xaa, 0xbb, 0xcc],
            }
        );

        let mut encoder = Encoder::new();
        option.encode(&mut encoder);
        assert_eq!(encoder.into_vec(), bytes);
    }

    #[test]
    fn interface_id_round_trips() {
        let bytes = [0x00, 0x12, 0x00, 0x04, b'e', b't', b'h', b'0'];
        let option = decode_one(&bytes).unwrap();
        assert_eq!(option, DhcpOption::InterfaceId(b"eth0".to_vec()));
        assert_eq!(option.code(), OptionCode::InterfaceId);

        let mut encoder = Encoder::new();
        option.encode(&mut encoder);
        assert_eq!(encoder.into_vec(), bytes);
    }

    #[test]
    fn status_code_decodes_text() {
        let bytes = [0x00, 0x0d, 0x00, 0x07, 0x00, 0x00, b'h', b'e', b'l', b'l', b'o'];
        let option = decode_one(&bytes).unwrap();
        assert_eq!(
            option,
            DhcpOption::StatusCode {
                code: 0,
                message: "hello".into(),
            }
        );
    }

    #[test]
    fn overrunning_option_is_rejected() {
        let bytes = [0x00, 0x01, 0x00, 0x08, 0x01];
        let err = decode_one(&bytes).unwrap_err();
        assert_eq!(
            err,
            ParseError::OptionOverrun {
                code: 1,
                offset: 0,
                declared: 8,
                available: 1,
            }
        );
    }

    #[test]
    fn empty_relay_message_is_rejected() {
        let bytes = [0x00, 0x09, 0x00, 0x00];
        assert_eq!(decode_one(&bytes).unwrap_err(), ParseError::EmptyRelayMessage);
    }

    #[test]
    fn first_option_of_a_code_wins() {
        let options = vec![
            DhcpOption::InterfaceId(b"eth0".to_vec()),
            DhcpOption::InterfaceId(b"eth1".to_vec()),
        ];
        assert_eq!(
            find_option(&options, OptionCode::InterfaceId),
            Some(&DhcpOption::InterfaceId(b"eth0".to_vec()))
        );
        assert_eq!(find_option(&options, OptionCode::ClientId), None);
    }
}
