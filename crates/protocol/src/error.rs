//! Codec error types.

use thiserror::Error;

/// Errors raised while decoding DHCPv6 wire bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The input ended before the structure was complete.
    #[error("message truncated: needed {needed} more bytes at offset {offset}")]
    Truncated {
        /// Offset at which more data was required.
        offset: usize,
        /// Number of missing bytes.
        needed: usize,
    },

    /// An option's declared length exceeds the remaining input.
    #[error("option {code} at offset {offset} declares {declared} bytes but only {available} remain")]
    OptionOverrun {
        /// The option code.
        code: u16,
        /// Offset of the option header.
        offset: usize,
        /// Declared option length.
        declared: usize,
        /// Bytes actually available.
        available: usize,
    },

    /// A relay-message option carried no payload.
    #[error("empty relay-message option")]
    EmptyRelayMessage,

    /// Relay wrappers nested beyond the protocol's hop count limit.
    #[error("relay messages nested more than {0} levels deep")]
    RelayNestingTooDeep(u8),

    /// A status-code option was shorter than its two-byte code.
    #[error("status-code option shorter than two bytes")]
    ShortStatusCode,

    /// The embedded status message was not valid UTF-8.
    #[error("status-code message is not valid UTF-8")]
    StatusMessageEncoding,
}
