//! The unit of work crossing the supervisor/worker boundary.

use std::fmt;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU32, Ordering};

use protocol::DhcpOption;

/// The rolling message counter shared by all listeners, for log
/// correlation. Wraps back to 1 after 2^24 - 1.
static MESSAGE_COUNTER: AtomicU32 = AtomicU32::new(0);

const MESSAGE_COUNTER_MAX: u32 = 0x00FF_FFFF;

/// A short correlation tag attached to every received packet, rendered as
/// `#XXXXXX` in log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(u32);

impl MessageId {
    /// Claims the next id from the process-wide rolling counter.
    #[must_use]
    pub fn next() -> Self {
        let mut current = MESSAGE_COUNTER.load(Ordering::Relaxed);
        loop {
            let next = if current >= MESSAGE_COUNTER_MAX {
                1
            } else {
                current + 1
            };
            match MESSAGE_COUNTER.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return MessageId(next),
                Err(observed) => current = observed,
            }
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:06X}", self.0)
    }
}

/// Everything a worker needs to handle one received packet, independent of
/// the listener it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingPacketBundle {
    /// Correlation tag for log messages about this packet.
    pub message_id: MessageId,
    /// The raw DHCPv6 message bytes (without any TCP length prefix).
    pub data: Vec<u8>,
    /// The sender, zone stripped.
    pub source_address: Ipv6Addr,
    /// A stable global unicast address identifying the receiving link; the
    /// unspecified address only when the interface has none.
    pub link_address: Ipv6Addr,
    /// OS interface index for egress.
    pub interface_index: u32,
    /// Whether the packet arrived on a multicast listener.
    pub received_over_multicast: bool,
    /// Whether the packet arrived over TCP.
    pub received_over_tcp: bool,
    /// Free-form tags copied from the listener's configuration.
    pub marks: Vec<String>,
    /// Options the listener wants injected into the synthetic relay-forward
    /// wrapper; always starts with an interface-id option carrying the
    /// interface name.
    pub relay_options: Vec<DhcpOption>,
}

impl IncomingPacketBundle {
    /// The interface-id bytes the listener injected, used to check the echo
    /// in replies.
    #[must_use]
    pub fn interface_id(&self) -> Option<&[u8]> {
        self.relay_options.iter().find_map(|option| match option {
            DhcpOption::InterfaceId(data) => Some(data.as_slice()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::MessageId;

    #[test]
    fn message_ids_format_as_six_hex_digits() {
        let first = MessageId::next();
        let second = MessageId::next();
        assert_ne!(first, second);

        let text = first.to_string();
        assert!(text.starts_with('#'));
        assert_eq!(text.len(), 7);
        assert!(text[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
