//! Per-job processing inside worker threads.

use std::panic::{AssertUnwindSafe, catch_unwind};

use protocol::RelayMessage;
use tracing::{error, warn};

use crate::bundle::IncomingPacketBundle;
use crate::handler::SharedHandler;
use crate::listeners::Replier;
use crate::relay;

/// One dispatched request: the bundle and the way back to its sender.
#[derive(Debug)]
pub struct Job {
    /// The received packet and its metadata.
    pub bundle: IncomingPacketBundle,
    /// Delivers the reply, if the handler produces one.
    pub replier: Replier,
}

/// Handles one job start to finish: parse and wrap the wire bytes, run the
/// handler, validate the reply wrapper and send. Every failure mode is
/// logged and swallowed; nothing a single request does may take the worker
/// down.
pub fn handle_job(handler: &SharedHandler, job: &Job) {
    let Some(reply) = produce_reply(handler, &job.bundle) else {
        return;
    };

    // Send failures are logged by the replier itself.
    let _ = job.replier.send_reply(&reply);
}

/// The reply for one bundle, or `None` when the request is dropped for
/// any reason.
fn produce_reply(handler: &SharedHandler, bundle: &IncomingPacketBundle) -> Option<RelayMessage> {
    let wrapped = match relay::wrap_incoming(bundle) {
        Ok(wrapped) => wrapped,
        Err(error) => {
            warn!(
                "Invalid message from {sender}: {error}",
                sender = bundle.source_address,
            );
            return None;
        }
    };

    let result = catch_unwind(AssertUnwindSafe(|| handler.handle(&wrapped, bundle)));

    let reply = match result {
        Ok(Ok(reply)) => reply?,
        Ok(Err(error)) => {
            error!(
                "{message_id}: Caught unexpected exception {error:?}",
                message_id = bundle.message_id,
            );
            return None;
        }
        Err(_panic) => {
            error!(
                "{message_id}: Handler panicked, not sending a reply",
                message_id = bundle.message_id,
            );
            return None;
        }
    };

    if let Err(error) = relay::validate_reply(bundle, &reply) {
        error!(
            "{message_id}: Handler returned invalid message: {error}",
            message_id = bundle.message_id,
        );
        return None;
    }

    Some(reply)
}

#[cfg(test)]
mod tests {
    use super::produce_reply;
    use crate::bundle::{IncomingPacketBundle, MessageId};
    use crate::handler::{HandlerError, MessageHandler, SharedHandler};
    use protocol::{ClientMessage, DhcpOption, Message, MessageType, RelayMessage};
    use std::sync::Arc;

    fn bundle_with(data: Vec<u8>) -> IncomingPacketBundle {
        IncomingPacketBundle {
            message_id: MessageId::next(),
            data,
            source_address: "fe80::babe".parse().unwrap(),
            link_address: "2001:db8::1".parse().unwrap(),
            interface_index: 42,
            received_over_multicast: true,
            received_over_tcp: false,
            marks: vec![],
            relay_options: vec![DhcpOption::InterfaceId(b"eth0".to_vec())],
        }
    }

    fn solicit_bytes() -> Vec<u8> {
        vec![0x01, 0xab, 0xcd, 0xef]
    }

    struct AnsweringHandler {
        link_address: std::net::Ipv6Addr,
    }

    impl MessageHandler for AnsweringHandler {
        fn handle(
            &self,
            wrapped: &RelayMessage,
            _bundle: &IncomingPacketBundle,
        ) -> Result<Option<RelayMessage>, HandlerError> {
            let advertise = Message::Client(ClientMessage {
                msg_type: MessageType::Advertise,
                transaction_id: [0xab, 0xcd, 0xef],
                options: vec![],
            });
            Ok(Some(RelayMessage {
                msg_type: MessageType::RelayReply,
                hop_count: wrapped.hop_count,
                link_address: self.link_address,
                peer_address: wrapped.peer_address,
                options: vec![
                    DhcpOption::InterfaceId(b"eth0".to_vec()),
                    DhcpOption::RelayMessage(Box::new(advertise)),
                ],
            }))
        }
    }

    struct FailingHandler;

    impl MessageHandler for FailingHandler {
        fn handle(
            &self,
            _wrapped: &RelayMessage,
            _bundle: &IncomingPacketBundle,
        ) -> Result<Option<RelayMessage>, HandlerError> {
            Err(HandlerError("database is on fire".into()))
        }
    }

    struct PanickingHandler;

    impl MessageHandler for PanickingHandler {
        fn handle(
            &self,
            _wrapped: &RelayMessage,
            _bundle: &IncomingPacketBundle,
        ) -> Result<Option<RelayMessage>, HandlerError> {
            panic!("unexpected state");
        }
    }

    #[test]
    fn valid_replies_pass_through() {
        let handler = SharedHandler::new(Arc::new(AnsweringHandler {
            link_address: "2001:db8::1".parse().unwrap(),
        }));
        let reply = produce_reply(&handler, &bundle_with(solicit_bytes()));
        let reply = reply.expect("a valid reply should be produced");
        assert_eq!(reply.msg_type, MessageType::RelayReply);
    }

    #[test]
    fn unparseable_packets_are_dropped() {
        let handler = SharedHandler::new(Arc::new(AnsweringHandler {
            link_address: "2001:db8::1".parse().unwrap(),
        }));
        assert!(produce_reply(&handler, &bundle_with(vec![0x0c, 0x00])).is_none());
    }

    #[test]
    fn handler_errors_cost_the_reply_only() {
        let handler = SharedHandler::new(Arc::new(FailingHandler));
        assert!(produce_reply(&handler, &bundle_with(solicit_bytes())).is_none());
    }

    #[test]
    fn handler_panics_are_contained() {
        let handler = SharedHandler::new(Arc::new(PanickingHandler));
        assert!(produce_reply(&handler, &bundle_with(solicit_bytes())).is_none());
        // The reload lock must not be left held by the unwound call.
        assert_eq!(handler.lock().readers(), 0);
    }

    #[test]
    fn replies_for_the_wrong_link_are_blocked() {
        let handler = SharedHandler::new(Arc::new(AnsweringHandler {
            link_address: "2001:db8::bad".parse().unwrap(),
        }));
        assert!(produce_reply(&handler, &bundle_with(solicit_bytes())).is_none());
    }
}
