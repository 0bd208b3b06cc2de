//! The message handler interface and the machinery that lets the handler
//! be replaced while requests are in flight.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use protocol::RelayMessage;
use thiserror::Error;
use tracing::trace;

use crate::bundle::IncomingPacketBundle;
use crate::config::{Config, ConfigError, HandlerConfig};

/// An error escaping a handler. Handler errors cost the request its reply
/// but never the server its life.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Turns one wrapped incoming message into one wrapped reply, or decides
/// to stay silent.
///
/// The incoming message is always a relay-forward wrapper, even for
/// messages received directly from clients: the server acts as an internal
/// relay so handlers never need to distinguish relayed from direct
/// traffic. Implementations must be thread-safe; every worker calls the
/// same instance.
pub trait MessageHandler: Send + Sync {
    /// Per-worker startup hook, run once in each worker thread before it
    /// starts serving jobs.
    fn worker_init(&self) {}

    /// Handles one request. Returning `Ok(None)` drops the request
    /// silently; returning a message sends it through the originating
    /// listener's replier after wrapper validation.
    fn handle(
        &self,
        wrapped: &RelayMessage,
        bundle: &IncomingPacketBundle,
    ) -> Result<Option<RelayMessage>, HandlerError>;
}

/// A handler that logs every incoming request and never answers. Useful
/// for watching what arrives on a link without running a real server.
#[derive(Debug, Default)]
pub struct DumpRequestsHandler;

impl MessageHandler for DumpRequestsHandler {
    fn handle(
        &self,
        wrapped: &RelayMessage,
        bundle: &IncomingPacketBundle,
    ) -> Result<Option<RelayMessage>, HandlerError> {
        let received_using = if bundle.received_over_multicast {
            "multicast"
        } else {
            "unicast"
        };
        trace!(
            target: "handling",
            "{message_id}: Received {received_using} message {wrapped:?}",
            message_id = bundle.message_id,
        );
        Ok(None)
    }
}

/// Builds the handler selected by the configuration.
pub fn build_handler(config: &Config) -> Result<Arc<dyn MessageHandler>, ConfigError> {
    match config.handler {
        HandlerConfig::DumpRequests => Ok(Arc::new(DumpRequestsHandler)),
    }
}

/// The current handler behind a writer-preferring lock, so a reload can
/// publish a new handler without a request ever observing a half-updated
/// one: in-flight `handle` calls hold the read side, the reload takes the
/// write side and waits for them to finish.
pub struct SharedHandler {
    lock: rwlock::RwLock,
    current: Mutex<Arc<dyn MessageHandler>>,
}

impl fmt::Debug for SharedHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedHandler")
            .field("readers", &self.lock.readers())
            .field("writers", &self.lock.writers())
            .finish_non_exhaustive()
    }
}

impl SharedHandler {
    /// Wraps the initial handler.
    #[must_use]
    pub fn new(handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            lock: rwlock::RwLock::new(),
            current: Mutex::new(handler),
        }
    }

    fn current(&self) -> Arc<dyn MessageHandler> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs the per-worker startup hook of the current handler.
    pub fn worker_init(&self) {
        let _read = self.lock.read();
        self.current().worker_init();
    }

    /// Handles one request under the read lock.
    pub fn handle(
        &self,
        wrapped: &RelayMessage,
        bundle: &IncomingPacketBundle,
    ) -> Result<Option<RelayMessage>, HandlerError> {
        let _read = self.lock.read();
        self.current().handle(wrapped, bundle)
    }

    /// Publishes a new handler, waiting for in-flight requests to finish
    /// first. Requests arriving while the writer waits queue behind it.
    pub fn replace(&self, handler: Arc<dyn MessageHandler>) {
        let _write = self.lock.write();
        *self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = handler;
    }

    /// The reload lock, exposed for observability.
    #[must_use]
    pub fn lock(&self) -> &rwlock::RwLock {
        &self.lock
    }
}
