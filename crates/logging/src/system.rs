//! The aggregator thread and its handle.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing_subscriber::layer::SubscriberExt;

use crate::level::Level;
use crate::queue::{QueueLayer, QueueMessage};
use crate::sink::{LogSink, SinkConfig};
use crate::verbosity::console_level;

/// Handle to the queue-based logging pipeline: the producer side (a
/// [`QueueLayer`] to install as the `tracing` subscriber) and the single
/// consumer thread that drains records into the configured handlers.
#[derive(Debug)]
pub struct LogSystem {
    sender: Sender<QueueMessage>,
    layer: QueueLayer,
    thread: Option<JoinHandle<()>>,
}

impl LogSystem {
    /// Starts the aggregator with a console handler floored by the given
    /// command-line verbosity, so early diagnostics are visible before the
    /// configuration has been read.
    #[must_use]
    pub fn start(verbosity: u8) -> Self {
        let console = SinkConfig::Console {
            level: console_level(Level::Error, verbosity),
            color: None,
        };
        // Opening a console handler cannot fail.
        let sinks = match console.open() {
            Ok(sink) => vec![sink],
            Err(_) => Vec::new(),
        };

        let (sender, receiver) = unbounded();
        let thread = thread::Builder::new()
            .name("logging".to_owned())
            .spawn(move || aggregate(&receiver, sinks))
            .expect("failed to spawn the logging thread");

        Self {
            layer: QueueLayer::new(sender.clone()),
            sender,
            thread: Some(thread),
        }
    }

    /// The layer feeding this system, for subscriber composition.
    #[must_use]
    pub fn layer(&self) -> QueueLayer {
        self.layer.clone()
    }

    /// Installs this system as the process-wide `tracing` subscriber. Has
    /// no effect if a global subscriber is already installed.
    pub fn install_global(&self) {
        let subscriber = tracing_subscriber::registry().with(self.layer());
        let _ = tracing::subscriber::set_global_default(subscriber);
    }

    /// Replaces the handler set. Records queued before this call still go
    /// to the old handlers; records sent afterwards go to the new ones.
    pub fn replace_sinks(&self, sinks: Vec<LogSink>) {
        let _ = self.sender.send(QueueMessage::Replace(sinks));
    }

    /// Stops the aggregator after draining every record queued so far.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.sender.send(QueueMessage::Shutdown);
            let _ = thread.join();
        }
    }
}

impl Drop for LogSystem {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The consumer loop: offer every record to every handler and let each
/// handler filter against its own level.
fn aggregate(receiver: &Receiver<QueueMessage>, mut sinks: Vec<LogSink>) {
    for message in receiver {
        match message {
            QueueMessage::Record(record) => {
                for sink in &mut sinks {
                    if record.level.passes(sink.level()) {
                        sink.write_record(&record);
                    }
                }
            }
            QueueMessage::Replace(new_sinks) => sinks = new_sinks,
            QueueMessage::Shutdown => break,
        }
    }
}
