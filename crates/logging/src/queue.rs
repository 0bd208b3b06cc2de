//! The bridge from [`tracing`] events into the log queue.

use std::fmt::{self, Write as _};

use crossbeam_channel::Sender;
use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use crate::level::Level;
use crate::record::LogRecord;
use crate::sink::LogSink;
use crate::targets;

/// Messages understood by the aggregator thread. Routing control messages
/// through the same channel as records keeps the output chronological: a
/// handler swap takes effect exactly after the records that preceded it.
#[derive(Debug)]
pub(crate) enum QueueMessage {
    Record(LogRecord),
    Replace(Vec<LogSink>),
    Shutdown,
}

/// A [`tracing_subscriber`] layer that turns every event into a
/// [`LogRecord`] and sends it to the aggregator. Cloning is cheap; all
/// clones feed the same queue.
#[derive(Debug, Clone)]
pub struct QueueLayer {
    sender: Sender<QueueMessage>,
}

impl QueueLayer {
    pub(crate) fn new(sender: Sender<QueueMessage>) -> Self {
        Self { sender }
    }
}

impl<S> Layer<S> for QueueLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord {
            timestamp: OffsetDateTime::now_utc(),
            process_name: std::thread::current().name().unwrap_or("?").to_owned(),
            level: level_for(*metadata.level(), metadata.target()),
            message: visitor.into_message(),
        };

        // The aggregator outlives all producers; a failed send only happens
        // during teardown and the record is not worth crashing over.
        let _ = self.sender.send(QueueMessage::Record(record));
    }
}

/// Maps a tracing level and target onto the six-level scheme. The levels
/// below `debug` have no tracing equivalent and ride on the event target.
fn level_for(level: tracing::Level, target: &str) -> Level {
    match target {
        targets::PACKETS => Level::DebugPackets,
        targets::HANDLING => Level::DebugHandling,
        targets::CRITICAL => Level::Critical,
        _ => match level {
            tracing::Level::ERROR => Level::Error,
            tracing::Level::WARN => Level::Warning,
            tracing::Level::INFO => Level::Info,
            tracing::Level::DEBUG => Level::Debug,
            tracing::Level::TRACE => Level::DebugPackets,
        },
    }
}

/// Collects an event's `message` field plus any structured fields into one
/// message string.
#[derive(Debug, Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn into_message(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }

    fn push_field(&mut self, name: &str, value: fmt::Arguments<'_>) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{name}={value}");
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field.name(), format_args!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_owned();
        } else {
            self.push_field(field.name(), format_args!("{value}"));
        }
    }
}
