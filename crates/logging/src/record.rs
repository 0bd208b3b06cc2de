//! The unit flowing from producers to the aggregator.

use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

use crate::level::Level;

const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// One log record: timestamp, the name of the thread that produced it (the
/// supervisor or a `Worker-N` thread), a level and the message text.
/// Messages may span multiple lines; they are written as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// When the record was produced.
    pub timestamp: OffsetDateTime,
    /// Producing thread's name.
    pub process_name: String,
    /// Record severity.
    pub level: Level,
    /// The message text.
    pub message: String,
}

impl LogRecord {
    /// Renders the record as a log line (without a trailing newline).
    #[must_use]
    pub fn format_line(&self) -> String {
        let timestamp = self
            .timestamp
            .format(TIMESTAMP_FORMAT)
            .unwrap_or_else(|_| String::from("-"));
        format!(
            "{timestamp} {name}: [{level}] {message}",
            name = self.process_name,
            level = self.level,
            message = self.message
        )
    }
}
