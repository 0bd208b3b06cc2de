//! Log handlers: where aggregated records end up.

use std::fs::{File, OpenOptions};
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};

use crate::level::Level;
use crate::record::LogRecord;

/// Configuration for one log handler.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Deserialize, serde::Serialize),
    serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)
)]
pub enum SinkConfig {
    /// Log to stderr, optionally with coloured level names.
    Console {
        /// Handler threshold.
        #[cfg_attr(feature = "serde", serde(default = "default_console_level"))]
        level: Level,
        /// `true`/`false` force colour on or off; absent means "when stderr
        /// is a terminal".
        #[cfg_attr(feature = "serde", serde(default))]
        color: Option<bool>,
    },
    /// Append to a file.
    File {
        /// Path of the log file; relative paths are resolved by the caller
        /// before the handler is opened.
        path: PathBuf,
        /// Handler threshold.
        #[cfg_attr(feature = "serde", serde(default = "default_file_level"))]
        level: Level,
    },
}

#[cfg(feature = "serde")]
fn default_console_level() -> Level {
    Level::Error
}

#[cfg(feature = "serde")]
fn default_file_level() -> Level {
    Level::Info
}

impl SinkConfig {
    /// The configured handler threshold.
    #[must_use]
    pub fn level(&self) -> Level {
        match self {
            SinkConfig::Console { level, .. } | SinkConfig::File { level, .. } => *level,
        }
    }

    /// Opens the handler. Files are created or appended to with the
    /// privileges of the calling thread, which is why the caller opens
    /// handlers instead of the aggregator thread.
    pub fn open(&self) -> io::Result<LogSink> {
        match self {
            SinkConfig::Console { level, color } => Ok(LogSink::Console {
                level: *level,
                color: color.unwrap_or_else(|| io::stderr().is_terminal()),
            }),
            SinkConfig::File { path, level } => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok(LogSink::File {
                    level: *level,
                    path: path.clone(),
                    file,
                })
            }
        }
    }

    /// Returns a copy with the file path resolved against `base` when it is
    /// relative.
    #[must_use]
    pub fn resolved_against(&self, base: &Path) -> SinkConfig {
        match self {
            SinkConfig::File { path, level } if path.is_relative() => SinkConfig::File {
                path: base.join(path),
                level: *level,
            },
            other => other.clone(),
        }
    }
}

/// An opened log handler.
#[derive(Debug)]
pub enum LogSink {
    /// Writes to stderr.
    Console {
        /// Handler threshold.
        level: Level,
        /// Whether to colour the level name.
        color: bool,
    },
    /// Appends to an opened file.
    File {
        /// Handler threshold.
        level: Level,
        /// Where the file lives, for diagnostics.
        path: PathBuf,
        /// The open file handle.
        file: File,
    },
}

impl LogSink {
    /// The handler threshold.
    #[must_use]
    pub fn level(&self) -> Level {
        match self {
            LogSink::Console { level, .. } | LogSink::File { level, .. } => *level,
        }
    }

    /// Writes one record. Output failures are swallowed: a logging problem
    /// must never take the server down, and there is nowhere left to report
    /// it.
    pub fn write_record(&mut self, record: &LogRecord) {
        match self {
            LogSink::Console { color, .. } => {
                let line = if *color {
                    colored_line(record)
                } else {
                    record.format_line()
                };
                let _ = writeln!(io::stderr().lock(), "{line}");
            }
            LogSink::File { file, .. } => {
                let _ = writeln!(file, "{}", record.format_line());
            }
        }
    }
}

fn colored_line(record: &LogRecord) -> String {
    let code = match record.level {
        Level::Critical | Level::Error => "31",
        Level::Warning => "33",
        Level::Info => "32",
        Level::Debug | Level::DebugHandling | Level::DebugPackets => "36",
    };
    let plain = record.format_line();
    let tag = format!("[{}]", record.level);
    plain.replace(&tag, &format!("[\x1b[{code}m{}\x1b[0m]", record.level))
}
