//! Log levels, ordered by verbosity.

use std::fmt;
use std::str::FromStr;

/// The severity levels understood by the server, from least to most
/// verbose. A handler configured at some level accepts every record at that
/// level or above it in severity, so ordering compares verbosity:
/// `Level::Critical < Level::DebugPackets`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Fatal conditions only.
    Critical,
    /// Errors that cost a message or a connection.
    Error,
    /// Unexpected but non-fatal conditions.
    Warning,
    /// Normal operational messages.
    Info,
    /// General debugging.
    Debug,
    /// Message-handling diagnostics.
    DebugHandling,
    /// Per-packet receive/send diagnostics.
    DebugPackets,
}

impl Level {
    /// Whether a record at this level passes a handler configured at
    /// `threshold`.
    #[must_use]
    pub fn passes(self, threshold: Level) -> bool {
        self <= threshold
    }

    /// The level name as it appears in log lines.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Level::Critical => "CRITICAL",
            Level::Error => "ERROR",
            Level::Warning => "WARNING",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::DebugHandling => "HANDLING",
            Level::DebugPackets => "PACKET",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when a level name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLevel(String);

impl fmt::Display for UnknownLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' is not a valid log level", self.0)
    }
}

impl std::error::Error for UnknownLevel {}

impl FromStr for Level {
    type Err = UnknownLevel;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().replace('_', "-").as_str() {
            "critical" => Ok(Level::Critical),
            "error" => Ok(Level::Error),
            "warn" | "warning" => Ok(Level::Warning),
            "info" => Ok(Level::Info),
            "debug" => Ok(Level::Debug),
            "debug-handling" => Ok(Level::DebugHandling),
            "debug-packets" => Ok(Level::DebugPackets),
            _ => Err(UnknownLevel(value.to_owned())),
        }
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Level {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = <String as serde::Deserialize>::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Level {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let canonical = match self {
            Level::Critical => "critical",
            Level::Error => "error",
            Level::Warning => "warning",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::DebugHandling => "debug-handling",
            Level::DebugPackets => "debug-packets",
        };
        serializer.serialize_str(canonical)
    }
}
