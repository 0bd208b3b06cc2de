#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! Logging plumbing for the DHCPv6 server: a six-level severity scheme with
//! packet- and handling-level diagnostics below `debug`, the cumulative
//! `-v` verbosity mapping, and a queue-based aggregation pipeline. Worker
//! threads never write to handlers themselves; every [`tracing`] event is
//! converted into a [`LogRecord`] by the [`QueueLayer`] and sent over a
//! multi-producer channel to a single aggregator thread owned by the
//! supervisor. The aggregator applies **per-handler** levels: a record is
//! offered to every configured handler and each handler filters it against
//! its own threshold.
//!
//! # Design
//!
//! [`LogSystem::start`] spawns the aggregator with a console handler floored
//! by the command-line verbosity, so diagnostics are visible before the
//! configuration file has been read. Once the configuration is known the
//! caller opens the configured handlers (while running with the target
//! user's privileges, so file ownership comes out right) and swaps them in
//! with [`LogSystem::replace_sinks`]. Shutdown drains the queue before the
//! thread exits, so records sent before the call are never lost.
//!
//! Packet-level and handling-level records use the [`targets`] constants:
//! `tracing` has no levels below `TRACE`, so the extra levels ride on the
//! event target instead.

pub mod level;
pub mod record;
pub mod sink;
pub mod verbosity;

mod queue;
mod system;

pub use level::Level;
pub use queue::QueueLayer;
pub use record::LogRecord;
pub use sink::{LogSink, SinkConfig};
pub use system::LogSystem;
pub use verbosity::{console_level, verbosity_floor};

/// Event targets carrying the levels below `debug`.
pub mod targets {
    /// Per-packet receive/send diagnostics (level `debug-packets`).
    pub const PACKETS: &str = "packets";
    /// Message-handling diagnostics (level `debug-handling`).
    pub const HANDLING: &str = "handling";
    /// Fatal diagnostics that must be visible even at verbosity 0.
    pub const CRITICAL: &str = "critical";
}
