#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! The engine of the IPv6 DHCP server: everything between the wire and the
//! pluggable message handler. The crate receives DHCPv6 client and relay
//! traffic over multicast and unicast UDP and over length-framed TCP,
//! normalises every message into a synthetic relay-forward wrapper (the
//! "internal relay" discipline, so handlers never distinguish relayed from
//! direct traffic), dispatches the work to a pool of worker threads without
//! ever blocking the receive loop, and sends validated replies back through
//! the socket they belong to.
//!
//! # Design
//!
//! A single-threaded supervisor ([`run`]) multiplexes readiness over all
//! listeners, the remote-control socket and a self-pipe fed by signal
//! handlers. Workers share one message handler behind a writer-preferring
//! lock (the `rwlock` crate) so SIGHUP can publish a reloaded handler while
//! requests are in flight. Log records from every thread flow through one
//! queue into the supervisor-owned aggregation thread (the `logging`
//! crate), which applies per-handler levels.
//!
//! Overload is handled by admission control: when the worker queue is full
//! the supervisor drops new requests instead of queueing them, because a
//! DHCP client that waited too long has already retransmitted or given up.
//!
//! # Errors
//!
//! No single request can take the server down: parse failures, handler
//! errors and reply-validation failures are logged and cost at most that
//! request's reply. Only the exception budget (too many unexpected errors
//! escaping the loop within a time window) and the termination signals end
//! the process.

pub mod bundle;
pub mod config;
pub mod control;
pub mod handler;
pub mod listeners;
pub mod pool;
pub mod relay;
pub mod worker;

mod ifaces;
mod privileges;
mod run;
mod supervisor;

pub use run::run;

/// The server version reported in the startup banner and on the control
/// socket.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
