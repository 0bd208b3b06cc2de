//! Server configuration: one JSON file, read at startup and re-read on
//! reload. Relative paths in the file are resolved against the directory
//! containing it; the server changes its working directory there before
//! loading.

use std::fmt;
use std::fs;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use logging::SinkConfig;
use nix::unistd::{Gid, Group, Uid, User};
use serde::Deserialize;
use thiserror::Error;

/// Errors that make the configuration unusable. At startup these are
/// fatal; on reload they are logged and the old configuration stays
/// active.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read configuration: {0}")]
    Read(#[from] std::io::Error),

    /// The file is not valid JSON or violates the schema.
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// The server would not listen on anything.
    #[error("this server is not configured to listen on any interfaces")]
    NoListeners,

    /// More than one console log handler.
    #[error("you cannot log to the console multiple times")]
    DuplicateConsoleHandlers,

    /// The configured user does not exist.
    #[error("user {0} does not exist")]
    UnknownUser(String),

    /// The configured group does not exist.
    #[error("group {0} does not exist")]
    UnknownGroup(String),

    /// The user database could not be queried.
    #[error("cannot look up user or group: {0}")]
    Lookup(#[from] nix::errno::Errno),
}

/// An IPv6 prefix in `address/length` notation, used for TCP allow-lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Prefix {
    address: Ipv6Addr,
    length: u8,
}

impl Ipv6Prefix {
    /// Builds a prefix, clamping nothing: lengths above 128 are rejected.
    pub fn new(address: Ipv6Addr, length: u8) -> Result<Self, InvalidPrefix> {
        if length > 128 {
            return Err(InvalidPrefix::Length(length));
        }
        Ok(Self { address, length })
    }

    /// Whether the address falls inside this prefix.
    #[must_use]
    pub fn contains(&self, address: Ipv6Addr) -> bool {
        let mask = if self.length == 0 {
            0
        } else {
            u128::MAX << (128 - u32::from(self.length))
        };
        (u128::from(address) & mask) == (u128::from(self.address) & mask)
    }
}

impl fmt::Display for Ipv6Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.length)
    }
}

/// Why a prefix string was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidPrefix {
    /// Missing `/`, or either part malformed.
    #[error("'{0}' is not a valid IPv6 prefix")]
    Syntax(String),
    /// The prefix length exceeds 128.
    #[error("prefix length {0} is out of range")]
    Length(u8),
}

impl FromStr for Ipv6Prefix {
    type Err = InvalidPrefix;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (address, length) = value
            .split_once('/')
            .ok_or_else(|| InvalidPrefix::Syntax(value.to_owned()))?;
        let address = address
            .parse()
            .map_err(|_| InvalidPrefix::Syntax(value.to_owned()))?;
        let length = length
            .parse()
            .map_err(|_| InvalidPrefix::Syntax(value.to_owned()))?;
        Self::new(address, length)
    }
}

impl<'de> Deserialize<'de> for Ipv6Prefix {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// The top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Login name or numeric uid the server runs as after startup.
    pub user: String,

    /// Group name or numeric gid; the user's primary group when absent.
    #[serde(default)]
    pub group: Option<String>,

    /// Worker pool size; values below 1 are raised to 1.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of the worker task queue. When it is full, new requests
    /// are dropped instead of queueing stale work.
    #[serde(default = "default_task_queue_size")]
    pub task_queue_size: usize,

    /// How many loop exceptions within the window force a shutdown.
    #[serde(default = "default_max_exceptions")]
    pub max_exceptions: usize,

    /// The sliding exception window, in seconds.
    #[serde(default = "default_exception_window")]
    pub exception_window: f64,

    /// Where the remote-control socket lives.
    #[serde(default = "default_control_socket")]
    pub control_socket: PathBuf,

    /// Which message handler answers requests.
    #[serde(default)]
    pub handler: HandlerConfig,

    /// Log handler configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// The network bindings.
    pub listeners: Vec<ListenerConfig>,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(1)
}

fn default_task_queue_size() -> usize {
    64
}

fn default_max_exceptions() -> usize {
    50
}

fn default_exception_window() -> f64 {
    120.0
}

fn default_control_socket() -> PathBuf {
    PathBuf::from("/var/run/ipv6-dhcpd.sock")
}

/// Which message handler to run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum HandlerConfig {
    /// Log every incoming request and never reply.
    #[default]
    DumpRequests,
}

/// The `logging` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LoggingConfig {
    /// The configured handlers; an implicit console handler is added when
    /// empty and verbosity asks for output.
    #[serde(default)]
    pub handlers: Vec<SinkConfig>,
}

/// One network binding.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum ListenerConfig {
    /// Listen for multicast requests on an interface, replying from a
    /// link-local address on it.
    #[serde(rename_all = "kebab-case")]
    MulticastInterface {
        /// The interface to join ff02::1:2 on.
        interface: String,
        /// Link-local source for replies; the interface's first link-local
        /// address when absent. Anything that is not link-local is a
        /// configuration error.
        #[serde(default)]
        reply_from: Option<Ipv6Addr>,
        /// Global unicast address identifying the link; discovered from
        /// the interface when absent.
        #[serde(default)]
        link_address: Option<Ipv6Addr>,
        /// Whether to receive our own multicast transmissions.
        #[serde(default)]
        listen_to_self: bool,
        /// Marks copied onto every bundle from this listener.
        #[serde(default)]
        marks: Vec<String>,
    },

    /// Listen for unicast UDP requests on a global address.
    #[serde(rename_all = "kebab-case")]
    Unicast {
        /// The global unicast address to bind; must exist on some local
        /// interface.
        address: Ipv6Addr,
        /// Marks copied onto every bundle from this listener.
        #[serde(default)]
        marks: Vec<String>,
    },

    /// Listen for TCP connections (bulk leasequery style) on a global
    /// address.
    #[serde(rename_all = "kebab-case")]
    UnicastTcp {
        /// The global unicast address to bind; must exist on some local
        /// interface.
        address: Ipv6Addr,
        /// Cap on concurrently open connections.
        #[serde(default = "default_max_connections")]
        max_connections: usize,
        /// When non-empty, only peers inside one of these prefixes may
        /// connect.
        #[serde(default)]
        allow_from: Vec<Ipv6Prefix>,
        /// Marks copied onto every bundle from this listener.
        #[serde(default)]
        marks: Vec<String>,
    },
}

impl Config {
    /// Reads and validates the configuration file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&text)?;

        if config.listeners.is_empty() {
            return Err(ConfigError::NoListeners);
        }

        let consoles = config
            .logging
            .handlers
            .iter()
            .filter(|handler| matches!(handler, SinkConfig::Console { .. }))
            .count();
        if consoles > 1 {
            return Err(ConfigError::DuplicateConsoleHandlers);
        }

        config.workers = config.workers.max(1);
        config.task_queue_size = config.task_queue_size.max(1);

        Ok(config)
    }

    /// Resolves the configured user and group against the system
    /// databases. Accepts names or numeric ids; the group defaults to the
    /// user's primary group.
    pub fn resolve_user_and_group(&self) -> Result<(User, Group), ConfigError> {
        let user = match self.user.parse::<u32>() {
            Ok(uid) => User::from_uid(Uid::from_raw(uid))?,
            Err(_) => User::from_name(&self.user)?,
        }
        .ok_or_else(|| ConfigError::UnknownUser(self.user.clone()))?;

        let group = match &self.group {
            Some(name) => match name.parse::<u32>() {
                Ok(gid) => Group::from_gid(Gid::from_raw(gid))?,
                Err(_) => Group::from_name(name)?,
            }
            .ok_or_else(|| ConfigError::UnknownGroup(name.clone()))?,
            None => Group::from_gid(user.gid)?
                .ok_or_else(|| ConfigError::UnknownGroup(user.gid.to_string()))?,
        };

        Ok((user, group))
    }

    /// The log handler configs with relative file paths resolved against
    /// `base`.
    #[must_use]
    pub fn log_sinks(&self, base: &Path) -> Vec<SinkConfig> {
        self.logging
            .handlers
            .iter()
            .map(|handler| handler.resolved_against(base))
            .collect()
    }
}

fn default_max_connections() -> usize {
    10
}
