//! Process startup: argument handling, the privilege choreography and the
//! wiring of logging, listeners, control socket, handler and worker pool
//! into a running supervisor.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Arg, ArgAction, Command};
use logging::LogSystem;
use tracing::{error, info};

use crate::VERSION;
use crate::config::Config;
use crate::control::ControlServer;
use crate::handler::{self, SharedHandler};
use crate::listeners::factory;
use crate::pool::WorkerPool;
use crate::privileges;
use crate::supervisor::{SignalState, Supervisor, open_log_sinks};

struct Args {
    config: PathBuf,
    verbosity: u8,
}

fn build_command() -> Command {
    Command::new("ipv6-dhcpd")
        .about("A flexible IPv6 DHCP server")
        .arg(
            Arg::new("config")
                .required(true)
                .value_name("CONFIG")
                .help("the configuration file"),
        )
        .arg(
            Arg::new("verbosity")
                .short('v')
                .long("verbosity")
                .action(ArgAction::Count)
                .help("increase output verbosity"),
        )
}

fn handle_args<I>(args: I) -> Result<Args, clap::Error>
where
    I: IntoIterator<Item = OsString>,
{
    let matches = build_command().try_get_matches_from(args)?;
    Ok(Args {
        config: PathBuf::from(
            matches
                .get_one::<String>("config")
                .expect("the config argument is required"),
        ),
        verbosity: matches.get_count("verbosity"),
    })
}

/// The `ipv6-dhcpd` entry point. Returns the process exit code: 0 on a
/// clean shutdown, 1 on a configuration error or fatal startup failure.
pub fn run<I>(args: I) -> i32
where
    I: IntoIterator<Item = OsString>,
{
    let args = match handle_args(args) {
        Ok(args) => args,
        Err(error) => {
            let _ = error.print();
            return error.exit_code();
        }
    };

    // Logging runs from the first moment; the configured handlers replace
    // the verbosity-floored console once the configuration is known.
    let log_system = LogSystem::start(args.verbosity);
    log_system.install_global();

    let code = match serve(&args, &log_system) {
        Ok(()) => 0,
        Err(message) => {
            error!(target: "critical", "{message}");
            1
        }
    };

    log_system.shutdown();
    code
}

fn serve(args: &Args, log_system: &LogSystem) -> Result<(), String> {
    // Everything relative in the configuration resolves against the
    // directory holding the configuration file.
    let config_path = std::fs::canonicalize(&args.config).map_err(|error| {
        format!(
            "Cannot find configuration file {path}: {error}",
            path = args.config.display(),
        )
    })?;
    let config_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| String::from("Configuration file has no parent directory"))?;
    env::set_current_dir(&config_dir)
        .map_err(|error| format!("Cannot change to the configuration directory: {error}"))?;

    let config =
        Config::load(&config_path).map_err(|error| format!("Configuration error: {error}"))?;
    let (user, group) = config
        .resolve_user_and_group()
        .map_err(|error| format!("Configuration error: {error}"))?;

    // Drop privileges in a non-permanent way first so log files are
    // created with the correct owner.
    privileges::drop_privileges(&user, &group, false)
        .map_err(|error| format!("Cannot drop privileges: {error}"))?;

    let sinks = open_log_sinks(&config, &config_dir, args.verbosity)
        .map_err(|error| format!("Cannot open log handlers: {error}"))?;
    log_system.replace_sinks(sinks);

    info!("Starting IPv6 DHCP server v{VERSION}");

    // Restore root while opening sockets: privileged ports and multicast
    // group memberships need it.
    privileges::restore_privileges()
        .map_err(|error| format!("Cannot restore privileges: {error}"))?;

    let mut listeners = Vec::new();
    for listener_config in &config.listeners {
        listeners.push(
            factory::create_listener(listener_config, &[])
                .map_err(|error| format!("Cannot create listener: {error}"))?,
        );
    }

    let control_socket = if config.control_socket.is_relative() {
        config_dir.join(&config.control_socket)
    } else {
        config.control_socket.clone()
    };
    let control = ControlServer::bind(&control_socket).map_err(|error| {
        format!(
            "Cannot create control socket {path}: {error}",
            path = control_socket.display(),
        )
    })?;

    // And drop privileges again, this time permanently.
    privileges::drop_privileges(&user, &group, true)
        .map_err(|error| format!("Cannot drop privileges: {error}"))?;

    let handler = Arc::new(SharedHandler::new(
        handler::build_handler(&config)
            .map_err(|error| format!("Cannot create message handler: {error}"))?,
    ));

    let signals = SignalState::install()
        .map_err(|error| format!("Cannot install signal handlers: {error}"))?;

    let workers = config.workers;
    let task_queue_size = config.task_queue_size;
    let pool = WorkerPool::start(workers, task_queue_size, Arc::clone(&handler))
        .map_err(|error| format!("Cannot start worker pool: {error}"))?;

    Supervisor::new(
        config_path,
        config_dir,
        args.verbosity,
        config,
        log_system,
        listeners,
        control,
        handler,
        pool,
        signals,
    )
    .run();

    Ok(())
}
