//! The supervisor: a single-threaded readiness-driven loop multiplexing
//! all listeners, the control socket and a self-pipe fed by signal
//! handlers. Ready listeners produce bundles that are dispatched to the
//! worker pool without blocking; errors are counted against a sliding
//! exception budget that turns a burst of unexpected failures into an
//! orderly shutdown.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use logging::{Level, LogSink, LogSystem, SinkConfig, console_level};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use tracing::{debug, error, info, warn};

use crate::VERSION;
use crate::bundle::IncomingPacketBundle;
use crate::config::Config;
use crate::control::{ControlAction, ControlConnection, ControlServer};
use crate::handler::{self, SharedHandler};
use crate::listeners::{RecvError, Replier, ServerListener, TcpConnection, factory};
use crate::pool::{DispatchError, WorkerPool};
use crate::worker::Job;

/// Signal-to-pipe forwarding plus the flags telling the supervisor what
/// the signal meant. The pipe makes signal arrival visible to `poll`; the
/// flags carry the meaning.
#[derive(Debug)]
pub(crate) struct SignalState {
    pipe_read: File,
    _pipe_write: OwnedFd,
    terminate: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
    info: Arc<AtomicBool>,
}

impl SignalState {
    /// Creates the self-pipe and installs handlers for SIGINT, SIGTERM,
    /// SIGHUP and SIGUSR1 (plus SIGINFO where the platform has it).
    pub(crate) fn install() -> io::Result<Self> {
        let (pipe_read, pipe_write) =
            nix::unistd::pipe2(OFlag::O_NONBLOCK).map_err(io::Error::from)?;

        let mut signals = vec![SIGHUP, SIGINT, SIGTERM, SIGUSR1];
        #[cfg(any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        signals.push(libc::SIGINFO);

        for signal in &signals {
            signal_hook::low_level::pipe::register_raw(*signal, pipe_write.as_raw_fd())?;
        }

        let terminate = Arc::new(AtomicBool::new(false));
        let reload = Arc::new(AtomicBool::new(false));
        let info = Arc::new(AtomicBool::new(false));

        signal_hook::flag::register(SIGINT, Arc::clone(&terminate))?;
        signal_hook::flag::register(SIGTERM, Arc::clone(&terminate))?;
        signal_hook::flag::register(SIGHUP, Arc::clone(&reload))?;
        signal_hook::flag::register(SIGUSR1, Arc::clone(&info))?;
        #[cfg(any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        signal_hook::flag::register(libc::SIGINFO, Arc::clone(&info))?;

        Ok(Self {
            pipe_read: File::from(pipe_read),
            _pipe_write: pipe_write,
            terminate,
            reload,
            info,
        })
    }

    fn drain(&mut self) {
        let mut buffer = [0u8; 64];
        while matches!(self.pipe_read.read(&mut buffer), Ok(received) if received > 0) {}
    }
}

/// The sliding-window rate limit that converts a burst of unexpected
/// errors into an orderly shutdown.
#[derive(Debug)]
struct ExceptionBudget {
    history: VecDeque<Instant>,
    max_exceptions: usize,
    window: Duration,
}

impl ExceptionBudget {
    fn new(max_exceptions: usize, window: Duration) -> Self {
        Self {
            history: VecDeque::new(),
            max_exceptions,
            window,
        }
    }

    /// Records one exception at `now`; returns whether the budget is now
    /// exhausted.
    fn record(&mut self, now: Instant) -> bool {
        self.history.push_back(now);

        while let Some(oldest) = self.history.front() {
            if now.duration_since(*oldest) > self.window {
                self.history.pop_front();
            } else {
                break;
            }
        }

        self.history.len() > self.max_exceptions
    }
}

/// Which multiplexed descriptor became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Signal,
    Listener(usize),
    Connection(u64),
    Control,
    ControlConnection(u64),
}

/// What a ready listener produced.
enum ListenerEvent {
    Packet(Result<(IncomingPacketBundle, Replier), RecvError>),
    NewConnection(Option<TcpConnection>),
}

/// The supervisor state for one server run.
pub(crate) struct Supervisor<'a> {
    config_path: PathBuf,
    config_dir: PathBuf,
    verbosity: u8,
    config: Config,
    log_system: &'a LogSystem,
    listeners: Vec<ServerListener>,
    control: ControlServer,
    handler: Arc<SharedHandler>,
    pool: Option<WorkerPool>,
    signals: SignalState,
    connections: Vec<(u64, TcpConnection)>,
    control_connections: Vec<(u64, ControlConnection)>,
    next_id: u64,
    stopping: bool,
    message_count: u64,
    budget: ExceptionBudget,
    /// Bumped whenever the listener set is replaced, so readiness results
    /// collected before a reload are not applied to the new set.
    generation: u64,
}

impl<'a> Supervisor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config_path: PathBuf,
        config_dir: PathBuf,
        verbosity: u8,
        config: Config,
        log_system: &'a LogSystem,
        listeners: Vec<ServerListener>,
        control: ControlServer,
        handler: Arc<SharedHandler>,
        pool: WorkerPool,
        signals: SignalState,
    ) -> Self {
        let budget = ExceptionBudget::new(
            config.max_exceptions,
            Duration::from_secs_f64(config.exception_window),
        );
        Self {
            config_path,
            config_dir,
            verbosity,
            config,
            log_system,
            listeners,
            control,
            handler,
            pool: Some(pool),
            signals,
            connections: Vec::new(),
            control_connections: Vec::new(),
            next_id: 0,
            stopping: false,
            message_count: 0,
            budget,
            generation: 0,
        }
    }

    /// Runs the main loop until a termination request or an exhausted
    /// exception budget stops it, then shuts the pool down.
    pub(crate) fn run(&mut self) {
        info!("IPv6 DHCP server is ready to handle requests");

        while !self.stopping {
            if let Err(error) = self.iterate() {
                self.count_exception(&error);
            }
        }

        if let Some(pool) = self.pool.take() {
            pool.close();
        }

        info!("Shutting down IPv6 DHCP server v{VERSION}");
    }

    fn iterate(&mut self) -> io::Result<()> {
        let generation = self.generation;
        let ready = self.wait_for_readiness()?;

        for source in ready {
            match source {
                Source::Signal => {
                    self.handle_signals();
                    // A signal may have replaced the listener set or asked
                    // for a stop; start a fresh iteration either way. The
                    // other ready descriptors stay ready and are picked up
                    // by the next poll.
                    return Ok(());
                }
                Source::Listener(index) => self.handle_listener_ready(index)?,
                Source::Connection(id) => self.handle_connection_ready(id)?,
                Source::Control => {
                    if let Some(connection) = self.control.accept_connection() {
                        let id = self.claim_id();
                        self.control_connections.push((id, connection));
                    }
                }
                Source::ControlConnection(id) => self.handle_control_ready(id),
            }

            // A control command may have reloaded the listeners; the
            // remaining readiness results refer to the old set.
            if self.stopping || self.generation != generation {
                break;
            }
        }

        Ok(())
    }

    fn claim_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn wait_for_readiness(&self) -> io::Result<Vec<Source>> {
        let mut sources = Vec::new();
        let mut fds: Vec<PollFd<'_>> = Vec::new();

        sources.push(Source::Signal);
        fds.push(PollFd::new(self.signals.pipe_read.as_fd(), PollFlags::POLLIN));

        for (index, listener) in self.listeners.iter().enumerate() {
            let fd = match listener {
                ServerListener::Udp(listener) => listener.listen_socket().as_fd(),
                ServerListener::TcpAcceptor(listener) => listener.listen_socket().as_fd(),
            };
            sources.push(Source::Listener(index));
            fds.push(PollFd::new(fd, PollFlags::POLLIN));
        }

        for (id, connection) in &self.connections {
            sources.push(Source::Connection(*id));
            fds.push(PollFd::new(connection.stream().as_fd(), PollFlags::POLLIN));
        }

        sources.push(Source::Control);
        fds.push(PollFd::new(self.control.listener().as_fd(), PollFlags::POLLIN));

        for (id, connection) in &self.control_connections {
            sources.push(Source::ControlConnection(*id));
            fds.push(PollFd::new(connection.stream().as_fd(), PollFlags::POLLIN));
        }

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(errno) => return Err(io::Error::from(errno)),
        }

        Ok(fds
            .iter()
            .zip(&sources)
            .filter(|(fd, _)| fd.revents().is_some_and(|revents| !revents.is_empty()))
            .map(|(_, source)| *source)
            .collect())
    }

    fn handle_signals(&mut self) {
        self.signals.drain();

        if self.signals.info.swap(false, Ordering::SeqCst) {
            info!(
                "Server has processed {count} messages",
                count = self.message_count,
            );
        }

        if self.signals.reload.swap(false, Ordering::SeqCst) {
            self.reload();
        }

        if self.signals.terminate.swap(false, Ordering::SeqCst) {
            debug!("Received termination request");
            self.stopping = true;
        }
    }

    fn handle_listener_ready(&mut self, index: usize) -> io::Result<()> {
        let Some(listener) = self.listeners.get_mut(index) else {
            return Ok(());
        };

        let event = match listener {
            ServerListener::Udp(listener) => ListenerEvent::Packet(listener.recv_request()),
            ServerListener::TcpAcceptor(listener) => {
                ListenerEvent::NewConnection(listener.accept_connection())
            }
        };

        match event {
            ListenerEvent::Packet(Ok((bundle, replier))) => {
                self.dispatch(bundle, replier);
                Ok(())
            }
            ListenerEvent::Packet(Err(RecvError::Ignore | RecvError::Incomplete)) => Ok(()),
            // UDP listeners do not close; map it like an I/O error so it
            // counts against the budget if it ever happens.
            ListenerEvent::Packet(Err(RecvError::Closed)) => {
                Err(io::Error::other("listener closed unexpectedly"))
            }
            // Spurious wakeups are not worth an exception.
            ListenerEvent::Packet(Err(RecvError::Io(error)))
                if error.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(())
            }
            ListenerEvent::Packet(Err(RecvError::Io(error))) => Err(error),
            ListenerEvent::NewConnection(Some(connection)) => {
                let id = self.claim_id();
                self.connections.push((id, connection));
                Ok(())
            }
            ListenerEvent::NewConnection(None) => Ok(()),
        }
    }

    fn handle_connection_ready(&mut self, id: u64) -> io::Result<()> {
        let Some(position) = self
            .connections
            .iter()
            .position(|(connection_id, _)| *connection_id == id)
        else {
            return Ok(());
        };

        match self.connections[position].1.recv_request() {
            Ok((bundle, replier)) => {
                self.dispatch(bundle, replier);
                Ok(())
            }
            Err(RecvError::Ignore | RecvError::Incomplete) => Ok(()),
            Err(RecvError::Closed) => {
                self.connections.remove(position);
                Ok(())
            }
            Err(RecvError::Io(error)) => {
                self.connections.remove(position);
                Err(error)
            }
        }
    }

    fn handle_control_ready(&mut self, id: u64) {
        let Some(position) = self
            .control_connections
            .iter()
            .position(|(connection_id, _)| *connection_id == id)
        else {
            return;
        };

        let message_count = self.message_count;
        let (actions, closed) = {
            let connection = &mut self.control_connections[position].1;
            let actions = connection.handle_ready(message_count);
            (actions, connection.is_closed())
        };

        if closed {
            self.control_connections.remove(position);
        }

        for action in actions {
            match action {
                ControlAction::Reload => self.reload(),
                ControlAction::Shutdown => {
                    debug!("Received shutdown request over the control socket");
                    self.stopping = true;
                }
            }
        }
    }

    fn dispatch(&mut self, bundle: IncomingPacketBundle, replier: Replier) {
        self.message_count += 1;
        let message_id = bundle.message_id;

        let Some(pool) = &self.pool else {
            error!("{message_id}: Worker pool is not running, dropping request");
            return;
        };

        match pool.try_dispatch(Job { bundle, replier }) {
            Ok(()) => {}
            Err(DispatchError::QueueFull) => {
                warn!("{message_id}: Worker pool queue is full, dropping request");
            }
            Err(DispatchError::Closed) => {
                error!("{message_id}: Worker pool is not running, dropping request");
            }
        }
    }

    /// Re-reads the configuration and applies it: log handlers are
    /// replaced, listeners are rebuilt (recycling sockets where the
    /// binding is unchanged; new privileged binds fail and are skipped
    /// with a critical log), and the new handler is published under the
    /// write lock once in-flight requests have finished.
    fn reload(&mut self) {
        info!(
            "Reloading configuration from {path}",
            path = self.config_path.display(),
        );

        let new_config = match Config::load(&self.config_path) {
            Ok(config) => config,
            Err(error) => {
                error!(target: "critical", "Configuration error: {error}");
                return;
            }
        };

        match open_log_sinks(&new_config, &self.config_dir, self.verbosity) {
            Ok(sinks) => self.log_system.replace_sinks(sinks),
            Err(error) => {
                error!(target: "critical", "Cannot open log handlers, keeping the old ones: {error}");
            }
        }

        let mut new_listeners = Vec::new();
        for listener_config in &new_config.listeners {
            match factory::create_listener(listener_config, &self.listeners) {
                Ok(listener) => new_listeners.push(listener),
                Err(error) => {
                    error!(target: "critical", "Cannot create listener: {error}");
                }
            }
        }
        if new_listeners.is_empty() {
            error!(target: "critical", "No listeners could be created, keeping the old ones");
        } else {
            self.listeners = new_listeners;
            self.generation += 1;
        }

        match handler::build_handler(&new_config) {
            Ok(new_handler) => self.handler.replace(new_handler),
            Err(error) => {
                error!(target: "critical", "Cannot create message handler: {error}");
            }
        }

        self.budget.max_exceptions = new_config.max_exceptions;
        self.budget.window = Duration::from_secs_f64(new_config.exception_window);
        self.config = new_config;
    }

    /// Logs an escaped error and stops the server when more than
    /// `max-exceptions` of them happened within the window.
    fn count_exception(&mut self, error: &io::Error) {
        error!("Caught unexpected exception {error:?}");

        if self.budget.record(Instant::now()) {
            error!(
                target: "critical",
                "Received more than {max} exceptions in {window} seconds, exiting",
                max = self.config.max_exceptions,
                window = self.config.exception_window,
            );
            self.stopping = true;
        }
    }
}

/// Opens the configured log handlers, flooring the console handler by the
/// command-line verbosity and adding one when the configuration has none.
pub(crate) fn open_log_sinks(
    config: &Config,
    config_dir: &Path,
    verbosity: u8,
) -> io::Result<Vec<LogSink>> {
    let mut sinks = Vec::new();
    let mut have_console = false;

    for sink_config in config.log_sinks(config_dir) {
        let sink_config = match sink_config {
            SinkConfig::Console { level, color } => {
                have_console = true;
                SinkConfig::Console {
                    level: console_level(level, verbosity),
                    color,
                }
            }
            other => other,
        };
        sinks.push(sink_config.open()?);
    }

    if !have_console {
        sinks.push(
            SinkConfig::Console {
                level: console_level(Level::Error, verbosity),
                color: None,
            }
            .open()?,
        );
    }

    Ok(sinks)
}
