use crate::cli::Endpoint;
use crate::copy::{copy_fd_while, CopyControl, CopyError, IoCounters};
use crate::guard::{Semaphore, SemaphoreReleaser, SocketCloser};
use crate::net::{self, DialError, ListenerSet, NetConfigError};
use log::{debug, error, info, warn};
use std::io;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Compile-time ceiling on `-max_clients`.
pub const MAX_SESSIONS_LIMIT: usize = 256;
/// Compile-time ceiling on `-max_cip`.
pub const MAX_DIALS_LIMIT: usize = 64;
/// Per-session ring capacity for the concurrent relay.
pub const SESSION_BUFFER_CAPACITY: usize = 4 * 1024;
/// Engine readiness-wait bound inside a session; also the worst-case extra
/// cancellation latency.
pub const RELAY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Immutable relay configuration, built once from the command line.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Cap on concurrent sessions.
    pub max_sessions: usize,
    /// Cap on concurrent in-progress outbound dials.
    pub max_dials: usize,
    /// Per-session idle timeout: a session with no progress for this long
    /// is cancelled. `None` is unbounded.
    pub io_timeout: Option<Duration>,
    /// Bound on each outbound dial.
    pub connect_timeout: Option<Duration>,
    /// Ring capacity handed to each copy engine.
    pub buffer_capacity: usize,
    /// listen(2) backlog for every bound port.
    pub listen_backlog: i32,
}

impl RelayConfig {
    /// # Panics
    ///
    /// Panics if either cap is zero or above its compile-time ceiling.
    pub fn new(max_sessions: usize, max_dials: usize, io_timeout: Option<Duration>) -> Self {
        assert!(
            max_sessions >= 1 && max_sessions <= MAX_SESSIONS_LIMIT,
            "max_sessions must be between 1 and {MAX_SESSIONS_LIMIT}"
        );
        assert!(
            max_dials >= 1 && max_dials <= MAX_DIALS_LIMIT,
            "max_dials must be between 1 and {MAX_DIALS_LIMIT}"
        );
        Self {
            max_sessions,
            max_dials,
            io_timeout,
            connect_timeout: io_timeout.or(Some(net::DEFAULT_DIAL_TIMEOUT)),
            buffer_capacity: SESSION_BUFFER_CAPACITY,
            listen_backlog: 10,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new(32, 10, None)
    }
}

/// Failures that abort the whole relay, not just one session.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] NetConfigError),
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("cannot ignore broken-pipe signal: {0}")]
    Signal(#[source] io::Error),
    #[error("cannot spawn session worker: {0}")]
    Spawn(#[source] io::Error),
}

impl SupervisorError {
    /// The errno to exit with, when one is attached.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Config(err) => match err {
                NetConfigError::Socket { source, .. }
                | NetConfigError::Bind { source, .. }
                | NetConfigError::Listen { source, .. }
                | NetConfigError::Resolve { source, .. } => source.raw_os_error(),
                NetConfigError::NoAddresses { .. } => None,
            },
            Self::Accept(source) | Self::Signal(source) | Self::Spawn(source) => {
                source.raw_os_error()
            }
        }
    }
}

/// One live end of a session: an owned socket behind its closer, or the
/// process's standard streams.
#[derive(Debug)]
pub enum SessionEnd {
    Socket(SocketCloser),
    Stdio,
}

/// Per-direction results of one finished session. Populated only after
/// both copy-engine threads have been joined.
#[derive(Debug)]
pub struct SessionOutcome {
    /// First endpoint read, second endpoint written.
    pub forward: Result<IoCounters, CopyError>,
    /// Second endpoint read, first endpoint written.
    pub reverse: Result<IoCounters, CopyError>,
}

/// What the accept phase hands to a session worker. Dial and stdio ends
/// are materialized by the worker itself.
#[derive(Debug)]
enum WorkerEnd {
    Accepted(SocketCloser),
    Dial { host: String, port: u16 },
    Stdio,
}

/// The concurrent relay's outer control loop: accepts clients, enforces
/// the session and dial caps, and spawns one worker per session.
pub struct Supervisor {
    config: RelayConfig,
    sessions: Arc<Semaphore>,
    dials: Arc<Semaphore>,
    serial: AtomicU64,
}

impl Supervisor {
    pub fn new(config: RelayConfig) -> Self {
        let sessions = Arc::new(Semaphore::new(config.max_sessions));
        let dials = Arc::new(Semaphore::new(config.max_dials));
        Self {
            config,
            sessions,
            dials,
            serial: AtomicU64::new(0),
        }
    }

    /// Runs the relay between `first` and `second`.
    ///
    /// Repeats for ever while at least one endpoint listens; otherwise a
    /// single session runs to completion on the calling thread. Returns
    /// only on a fatal setup or accept failure.
    pub fn run(&self, first: &Endpoint, second: &Endpoint) -> Result<(), SupervisorError> {
        net::ignore_sigpipe().map_err(SupervisorError::Signal)?;

        // Surface dead hostnames before the first client is accepted.
        for endpoint in [first, second] {
            if let Endpoint::Dial { host, port } = endpoint {
                net::resolve_host(host, *port)?;
                debug!("resolved {host}");
            }
        }

        let mut first_set = self.listener_for(first)?;
        let mut second_set = self.listener_for(second)?;
        let repeating = first_set.is_some() || second_set.is_some();

        loop {
            let seat = SemaphoreReleaser::acquire(&self.sessions);
            let (from_first, from_second) =
                accept_pair(first_set.as_mut(), second_set.as_mut())
                    .map_err(SupervisorError::Accept)?;
            let serial = self.serial.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("#{serial}: session starting");

            let end_a = worker_end(first, from_first);
            let end_b = worker_end(second, from_second);
            if repeating {
                let dials = Arc::clone(&self.dials);
                let config = self.config.clone();
                thread::Builder::new()
                    .name(format!("session-{serial}"))
                    .spawn(move || session_worker(serial, seat, end_a, end_b, &dials, &config))
                    .map_err(SupervisorError::Spawn)?;
            } else {
                session_worker(serial, seat, end_a, end_b, &self.dials, &self.config);
                return Ok(());
            }
        }
    }

    fn listener_for(&self, endpoint: &Endpoint) -> Result<Option<ListenerSet>, NetConfigError> {
        match endpoint {
            Endpoint::Listen { host, ports } => Ok(Some(ListenerSet::bind(
                *host,
                ports,
                self.config.listen_backlog,
            )?)),
            Endpoint::Dial { .. } | Endpoint::Stdio => Ok(None),
        }
    }
}

/// Accepts from whichever endpoints listen. With two listener sets the
/// accepts run on two threads and both are joined before proceeding, so
/// neither port set can starve the other.
fn accept_pair(
    first: Option<&mut ListenerSet>,
    second: Option<&mut ListenerSet>,
) -> io::Result<(Option<(u16, TcpStream)>, Option<(u16, TcpStream)>)> {
    match (first, second) {
        (Some(set_a), Some(set_b)) => thread::scope(|scope| {
            let handle = scope.spawn(|| set_a.get_client());
            let from_b = set_b.get_client();
            let from_a = match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            };
            Ok((Some(from_a?), Some(from_b?)))
        }),
        (Some(set_a), None) => Ok((Some(set_a.get_client()?), None)),
        (None, Some(set_b)) => Ok((None, Some(set_b.get_client()?))),
        (None, None) => Ok((None, None)),
    }
}

fn worker_end(endpoint: &Endpoint, accepted: Option<(u16, TcpStream)>) -> WorkerEnd {
    match (endpoint, accepted) {
        (Endpoint::Listen { .. }, Some((port, stream))) => {
            debug!("client from port {port} handed to session");
            WorkerEnd::Accepted(SocketCloser::new(stream))
        }
        (Endpoint::Listen { .. }, None) => unreachable!("listen endpoint without accepted client"),
        (Endpoint::Dial { host, port }, _) => WorkerEnd::Dial {
            host: host.clone(),
            port: *port,
        },
        (Endpoint::Stdio, _) => WorkerEnd::Stdio,
    }
}

/// Runs one session to completion: materializes both ends, relays, logs.
/// Holds the session seat for its whole lifetime; every exit path releases
/// it and fires any armed socket closers.
fn session_worker(
    serial: u64,
    seat: SemaphoreReleaser,
    first: WorkerEnd,
    second: WorkerEnd,
    dials: &Arc<Semaphore>,
    config: &RelayConfig,
) {
    let _seat = seat;

    let end_a = match materialize(serial, first, dials, config) {
        Ok(end) => end,
        Err(err) => {
            warn!("#{serial}: {err}; abandoning session");
            return;
        }
    };
    let end_b = match materialize(serial, second, dials, config) {
        Ok(end) => end,
        Err(err) => {
            // end_a drops here, closing any socket it acquired.
            warn!("#{serial}: {err}; abandoning session");
            return;
        }
    };

    let outcome = relay_session(serial, end_a, end_b, config);
    log_direction(serial, "forward", &outcome.forward);
    log_direction(serial, "reverse", &outcome.reverse);
}

/// Dials where needed, holding a connect-in-progress permit for the
/// duration of the dial so a flood of clients cannot stampede outbound
/// connects.
fn materialize(
    serial: u64,
    end: WorkerEnd,
    dials: &Arc<Semaphore>,
    config: &RelayConfig,
) -> Result<SessionEnd, DialError> {
    match end {
        WorkerEnd::Accepted(closer) => Ok(SessionEnd::Socket(closer)),
        WorkerEnd::Stdio => Ok(SessionEnd::Stdio),
        WorkerEnd::Dial { host, port } => {
            let _dialing = SemaphoreReleaser::acquire(dials);
            let stream = net::dial(&host, port, config.connect_timeout)?;
            debug!("#{serial}: dialed {host}:{port}");
            Ok(SessionEnd::Socket(SocketCloser::new(stream)))
        }
    }
}

/// Full-duplex relay between two live ends.
///
/// Spawns one copy engine per direction sharing a cancellation flag and a
/// completion signal. Waits for a direction to finish (or, with an idle
/// timeout configured, for a window with no progress), then cancels, joins
/// both engines, and closes both sockets.
pub fn relay_session(
    serial: u64,
    end_a: SessionEnd,
    end_b: SessionEnd,
    config: &RelayConfig,
) -> SessionOutcome {
    for end in [&end_a, &end_b] {
        match end {
            SessionEnd::Socket(closer) => {
                if let Err(err) = closer.stream().set_nonblocking(true) {
                    fatal("fcntl", &err);
                }
            }
            SessionEnd::Stdio => {
                if let Err(err) = net::set_nonblocking_fd(libc::STDIN_FILENO)
                    .and_then(|()| net::set_nonblocking_fd(libc::STDOUT_FILENO))
                {
                    fatal("fcntl", &err);
                }
            }
        }
    }

    // Each direction substitutes stdin on its read side and stdout on its
    // write side when the corresponding end is stdio.
    let (read_a, write_a) = end_fds(&end_a);
    let (read_b, write_b) = end_fds(&end_b);

    let ctl = CopyControl::new();
    let done = Arc::new(Semaphore::new(0));

    debug!("#{serial}: relaying fd {read_a} <-> fd {read_b}");
    let (forward, reverse) = thread::scope(|scope| {
        let fwd = scope.spawn(|| {
            let _finished = SemaphoreReleaser::arm(&done);
            copy_fd_while(
                read_a,
                write_b,
                &ctl,
                Some(RELAY_POLL_INTERVAL),
                config.buffer_capacity,
            )
        });
        let rev = scope.spawn(|| {
            let _finished = SemaphoreReleaser::arm(&done);
            copy_fd_while(
                read_b,
                write_a,
                &ctl,
                Some(RELAY_POLL_INTERVAL),
                config.buffer_capacity,
            )
        });

        wait_for_completion(&done, &ctl, config.io_timeout);
        ctl.cancel();

        (join_engine(fwd), join_engine(rev))
    });

    // end_a and end_b drop here: armed closers shut down and close both
    // sockets on every path out of the relay.
    SessionOutcome { forward, reverse }
}

/// Blocks until one direction completes or the session has been idle for a
/// full timeout window. Progress during a window re-arms the wait.
fn wait_for_completion(done: &Semaphore, ctl: &CopyControl, idle_timeout: Option<Duration>) {
    match idle_timeout {
        None => done.acquire(),
        Some(window) => {
            let mut seen = ctl.bytes_moved();
            loop {
                if done.try_acquire_for(window) {
                    return;
                }
                let moved = ctl.bytes_moved();
                if moved == seen {
                    debug!("session idle for {window:?}");
                    return;
                }
                seen = moved;
            }
        }
    }
}

fn end_fds(end: &SessionEnd) -> (RawFd, RawFd) {
    match end {
        SessionEnd::Socket(closer) => {
            let fd = closer.stream().as_raw_fd();
            (fd, fd)
        }
        SessionEnd::Stdio => (libc::STDIN_FILENO, libc::STDOUT_FILENO),
    }
}

fn join_engine(
    handle: thread::ScopedJoinHandle<'_, Result<IoCounters, CopyError>>,
) -> Result<IoCounters, CopyError> {
    match handle.join() {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

fn log_direction(serial: u64, direction: &str, result: &Result<IoCounters, CopyError>) {
    match result {
        Ok(counters) => info!(
            "#{serial}: {direction}: {} bytes, {} reads, {} writes",
            counters.bytes_copied, counters.reads, counters.writes
        ),
        Err(err) if err.raw_os_error() == Some(libc::ECONNREFUSED) => {
            error!("#{serial}: {direction}: {err}");
        }
        Err(err) => warn!("#{serial}: {direction}: {err}"),
    }
}

/// Unrecoverable system-call failure: one line on stderr naming the call,
/// then exit with its errno.
fn fatal(op: &str, err: &io::Error) -> ! {
    error!("{op}: {err}");
    eprintln!("{op}: {err}");
    process::exit(err.raw_os_error().unwrap_or(1));
}
