//! One-shot byte-stream relay: wires two endpoints together, runs a single
//! copy engine until end-of-stream, and reports the totals.

use anyhow::{Context, Result};
use log::{debug, info};
use std::io;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::process;
use std::thread;
use tcprelay::cli::{self, CatOptions, Endpoint};
use tcprelay::copy::{copy_fd, CopyError};
use tcprelay::net::{self, ListenerSet};

/// Ring capacity for the one-shot relay.
const CAT_BUFFER_CAPACITY: usize = 128 * 1024;
const CAT_LISTEN_BACKLOG: i32 = 10;

fn main() {
    env_logger::init();

    let options = match cli::parse_cat(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{err}");
            eprintln!("{}", cli::cat_usage());
            process::exit(1);
        }
    };

    if let Err(err) = run(&options) {
        eprintln!("{err:#}");
        process::exit(exit_code(&err));
    }
}

/// One live relay end.
enum CatEnd {
    Socket(TcpStream),
    Stdio,
}

impl CatEnd {
    fn read_fd(&self) -> RawFd {
        match self {
            Self::Socket(stream) => stream.as_raw_fd(),
            Self::Stdio => libc::STDIN_FILENO,
        }
    }

    fn write_fd(&self) -> RawFd {
        match self {
            Self::Socket(stream) => stream.as_raw_fd(),
            Self::Stdio => libc::STDOUT_FILENO,
        }
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            Self::Socket(stream) => stream.set_nonblocking(true),
            Self::Stdio => net::set_nonblocking_fd(libc::STDIN_FILENO)
                .and_then(|()| net::set_nonblocking_fd(libc::STDOUT_FILENO)),
        }
    }
}

fn run(options: &CatOptions) -> Result<()> {
    let (first, second) = materialize(&options.first, &options.second)?;

    first.set_nonblocking().context("fcntl")?;
    second.set_nonblocking().context("fcntl")?;

    debug!(
        "starting copy, fd {} to fd {}",
        first.read_fd(),
        second.write_fd()
    );
    let stats = copy_fd(first.read_fd(), second.write_fd(), CAT_BUFFER_CAPACITY)?;
    info!(
        "{} bytes, {} reads, {} writes",
        stats.bytes_copied, stats.reads, stats.writes
    );
    Ok(())
}

/// Brings both endpoints live. Listeners are served first, in parallel
/// when both ends listen so neither client is kept waiting behind the
/// other, and remotes are dialed only once every expected client has
/// actually arrived.
fn materialize(first: &Endpoint, second: &Endpoint) -> Result<(CatEnd, CatEnd)> {
    if first.is_listen() && second.is_listen() {
        let mut set_a = bind(first)?;
        let mut set_b = bind(second)?;
        let (client_a, client_b) = thread::scope(|scope| {
            let handle = scope.spawn(|| set_a.get_client());
            let from_b = set_b.get_client();
            let from_a = match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            };
            (from_a, from_b)
        });
        let (_, stream_a) = client_a.context("accept")?;
        let (_, stream_b) = client_b.context("accept")?;
        return Ok((CatEnd::Socket(stream_a), CatEnd::Socket(stream_b)));
    }

    let mut ends = [None, None];
    for (index, endpoint) in [first, second].into_iter().enumerate() {
        if endpoint.is_listen() {
            let mut set = bind(endpoint)?;
            let (_, stream) = set.get_client().context("accept")?;
            ends[index] = Some(CatEnd::Socket(stream));
        }
    }
    for (index, endpoint) in [first, second].into_iter().enumerate() {
        match endpoint {
            Endpoint::Stdio => ends[index] = Some(CatEnd::Stdio),
            Endpoint::Dial { host, port } => {
                let stream = net::dial(host, *port, Some(net::DEFAULT_DIAL_TIMEOUT))?;
                ends[index] = Some(CatEnd::Socket(stream));
            }
            Endpoint::Listen { .. } => {}
        }
    }

    let [Some(first_end), Some(second_end)] = ends else {
        unreachable!("endpoint not materialized");
    };
    Ok((first_end, second_end))
}

fn bind(endpoint: &Endpoint) -> Result<ListenerSet> {
    match endpoint {
        Endpoint::Listen { host, ports } => {
            Ok(ListenerSet::bind(*host, ports, CAT_LISTEN_BACKLOG)?)
        }
        Endpoint::Dial { .. } | Endpoint::Stdio => unreachable!("bind on non-listen endpoint"),
    }
}

/// 0 on clean termination, 1 on configuration problems, the errno for I/O
/// subsystem failures.
fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(copy_err) = cause.downcast_ref::<CopyError>() {
            return copy_err.raw_os_error().unwrap_or(1);
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if let Some(code) = io_err.raw_os_error() {
                return code;
            }
        }
    }
    1
}
