use log::{debug, info};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;
use thiserror::Error;

/// How long an outbound connect may take when the caller has not bounded
/// it explicitly.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Startup-time network configuration failures. All of these are fatal to
/// the process.
#[derive(Debug, Error)]
pub enum NetConfigError {
    #[error("{op} failed: {source}")]
    Socket {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("cannot bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("cannot listen on port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("cannot resolve host {host:?}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("no addresses found for host {host:?}")]
    NoAddresses { host: String },
}

/// A failed or timed-out outbound connect. Terminates only the session
/// that attempted it.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("cannot resolve host {host:?}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("no addresses found for host {host:?}")]
    NoAddresses { host: String },
    #[error("connect to {host}:{port} timed out after {timeout:?}")]
    Timeout {
        host: String,
        port: u16,
        timeout: Duration,
    },
    #[error("connect to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Resolves `host:port` eagerly so configuration mistakes surface before
/// any client is accepted.
pub fn resolve_host(host: &str, port: u16) -> Result<Vec<SocketAddr>, NetConfigError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| NetConfigError::Resolve {
            host: host.to_owned(),
            source,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(NetConfigError::NoAddresses {
            host: host.to_owned(),
        });
    }
    Ok(addrs)
}

/// Dials `host:port` with a bounded total wait. Tries each resolved
/// address in order; the last failure wins.
pub fn dial(host: &str, port: u16, timeout: Option<Duration>) -> Result<TcpStream, DialError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| DialError::Resolve {
            host: host.to_owned(),
            source,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(DialError::NoAddresses {
            host: host.to_owned(),
        });
    }

    let mut last_err = None;
    for addr in addrs {
        let attempt = match timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => {
                info!("connected to {addr}");
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }

    let source = last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable));
    if source.kind() == io::ErrorKind::TimedOut {
        Err(DialError::Timeout {
            host: host.to_owned(),
            port,
            timeout: timeout.unwrap_or(DEFAULT_DIAL_TIMEOUT),
        })
    } else {
        Err(DialError::Connect {
            host: host.to_owned(),
            port,
            source,
        })
    }
}

/// A set of non-blocking listening sockets, one per port, all bound to the
/// same address.
///
/// `get_client` yields one accepted connection at a time; every listener
/// that is ready during a single wake-up is drained into an internal queue
/// so later calls return without re-polling.
pub struct ListenerSet {
    listeners: Vec<(u16, TcpListener)>,
    pending: VecDeque<(u16, TcpStream)>,
}

impl ListenerSet {
    /// Binds every port on `host` (all interfaces when `None`) with address
    /// and port reuse enabled.
    pub fn bind(
        host: Option<IpAddr>,
        ports: &[u16],
        backlog: i32,
    ) -> Result<Self, NetConfigError> {
        debug_assert!(!ports.is_empty(), "listener set needs at least one port");
        let ip = host.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let domain = match ip {
            IpAddr::V4(_) => Domain::IPV4,
            IpAddr::V6(_) => Domain::IPV6,
        };

        let mut listeners = Vec::with_capacity(ports.len());
        for &port in ports {
            let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
                .map_err(|source| NetConfigError::Socket { op: "socket", source })?;
            socket
                .set_reuse_address(true)
                .map_err(|source| NetConfigError::Socket { op: "setsockopt", source })?;
            #[cfg(unix)]
            socket
                .set_reuse_port(true)
                .map_err(|source| NetConfigError::Socket { op: "setsockopt", source })?;
            socket
                .bind(&SocketAddr::new(ip, port).into())
                .map_err(|source| NetConfigError::Bind { port, source })?;
            socket
                .listen(backlog)
                .map_err(|source| NetConfigError::Listen { port, source })?;
            socket
                .set_nonblocking(true)
                .map_err(|source| NetConfigError::Socket { op: "fcntl", source })?;
            debug!("listening on {ip}:{port}");
            listeners.push((port, socket.into()));
        }

        Ok(Self {
            listeners,
            pending: VecDeque::new(),
        })
    }

    /// The ports this set listens on, in bind order.
    pub fn ports(&self) -> Vec<u16> {
        self.listeners.iter().map(|(port, _)| *port).collect()
    }

    /// Blocks until a client has been accepted on some port and returns it.
    ///
    /// Accepted sockets have keepalive enabled. Errors other than
    /// would-block are unrecoverable and propagate to the caller, which
    /// treats them as fatal.
    pub fn get_client(&mut self) -> io::Result<(u16, TcpStream)> {
        loop {
            // Drain every ready listener before blocking again.
            for (port, listener) in &self.listeners {
                loop {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            SockRef::from(&stream).set_keepalive(true)?;
                            info!("accepted {peer} on port {port}");
                            self.pending.push_back((*port, stream));
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => return Err(err),
                    }
                }
            }

            if let Some(client) = self.pending.pop_front() {
                return Ok(client);
            }

            self.wait_for_accept()?;
        }
    }

    fn wait_for_accept(&self) -> io::Result<()> {
        let mut fds: Vec<libc::pollfd> = self
            .listeners
            .iter()
            .map(|(_, listener)| libc::pollfd {
                fd: listener.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        loop {
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if rc >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

/// Adds `O_NONBLOCK` to an already-open descriptor. Needed for the stdio
/// descriptors, which have no `TcpStream` wrapper.
pub fn set_nonblocking_fd(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Installs an ignore disposition for SIGPIPE so a peer closing its read
/// side is observed as a write error instead of killing the process.
pub fn ignore_sigpipe() -> io::Result<()> {
    let previous = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    if previous == libc::SIG_ERR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_and_accept_queue() {
        let mut set = ListenerSet::bind(Some(IpAddr::V4(Ipv4Addr::LOCALHOST)), &[0], 4).unwrap();
        // Port 0 binds an ephemeral port; discover it from the socket.
        let bound = set.listeners[0].1.local_addr().unwrap().port();
        assert!(bound > 0);
        assert_eq!(set.ports(), vec![0]);

        let client = TcpStream::connect((Ipv4Addr::LOCALHOST, bound)).unwrap();
        let (port, accepted) = set.get_client().unwrap();
        assert_eq!(port, 0);
        assert_eq!(
            accepted.peer_addr().unwrap().port(),
            client.local_addr().unwrap().port()
        );
    }

    #[test]
    fn both_ready_ports_are_surfaced() {
        let mut set =
            ListenerSet::bind(Some(IpAddr::V4(Ipv4Addr::LOCALHOST)), &[0, 0], 4).unwrap();
        let port_a = set.listeners[0].1.local_addr().unwrap().port();
        let port_b = set.listeners[1].1.local_addr().unwrap().port();

        // Both ports become ready before the first wait; both accepted
        // connections must come back, neither port starved.
        let _client_a = TcpStream::connect((Ipv4Addr::LOCALHOST, port_a)).unwrap();
        let _client_b = TcpStream::connect((Ipv4Addr::LOCALHOST, port_b)).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let first = set.get_client().unwrap().1.local_addr().unwrap().port();
        let second = set.get_client().unwrap().1.local_addr().unwrap().port();
        let mut seen = [first, second];
        seen.sort_unstable();
        let mut expected = [port_a, port_b];
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }

    #[test]
    fn dial_refused_reports_connect_error() {
        // Bind a listener, learn its port, drop it, then dial the now-dead
        // port: connection refused, not a timeout.
        let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        match dial("127.0.0.1", port, Some(Duration::from_secs(2))) {
            Err(DialError::Connect { source, .. }) => {
                assert_eq!(source.raw_os_error(), Some(libc::ECONNREFUSED));
            }
            other => panic!("expected connection refused, got {other:?}"),
        }
    }

    #[test]
    fn resolve_rejects_unknown_host() {
        assert!(resolve_host("host.invalid", 80).is_err());
    }
}
