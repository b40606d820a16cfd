//! Byte-stream relay utilities over TCP and standard I/O.
//!
//! Two command-line tools are built from this crate: `tcpcat`, a one-shot
//! relay between two endpoints, and `tcppipe`, a concurrent relay that
//! accepts clients for ever and runs a capped number of full-duplex
//! sessions. An endpoint is standard input/output, an outbound TCP
//! connection, or a set of listening ports.
//!
//! The moving parts:
//!
//! - A segmented SPSC [`Ring`] whose inquire/commit protocol exposes up to
//!   two contiguous regions per side, so a wrapped buffer still feeds a
//!   single vectored read or write.
//! - A non-blocking copy engine ([`copy_fd`], [`copy_fd_while`]) that
//!   drives one read/write descriptor pair through a ring, folds readiness
//!   waits into its loop, and honors a cancellation flag at wait
//!   boundaries.
//! - A session [`Supervisor`] that accepts or dials both ends, enforces
//!   session and connect-in-progress caps with counting semaphores, runs
//!   two engines per session, applies an idle timeout, and guarantees both
//!   sockets close on every exit path.
//!
//! # Example
//!
//! ```no_run
//! use tcprelay::{copy_fd, net};
//!
//! // Relay stdin to a drained sink until EOF.
//! let sink = net::dial("127.0.0.1", 9001, None).unwrap();
//! sink.set_nonblocking(true).unwrap();
//! net::set_nonblocking_fd(libc::STDIN_FILENO).unwrap();
//! let stats = copy_fd(
//!     libc::STDIN_FILENO,
//!     std::os::fd::AsRawFd::as_raw_fd(&sink),
//!     128 * 1024,
//! )
//! .unwrap();
//! println!("{} bytes", stats.bytes_copied);
//! ```

pub mod cli;
pub mod copy;
pub mod guard;
mod invariants;
pub mod net;
pub mod ring;
pub mod session;

pub use cli::{CatOptions, Endpoint, PipeOptions, UsageError};
pub use copy::{copy_fd, copy_fd_while, CopyControl, CopyError, IoCounters};
pub use guard::{Semaphore, SemaphoreReleaser, SocketCloser};
pub use net::{dial, DialError, ListenerSet, NetConfigError};
pub use ring::Ring;
pub use session::{relay_session, RelayConfig, SessionEnd, SessionOutcome, Supervisor};
