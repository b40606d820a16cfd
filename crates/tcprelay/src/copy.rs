use crate::ring::Ring;
use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Termination statistics for one copy engine run.
///
/// `reads` and `writes` are the ring's committed push and pop operation
/// counts, i.e. the number of successful vectored reads and writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoCounters {
    pub bytes_copied: u64,
    pub reads: u64,
    pub writes: u64,
}

/// Fatal copy-engine failures. Would-block and poll timeouts are internal
/// and never surface; everything else arrives here with the running byte
/// count attached so the caller can decide what to do with the session.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("read failed after {bytes_copied} bytes: {source}")]
    Read {
        #[source]
        source: io::Error,
        bytes_copied: u64,
    },
    #[error("write failed after {bytes_copied} bytes: {source}")]
    Write {
        #[source]
        source: io::Error,
        bytes_copied: u64,
    },
}

impl CopyError {
    /// Bytes successfully delivered to the write side before the failure.
    pub fn bytes_copied(&self) -> u64 {
        match self {
            Self::Read { bytes_copied, .. } | Self::Write { bytes_copied, .. } => *bytes_copied,
        }
    }

    /// The underlying errno, when the failure came from the OS. The
    /// zero-length-write case reports `WriteZero` and has no errno.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Read { source, .. } | Self::Write { source, .. } => source.raw_os_error(),
        }
    }
}

/// Shared per-session control block for the copy engines.
///
/// The cancellation flag is consulted at readiness-wait boundaries only;
/// worst-case extra latency after `cancel` is one poll interval. The
/// progress counter accumulates bytes delivered by every engine sharing the
/// block, letting the session relay distinguish an idle session from a busy
/// one without joining the engine threads.
#[derive(Debug)]
pub struct CopyControl {
    keep_going: AtomicBool,
    bytes_moved: AtomicU64,
}

impl CopyControl {
    pub fn new() -> Self {
        Self {
            keep_going: AtomicBool::new(true),
            bytes_moved: AtomicU64::new(0),
        }
    }

    /// Requests that every engine sharing this block exit at its next
    /// readiness-wait boundary, without draining pending data.
    pub fn cancel(&self) {
        self.keep_going.store(false, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        !self.keep_going.load(Ordering::Acquire)
    }

    /// Total bytes delivered so far by engines sharing this block.
    pub fn bytes_moved(&self) -> u64 {
        self.bytes_moved.load(Ordering::Relaxed)
    }

    #[inline]
    fn should_continue(&self) -> bool {
        self.keep_going.load(Ordering::Acquire)
    }

    #[inline]
    fn note_progress(&self, n: u64) {
        self.bytes_moved.fetch_add(n, Ordering::Relaxed);
    }
}

impl Default for CopyControl {
    fn default() -> Self {
        Self::new()
    }
}

const EMPTY_IOVEC: libc::iovec = libc::iovec {
    iov_base: ptr::null_mut(),
    iov_len: 0,
};

fn load_iovecs(iov: &mut [libc::iovec; 2], first: (*mut u8, usize), second: (*mut u8, usize)) -> usize {
    let mut nseg = 0;
    if first.1 > 0 {
        iov[0] = libc::iovec {
            iov_base: first.0.cast(),
            iov_len: first.1,
        };
        nseg = 1;
        if second.1 > 0 {
            iov[1] = libc::iovec {
                iov_base: second.0.cast(),
                iov_len: second.1,
            };
            nseg = 2;
        }
    }
    nseg
}

fn would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

/// Waits for readiness on the interested descriptors. A negative fd entry
/// is ignored by poll(2), so uninterested sides are simply disabled.
/// EINTR restarts the wait; a timeout is reported as success and the caller
/// retries its I/O.
fn wait_ready(
    read_fd: RawFd,
    want_read: bool,
    write_fd: RawFd,
    want_write: bool,
    timeout_ms: libc::c_int,
) -> io::Result<()> {
    let mut fds = [
        libc::pollfd {
            fd: if want_read { read_fd } else { -1 },
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd: if want_write { write_fd } else { -1 },
            events: libc::POLLOUT,
            revents: 0,
        },
    ];
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// One-shot copy: runs until end-of-input (and a drained ring), a peer
/// close, or a fatal I/O error. Readiness waits block indefinitely.
pub fn copy_fd(read_fd: RawFd, write_fd: RawFd, capacity: usize) -> Result<IoCounters, CopyError> {
    let ctl = CopyControl::new();
    copy_fd_while(read_fd, write_fd, &ctl, None, capacity)
}

/// Moves bytes from `read_fd` to `write_fd` through a freshly allocated
/// ring of `capacity` bytes. Both descriptors must be non-blocking.
///
/// Returns when end-of-input has been observed and the ring is empty, when
/// the writer reports end-of-stream (fatal), on any other non-retryable
/// I/O error, or once `ctl` has been cancelled and a readiness wait
/// returns. `poll_timeout` bounds each readiness wait and therefore the
/// cancellation latency; `None` blocks indefinitely.
pub fn copy_fd_while(
    read_fd: RawFd,
    write_fd: RawFd,
    ctl: &CopyControl,
    poll_timeout: Option<Duration>,
    capacity: usize,
) -> Result<IoCounters, CopyError> {
    let ring = Ring::<u8>::new(capacity);
    let timeout_ms: libc::c_int = match poll_timeout {
        Some(d) => d.as_millis().max(1) as libc::c_int,
        None => -1,
    };

    let mut read_iov = [EMPTY_IOVEC; 2];
    let mut write_iov = [EMPTY_IOVEC; 2];
    let mut read_nseg = 0;
    let mut write_nseg = 0;

    let mut bytes_copied: u64 = 0;
    let mut read_eof = false;
    let mut inquire_needed = true;
    let mut keep_going = true;

    loop {
        let mut poll_read = false;
        let mut poll_write = false;

        if inquire_needed {
            let (a, b) = ring.push_inquire();
            read_nseg = load_iovecs(
                &mut read_iov,
                (a.as_mut_ptr(), a.len()),
                (b.as_mut_ptr(), b.len()),
            );
        }
        let mut bytes_read: isize = 0;
        if read_nseg > 0 && !read_eof {
            bytes_read =
                unsafe { libc::readv(read_fd, read_iov.as_ptr(), read_nseg as libc::c_int) };
            if bytes_read < 0 {
                let err = io::Error::last_os_error();
                if would_block(&err) {
                    poll_read = true;
                } else {
                    return Err(CopyError::Read {
                        source: err,
                        bytes_copied,
                    });
                }
            } else if bytes_read == 0 {
                // End of input: never read or poll the read side again;
                // keep going until the ring drains.
                read_eof = true;
            } else {
                ring.push(bytes_read as usize);
            }
        }

        if inquire_needed {
            let (a, b) = ring.pop_inquire();
            write_nseg = load_iovecs(
                &mut write_iov,
                (a.as_ptr().cast_mut(), a.len()),
                (b.as_ptr().cast_mut(), b.len()),
            );
        }
        let mut bytes_written: isize = 0;
        if write_nseg > 0 {
            bytes_written =
                unsafe { libc::writev(write_fd, write_iov.as_ptr(), write_nseg as libc::c_int) };
            if bytes_written < 0 {
                let err = io::Error::last_os_error();
                if would_block(&err) {
                    poll_write = true;
                } else {
                    return Err(CopyError::Write {
                        source: err,
                        bytes_copied,
                    });
                }
            } else if bytes_written == 0 {
                // Peer closed for writing.
                return Err(CopyError::Write {
                    source: io::Error::from(io::ErrorKind::WriteZero),
                    bytes_copied,
                });
            } else {
                ring.pop(bytes_written as usize);
                bytes_copied += bytes_written as u64;
                ctl.note_progress(bytes_written as u64);
            }
        }

        // Only block if really necessary: a side that progressed will be
        // retried immediately, so the other side must not be waited on.
        if bytes_read > 0 {
            poll_write = false;
        }
        if bytes_written > 0 {
            poll_read = false;
        }

        if poll_read || poll_write {
            if let Err(err) = wait_ready(read_fd, poll_read, write_fd, poll_write, timeout_ms) {
                return Err(if poll_read {
                    CopyError::Read {
                        source: err,
                        bytes_copied,
                    }
                } else {
                    CopyError::Write {
                        source: err,
                        bytes_copied,
                    }
                });
            }
            // Sampled after the wait returns, so a cancellation that lands
            // while this iteration is blocked is acted on at this boundary
            // and never costs more than one poll interval.
            keep_going = ctl.should_continue();
        }

        // Only inquire if really necessary.
        inquire_needed = bytes_read > 0 || bytes_written > 0;

        // Negative values mean a readiness wait just happened; only an
        // iteration with zero progress on both sides ends the loop.
        if (bytes_read == 0 && bytes_written == 0) || !keep_going {
            break;
        }
    }

    let (reads, writes) = ring.counters();
    Ok(IoCounters {
        bytes_copied,
        reads,
        writes,
    })
}
