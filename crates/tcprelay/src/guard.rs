use log::debug;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Counting semaphore.
///
/// The standard library has no stable counting semaphore, so this is the
/// classic mutex-and-condvar construction. It backs the session and
/// dial-in-progress caps and the per-session completion signal, which needs
/// the bounded `try_acquire_for` wait.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        // A poisoning panic cannot corrupt a plain counter.
        self.permits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until a permit is available and takes it.
    pub fn acquire(&self) {
        let mut permits = self.lock();
        while *permits == 0 {
            permits = self
                .available
                .wait(permits)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
    }

    /// Takes a permit if one becomes available within `timeout`.
    pub fn try_acquire_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.lock();
        loop {
            if *permits > 0 {
                *permits -= 1;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .available
                .wait_timeout(permits, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            permits = guard;
        }
    }

    /// Returns a permit.
    pub fn release(&self) {
        *self.lock() += 1;
        self.available.notify_one();
    }

    /// Current number of available permits. Racy by nature; for tests and
    /// diagnostics only.
    pub fn available(&self) -> usize {
        *self.lock()
    }
}

/// Releases one permit on scope exit unless disarmed. Moving transfers the
/// obligation exactly once; there is no way to arm it twice for the same
/// permit.
#[derive(Debug)]
pub struct SemaphoreReleaser {
    semaphore: Option<Arc<Semaphore>>,
}

impl SemaphoreReleaser {
    /// Acquires a permit from `semaphore` and arms its release.
    pub fn acquire(semaphore: &Arc<Semaphore>) -> Self {
        semaphore.acquire();
        Self::arm(semaphore)
    }

    /// Arms a release without acquiring: one release will happen on drop.
    /// Used by the completion signal, where the waiter holds the deficit.
    pub fn arm(semaphore: &Arc<Semaphore>) -> Self {
        Self {
            semaphore: Some(Arc::clone(semaphore)),
        }
    }

    /// Drops the release obligation.
    pub fn disarm(&mut self) {
        self.semaphore = None;
    }
}

impl Drop for SemaphoreReleaser {
    fn drop(&mut self) {
        if let Some(semaphore) = self.semaphore.take() {
            semaphore.release();
        }
    }
}

/// Closes a socket (half-duplex shutdown, then close) when it goes out of
/// scope, unless ownership is taken back with [`release`](Self::release).
///
/// Every acquisition path in the supervisor arms one of these immediately,
/// so an abandoned session cannot leak a descriptor. The type is not
/// `Clone`; moves transfer the close obligation exactly once.
#[derive(Debug)]
pub struct SocketCloser {
    stream: Option<TcpStream>,
    serial: u64,
}

static CLOSER_SERIAL: AtomicU64 = AtomicU64::new(0);

impl SocketCloser {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
            serial: CLOSER_SERIAL.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// The guarded stream, still owned by the closer.
    pub fn stream(&self) -> &TcpStream {
        match &self.stream {
            Some(stream) => stream,
            None => unreachable!("socket closer emptied before drop"),
        }
    }

    /// Disarms the closer and hands the socket back to the caller, which
    /// becomes the sole owner.
    pub fn release(mut self) -> TcpStream {
        match self.stream.take() {
            Some(stream) => stream,
            None => unreachable!("socket closer emptied before drop"),
        }
    }
}

impl Drop for SocketCloser {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!("closer #{} shutting down socket", self.serial);
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};
    use std::thread;

    #[test]
    fn semaphore_blocks_at_zero() {
        let sem = Arc::new(Semaphore::new(1));
        sem.acquire();
        assert!(!sem.try_acquire_for(Duration::from_millis(50)));

        let waiter = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            waiter.acquire();
            waiter.release();
        });
        sem.release();
        handle.join().unwrap();
        assert_eq!(sem.available(), 1);
    }

    #[test]
    fn releaser_returns_permit_once() {
        let sem = Arc::new(Semaphore::new(2));
        {
            let _seat = SemaphoreReleaser::acquire(&sem);
            assert_eq!(sem.available(), 1);
        }
        assert_eq!(sem.available(), 2);
    }

    #[test]
    fn disarmed_releaser_keeps_permit() {
        let sem = Arc::new(Semaphore::new(1));
        let mut seat = SemaphoreReleaser::acquire(&sem);
        seat.disarm();
        drop(seat);
        assert_eq!(sem.available(), 0);
        sem.release();
    }

    #[test]
    fn armed_releaser_signals_completion() {
        let done = Arc::new(Semaphore::new(0));
        {
            let _signal = SemaphoreReleaser::arm(&done);
            assert_eq!(done.available(), 0);
        }
        assert!(done.try_acquire_for(Duration::from_millis(10)));
    }

    #[test]
    fn closer_shuts_down_unless_released() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        let (server, _) = listener.accept().unwrap();

        // Released stream stays usable.
        let kept = SocketCloser::new(client).release();
        kept.set_nodelay(true).unwrap();

        // Dropped closer shuts the socket down.
        drop(SocketCloser::new(server));
    }
}
