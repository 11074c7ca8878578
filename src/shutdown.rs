//! Shutdown signaling and the in-process wake primitive.
//!
//! The ingress loop blocks in `poll` on its sockets, so a signal handler
//! cannot stop the server by setting a flag alone: something must make the
//! poll return. The wake primitive is a nonblocking pipe whose read end sits
//! in the poll set; `POLLIN` on it is the sole authoritative shutdown signal,
//! the boolean is a hint for inner loops.
//!
//! # Signal safety
//!
//! The handler performs exactly one atomic store, one `write(2)`, and one
//! disposition reset. No locks, no allocation. After the first invocation the
//! handler restores `SIG_DFL`, so a second signal force-terminates the
//! process.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Nonblocking pipe used to interrupt a blocking poll.
///
/// Also serves as the outbound-queue doorbell: producers ring it after an
/// MPSC push so the poller wakes to drain frames.
pub struct WakePipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl WakePipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` points at two writable ints.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // Nonblocking on both ends: the writer may run inside a signal
        // handler, and the poller drains until EAGAIN.
        for fd in fds {
            // SAFETY: fd is a valid pipe end we just created.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            let rc = if flags < 0 {
                flags
            } else {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                // SAFETY: both fds are live pipe ends.
                unsafe {
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                return Err(err);
            }
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// Fd to place in the poll set.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Make the poller wake up. Safe from any thread; EAGAIN (pipe already
    /// holds a wake byte) is as good as a successful write.
    pub fn ring(&self) {
        ring_fd(self.write_fd);
    }

    /// Consume pending wake bytes after a `POLLIN`.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: read into a local buffer on a nonblocking fd.
            let n = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        // SAFETY: both fds were created by us and closed exactly once.
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

fn ring_fd(fd: RawFd) {
    if fd < 0 {
        return;
    }
    let byte = 1u8;
    // SAFETY: one-byte write to a nonblocking fd; all outcomes acceptable.
    unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
}

/// Set by the signal handler; process-wide because handlers can only reach
/// static state.
static SIGNAL_SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Write end of the wake pipe the signal handler rings. `-1` until
/// [`ShutdownController::install_signal_handlers`] runs.
static SIGNAL_WAKE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_signal(sig: libc::c_int) {
    SIGNAL_SHUTDOWN.store(true, Ordering::SeqCst);
    ring_fd(SIGNAL_WAKE_FD.load(Ordering::SeqCst));
    // SAFETY: resetting the disposition is async-signal-safe; a repeat signal
    // now terminates with the default action.
    unsafe { libc::signal(sig, libc::SIG_DFL) };
}

/// Owns the wake pipe and the shutdown flag.
///
/// [`trigger`](Self::trigger) performs the same store+write sequence the
/// signal handler does, so tests and embedders can request shutdown without
/// raising a signal.
pub struct ShutdownController {
    pipe: WakePipe,
    requested: AtomicBool,
}

impl ShutdownController {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            pipe: WakePipe::new()?,
            requested: AtomicBool::new(false),
        })
    }

    /// Fd whose `POLLIN` is the authoritative shutdown signal.
    pub fn wake_fd(&self) -> RawFd {
        self.pipe.read_fd()
    }

    /// Hint flag: true once shutdown was requested by any path.
    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst) || SIGNAL_SHUTDOWN.load(Ordering::SeqCst)
    }

    /// Request shutdown from ordinary (non-signal) code.
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.pipe.ring();
    }

    /// Consume wake bytes after the poller observed `POLLIN`.
    pub fn drain(&self) {
        self.pipe.drain();
    }

    /// Route `SIGINT`/`SIGTERM` (graceful stop) plus `SIGABRT`/`SIGSEGV`
    /// (last-ditch drain attempt) through the wake pipe.
    pub fn install_signal_handlers(&self) {
        SIGNAL_WAKE_FD.store(self.pipe.write_fd, Ordering::SeqCst);
        for sig in [libc::SIGINT, libc::SIGTERM, libc::SIGABRT, libc::SIGSEGV] {
            // SAFETY: installing a handler that is itself async-signal-safe.
            unsafe { libc::signal(sig, handle_signal as *const () as libc::sighandler_t) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readable_within(fd: RawFd, timeout_ms: i32) -> bool {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: single pollfd on the stack.
        let n = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        n == 1 && (pfd.revents & libc::POLLIN) != 0
    }

    #[test]
    fn trigger_sets_flag_and_wakes_poller() {
        let ctl = ShutdownController::new().expect("controller");
        assert!(!ctl.requested());
        assert!(!readable_within(ctl.wake_fd(), 0));

        ctl.trigger();
        assert!(ctl.requested());
        assert!(readable_within(ctl.wake_fd(), 100));

        ctl.drain();
        assert!(!readable_within(ctl.wake_fd(), 0));
        // The hint stays set; only the wake byte is consumed.
        assert!(ctl.requested());
    }

    #[test]
    fn repeated_triggers_are_idempotent() {
        let ctl = ShutdownController::new().expect("controller");
        for _ in 0..100 {
            ctl.trigger();
        }
        assert!(readable_within(ctl.wake_fd(), 100));
        ctl.drain();
        assert!(!readable_within(ctl.wake_fd(), 0));
    }

    #[test]
    fn wake_pipe_ring_then_drain() {
        let pipe = WakePipe::new().expect("pipe");
        pipe.ring();
        pipe.ring();
        assert!(readable_within(pipe.read_fd(), 100));
        pipe.drain();
        assert!(!readable_within(pipe.read_fd(), 0));
    }
}
