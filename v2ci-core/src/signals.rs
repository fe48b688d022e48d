//! SIGTERM handling and process liveness probes.
//!
//! Termination is cooperative: the handler flips a write-once atomic flag
//! and every loop observes it at documented checkpoints through a
//! [`Shutdown`] token. In-flight collaborator subprocesses are never
//! killed; they run to completion before the checkpoint is reached.

use std::sync::atomic::{AtomicBool, Ordering};

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigterm(_signum: libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
}

/// Read-only view of the process termination flag.
#[derive(Clone, Copy)]
pub struct Shutdown {
    flag: &'static AtomicBool,
}

impl Shutdown {
    /// Install the SIGTERM handler for this process and return the token.
    ///
    /// Safe to call more than once; the supervisor installs it after
    /// daemonizing and each forked worker installs it again for itself.
    pub fn install() -> Self {
        // SAFETY: the handler only performs an atomic store, which is
        // async-signal-safe.
        unsafe {
            libc::signal(
                libc::SIGTERM,
                on_sigterm as extern "C" fn(libc::c_int) as libc::sighandler_t,
            );
        }
        Self { flag: &TERMINATE }
    }

    /// Token backed by a caller-provided flag; used by tests to drive
    /// termination checkpoints without raising a real signal.
    pub fn from_flag(flag: &'static AtomicBool) -> Self {
        Self { flag }
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// True when `pid` names a live process (signal-0 probe).
pub fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs the permission/existence check only.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Send SIGTERM to `pid`; returns false when the signal could not be sent.
pub fn send_sigterm(pid: u32) -> bool {
    // SAFETY: plain kill(2) on a pid we read from a pidfile.
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_token_reads_its_flag() {
        static FLAG: AtomicBool = AtomicBool::new(false);
        let shutdown = Shutdown::from_flag(&FLAG);
        assert!(!shutdown.is_set());
        FLAG.store(true, Ordering::SeqCst);
        assert!(shutdown.is_set());
        FLAG.store(false, Ordering::SeqCst);
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn nonexistent_pid_is_not_alive() {
        // Linux caps pids well below this value.
        assert!(!pid_alive(4_000_000));
    }
}
