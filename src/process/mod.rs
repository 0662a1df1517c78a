//! Process lifecycle management.
//!
//! [`ControlledProcess`] wraps any [`Controllable`] unit of work with a stop
//! flag, a restart flag and a bounded stop → terminate → kill escalation.
//! [`ApplicationProcess`] is the unit that runs the supervised program.

pub mod application;
pub mod controllable;

pub use application::ApplicationProcess;
pub use controllable::{Controllable, ControlledProcess, LifecycleState, DEFAULT_KILL_GRACE};

use tracing::{debug, trace};

/// Signals the supervisor sends to application processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Best-effort signal delivery. Returns false if the process could not be signalled.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) -> bool {
    let Ok(raw_pid) = i32::try_from(pid) else {
        debug!("PID {} out of range, not signalling", pid);
        return false;
    };
    if raw_pid <= 0 {
        return false;
    }

    trace!("Sending {:?} to PID {}", signal, pid);
    let rc = unsafe { libc::kill(raw_pid, signal.as_raw()) };
    if rc != 0 {
        debug!(
            "Failed to send {:?} to PID {}: {}",
            signal,
            pid,
            std::io::Error::last_os_error()
        );
        return false;
    }
    true
}

/// Whether a process with this PID currently exists.
#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    match i32::try_from(pid) {
        Ok(raw_pid) if raw_pid > 0 => unsafe { libc::kill(raw_pid, 0) == 0 },
        _ => false,
    }
}
