//! Process-group signalling. Children are spawned as group leaders, so the
//! group id equals the child's pid and signals reach any grandchildren too.

use crate::error::{HealError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    Stop,
    Continue,
    Terminate,
    Kill,
}

/// Whether this platform can suspend and resume a process group.
pub const fn suspend_supported() -> bool {
    cfg!(unix)
}

/// Deliver `signal` to the process group led by `pid`.
///
/// Returns `Ok(false)` when the group no longer exists.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: GroupSignal) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        GroupSignal::Stop => Signal::SIGSTOP,
        GroupSignal::Continue => Signal::SIGCONT,
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };

    match killpg(Pid::from_raw(pid as i32), sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(HealError::Signal {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pid: u32, signal: GroupSignal) -> Result<bool> {
    Err(HealError::Unsupported(format!(
        "process group signal {:?}",
        signal
    )))
}
