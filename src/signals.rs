/// Termination of the watched process.
///
/// The monitor talks to a `ProcessTerminator` rather than calling `kill`
/// directly, so tests can record requests instead of signalling real PIDs.
/// SIGTERM is used, never SIGKILL, so the target can shut down cleanly.
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Errors from delivering a termination signal.
#[derive(Debug)]
pub enum SignalError {
    /// PID is 0 or does not fit a `pid_t`; `kill` would address a process group.
    InvalidPid { pid: u32 },
    /// The kernel refused delivery (ESRCH: already gone, EPERM: not ours).
    Delivery { pid: u32, source: Errno },
}

impl std::fmt::Display for SignalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalError::InvalidPid { pid } => {
                write!(f, "refusing to signal invalid PID {}", pid)
            }
            SignalError::Delivery { pid, source } => {
                write!(f, "failed to send SIGTERM to PID {}: {}", pid, source)
            }
        }
    }
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalError::InvalidPid { .. } => None,
            SignalError::Delivery { source, .. } => Some(source),
        }
    }
}

/// Something that can ask a process to exit.
pub trait ProcessTerminator {
    fn terminate(&mut self, pid: u32) -> Result<(), SignalError>;
}

/// Sends SIGTERM with `kill(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SigtermTerminator;

impl ProcessTerminator for SigtermTerminator {
    fn terminate(&mut self, pid: u32) -> Result<(), SignalError> {
        let raw = match i32::try_from(pid) {
            Ok(v) if v > 0 => v,
            _ => return Err(SignalError::InvalidPid { pid }),
        };

        kill(Pid::from_raw(raw), Signal::SIGTERM)
            .map_err(|source| SignalError::Delivery { pid, source })
    }
}
