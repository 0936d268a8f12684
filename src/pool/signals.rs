//! Exit-status analysis for reaped workers.
//!
//! Anything other than a clean `exit(0)` after `Halt` is fatal to a run; this
//! module turns the raw wait status into a reason that names what happened.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// SIGKILL, usually from the OOM killer or from halt escalation.
    Killed,
    /// SIGSEGV (Linux) or SIGBUS (macOS), typically a stack overflow.
    StackOverflow(Signal),
    /// Stopped, continued or traced; not a termination we expect.
    Unknown,
}

impl TerminationReason {
    /// A clean worker exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::Killed => "killed by SIGKILL (out of memory or forced halt)".to_string(),
            Self::StackOverflow(sig) => format!("crashed with {:?} (likely stack overflow)", sig),
            Self::Unknown => "terminated for an unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => match signal {
            Signal::SIGKILL => TerminationReason::Killed,
            Signal::SIGSEGV | Signal::SIGBUS => TerminationReason::StackOverflow(signal),
            _ => TerminationReason::Signaled(signal),
        },
        _ => TerminationReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_clean_exit_is_success() {
        let status = WaitStatus::Exited(Pid::from_raw(10), 0);
        let reason = analyze_wait_status(status);
        assert_eq!(reason, TerminationReason::Exited(0));
        assert!(reason.is_success());
    }

    #[test]
    fn test_nonzero_exit_is_failure() {
        let reason = analyze_wait_status(WaitStatus::Exited(Pid::from_raw(10), 3));
        assert!(!reason.is_success());
        assert_eq!(reason.to_string(), "exited with code 3");
    }

    #[test]
    fn test_signal_classification() {
        let pid = Pid::from_raw(10);
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            TerminationReason::Killed
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGSEGV, true)),
            TerminationReason::StackOverflow(Signal::SIGSEGV)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            TerminationReason::Signaled(Signal::SIGTERM)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::StillAlive),
            TerminationReason::Unknown
        );
    }

    #[test]
    fn test_descriptions_mention_signal() {
        let reason = TerminationReason::Signaled(Signal::SIGTERM);
        assert!(reason.to_string().contains("SIGTERM"));
        assert!(TerminationReason::Killed.to_string().contains("SIGKILL"));
    }
}
