//! Signal name parsing and async-safe signal capture for the CLI.
use crate::config::types::{Result, TaskboxError};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

/// Parse a signal name for `Shutdown`.
///
/// Accepts `SIGTERM`, `TERM` and `term`; an empty name means SIGTERM.
pub fn parse_signal(name: &str) -> Result<Signal> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Ok(Signal::SIGTERM);
    }
    let upper = trimmed.to_ascii_uppercase();
    let canonical = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&canonical)
        .map_err(|_| TaskboxError::Configuration(format!("unknown signal: {}", name)))
}

/// Records SIGINT/SIGTERM/SIGHUP delivered to the agent.
pub struct SignalHandler;

impl SignalHandler {
    /// Install the handlers. Call before spawning threads.
    pub fn init() -> Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(Self::record),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
            // SAFETY: the handler only stores into atomics.
            unsafe { signal::sigaction(sig, &action) }.map_err(|e| {
                TaskboxError::Launch(format!("Failed to install {} handler: {}", sig, e))
            })?;
        }
        log::debug!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(Self)
    }

    extern "C" fn record(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Signal number received, 0 if none.
    pub fn received(&self) -> i32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }

    /// Poll until a signal arrives or `timeout` passes.
    pub fn wait_for_signal(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.shutdown_requested() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        self.shutdown_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal_forms() {
        assert_eq!(parse_signal("").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("TERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("sigint").unwrap(), Signal::SIGINT);
        assert_eq!(parse_signal(" KILL ").unwrap(), Signal::SIGKILL);
    }

    #[test]
    fn test_unknown_signal_is_configuration_error() {
        assert!(parse_signal("SIGBOGUS").unwrap_err().is_configuration());
    }

    #[test]
    fn test_handler_records_signal() {
        let handler = SignalHandler::init().unwrap();
        SignalHandler::record(libc::SIGHUP);
        assert!(handler.shutdown_requested());
        assert_eq!(handler.received(), libc::SIGHUP);
        assert!(handler.wait_for_signal(Duration::from_millis(1)));
        SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
        SIGNAL_RECEIVED.store(0, Ordering::SeqCst);
    }
}
