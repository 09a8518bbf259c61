//! Stale-occupant sweep for a task cgroup.
//!
//! Runs before every launch and again at teardown. It relies only on what
//! the cgroup filesystem reports, so it also cleans up after a crashed or
//! restarted agent.
use super::backend::CgroupBackend;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// PIDs that received SIGKILL
    pub killed: Vec<i32>,
    /// Members still present when the sweep gave up
    pub remaining: Vec<i32>,
    pub timed_out: bool,
    /// Set when membership could not be read; emptiness is then unknown
    pub list_error: Option<String>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.remaining.is_empty() && !self.timed_out && self.list_error.is_none()
    }
}

/// Kill and reap every member of the cgroup except the agent itself.
///
/// Failures are logged, never returned; the report says what was left.
pub fn sweep_stale_occupants(backend: &dyn CgroupBackend, timeout: Duration) -> SweepReport {
    let own_pid = std::process::id() as i32;
    let deadline = Instant::now() + timeout;
    let mut killed = BTreeSet::new();
    let mut report = SweepReport::default();

    loop {
        let members: Vec<i32> = match backend.member_pids() {
            Ok(pids) => pids.into_iter().filter(|pid| *pid != own_pid && *pid > 0).collect(),
            Err(e) => {
                log::warn!("Sweep could not list members of {:?}: {}", backend.paths(), e);
                report.list_error = Some(e.to_string());
                break;
            }
        };

        if members.is_empty() {
            report.remaining = Vec::new();
            break;
        }

        for pid in &members {
            let target = Pid::from_raw(*pid);
            match kill(target, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {
                    if killed.insert(*pid) {
                        log::info!("Killed stale cgroup occupant {}", pid);
                    }
                }
                Err(e) => log::warn!("Failed to kill stale occupant {}: {}", pid, e),
            }
            // Only our own children can be reaped here; others are reaped by their parent
            let _ = waitpid(target, Some(WaitPidFlag::WNOHANG));
        }

        if Instant::now() >= deadline {
            log::warn!(
                "Sweep of {:?} timed out with {} members left",
                backend.paths(),
                members.len()
            );
            report.remaining = members;
            report.timed_out = true;
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    report.killed = killed.into_iter().collect();
    report
}
