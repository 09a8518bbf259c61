/// Cgroup teardown with retry
///
/// Removal happens only once the sweep reports the group empty. Every
/// failure is logged and reported, never returned as an error.
use crate::config::config::ExecutorConfig;
use crate::kernel::cgroup::{sweep_stale_occupants, CgroupBackend, SweepReport};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a teardown attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub attempts: u32,
    pub removed: bool,
    /// Members killed across all sweeps
    pub killed: Vec<i32>,
    pub errors: Vec<String>,
}

/// Owns the claimed cgroup directories of one launch.
pub struct CgroupCleanup {
    backend: Arc<dyn CgroupBackend>,
    retries: u32,
    backoff: Duration,
    sweep_timeout: Duration,
    done: AtomicBool,
}

impl CgroupCleanup {
    pub fn new(
        backend: Arc<dyn CgroupBackend>,
        retries: u32,
        backoff: Duration,
        sweep_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            retries,
            backoff,
            sweep_timeout,
            done: AtomicBool::new(false),
        }
    }

    pub fn from_config(backend: Arc<dyn CgroupBackend>, config: &ExecutorConfig) -> Self {
        Self::new(
            backend,
            config.cleanup_retries,
            config.cleanup_backoff(),
            config.sweep_timeout(),
        )
    }

    pub fn backend(&self) -> &Arc<dyn CgroupBackend> {
        &self.backend
    }

    /// Sweep then rmdir, retrying with exponential backoff.
    ///
    /// Idempotent: only the first call does any work.
    pub fn teardown(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        if self.done.swap(true, Ordering::SeqCst) {
            debug!("Cgroup teardown already ran for {:?}", self.backend.paths());
            report.removed = true;
            return report;
        }

        let mut delay = self.backoff;
        for attempt in 0..=self.retries {
            report.attempts = attempt + 1;
            let sweep: SweepReport = sweep_stale_occupants(self.backend.as_ref(), self.sweep_timeout);
            report.killed.extend(sweep.killed.iter().copied());

            if let Some(e) = sweep.list_error {
                report.errors.push(format!("could not list members: {}", e));
            } else if !sweep.is_clean() {
                report
                    .errors
                    .push(format!("members still present: {:?}", sweep.remaining));
            } else {
                match self.backend.remove() {
                    Ok(()) => {
                        report.removed = true;
                        info!("Removed cgroup {:?}", self.backend.paths());
                        break;
                    }
                    Err(e) => report.errors.push(e.to_string()),
                }
            }

            if attempt < self.retries {
                std::thread::sleep(delay);
                delay = delay.saturating_mul(2);
            }
        }

        report.killed.sort_unstable();
        report.killed.dedup();
        if !report.removed {
            warn!(
                "Cgroup cleanup of {:?} gave up after {} attempts: {}",
                self.backend.paths(),
                report.attempts,
                report.errors.join("; ")
            );
        }
        report
    }
}
