//! Cgroup backend abstraction for v1/v2 dual support.

use super::mode::CgroupMode;
use super::paths::CgroupLayout;
use crate::config::types::{Result, TaskboxError};
use crate::kernel::devices::DeviceRule;
use std::fs;
use std::path::{Path, PathBuf};

/// Limits applied to a task's cgroup before the task is admitted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CgroupLimits {
    pub memory_bytes: Option<u64>,
    /// Already normalized
    pub cpu_shares: Option<u64>,
    pub cpuset_cpus: Option<String>,
    pub devices: Vec<DeviceRule>,
}

pub trait CgroupBackend: Send + Sync {
    fn backend_name(&self) -> &'static str;
    /// Create (or claim) the task's directories.
    fn create(&self) -> Result<()>;
    fn apply_limits(&self, limits: &CgroupLimits) -> Result<()>;
    fn attach_process(&self, pid: i32) -> Result<()>;
    /// Thread-group IDs currently in the task's cgroup.
    fn member_pids(&self) -> Result<Vec<i32>>;
    /// Cumulative kernel OOM-kill counter for the task's memory cgroup.
    fn oom_kill_count(&self) -> Result<u64>;
    /// Remove the task's leaf directories.
    fn remove(&self) -> Result<()>;
    fn paths(&self) -> Vec<PathBuf>;
}

/// Build the backend for a resolved layout.
pub fn open_backend(layout: &CgroupLayout) -> Option<Box<dyn CgroupBackend>> {
    match layout.mode() {
        CgroupMode::Off => None,
        CgroupMode::V1 => Some(Box::new(super::v1::CgroupV1::new(layout.clone()))),
        CgroupMode::V2 => Some(Box::new(super::v2::CgroupV2::new(layout.clone()))),
    }
}

pub(crate) fn write_file(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).map_err(|e| {
        TaskboxError::Cgroup(format!("Failed to write '{}' to {}: {}", value, path.display(), e))
    })
}

/// Parse a `cgroup.procs` file; a missing file means no members.
pub(crate) fn read_pids(path: &Path) -> Result<Vec<i32>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(TaskboxError::Cgroup(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    Ok(content
        .lines()
        .filter_map(|line| line.trim().parse::<i32>().ok())
        .collect())
}

/// Value of `key` in a flat keyed file such as memory.events.
pub(crate) fn read_keyed_counter(path: &Path, key: &str) -> Result<u64> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(TaskboxError::Cgroup(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    Ok(parse_keyed_counter(&content, key))
}

pub(crate) fn parse_keyed_counter(content: &str, key: &str) -> u64 {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(k), Some(v)) if k == key => v.parse::<u64>().ok(),
                _ => None,
            }
        })
        .next()
        .unwrap_or(0)
}

/// rmdir each path, tolerating ones already gone.
pub(crate) fn remove_dirs(paths: &[PathBuf]) -> Result<()> {
    let mut errors = Vec::new();
    for path in paths {
        match fs::remove_dir(path) {
            Ok(()) => log::debug!("Removed cgroup {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => errors.push(format!("{}: {}", path.display(), e)),
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(TaskboxError::Cleanup(errors.join(", ")))
    }
}
