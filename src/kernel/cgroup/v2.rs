//! Cgroup v2 backend implementation

use super::backend::{
    read_keyed_counter, read_pids, remove_dirs, write_file, CgroupBackend, CgroupLimits,
};
use super::paths::CgroupLayout;
use super::shares::shares_to_weight;
use crate::config::types::{Result, TaskboxError};
use std::fs;
use std::path::{Path, PathBuf};

const DELEGATED_CONTROLLERS: [&str; 4] = ["cpu", "cpuset", "memory", "pids"];

/// Single unified-hierarchy directory shared by all controllers.
pub struct CgroupV2 {
    layout: CgroupLayout,
}

impl CgroupV2 {
    pub fn new(layout: CgroupLayout) -> Self {
        Self { layout }
    }

    fn path(&self) -> Result<&Path> {
        self.layout
            .path_for("memory")
            .ok_or_else(|| TaskboxError::Cgroup("cgroup v2 path not available".to_string()))
    }

    /// Enable controllers on each ancestor between the root and the leaf.
    ///
    /// Best-effort: a controller the parent lacks is skipped, and the limit
    /// write that needs it reports the failure.
    fn enable_subtree_controllers(&self, leaf: &Path) {
        let root = self.layout.root();
        let Ok(relative) = leaf.strip_prefix(root) else {
            return;
        };
        let mut current = root.to_path_buf();
        let components: Vec<_> = relative.components().collect();
        for component in components.iter().take(components.len().saturating_sub(1)) {
            enable_on(&current);
            current.push(component);
            if let Err(e) = fs::create_dir_all(&current) {
                log::warn!("Failed to create cgroup parent {}: {}", current.display(), e);
                return;
            }
        }
        enable_on(&current);
    }
}

fn enable_on(dir: &Path) {
    let control = dir.join("cgroup.subtree_control");
    if !control.exists() {
        return;
    }
    for controller in DELEGATED_CONTROLLERS {
        if let Err(e) = fs::write(&control, format!("+{}", controller)) {
            log::debug!("Cannot enable {} in {}: {}", controller, dir.display(), e);
        }
    }
}

impl CgroupBackend for CgroupV2 {
    fn backend_name(&self) -> &'static str {
        "cgroup_v2"
    }

    fn create(&self) -> Result<()> {
        let path = self.path()?.to_path_buf();
        self.enable_subtree_controllers(&path);
        fs::create_dir_all(&path).map_err(|e| {
            TaskboxError::Cgroup(format!("Failed to create cgroup {}: {}", path.display(), e))
        })?;

        // Kill the whole group on OOM so a task is never left half-dead
        let oom_group = path.join("memory.oom.group");
        if oom_group.exists() {
            if let Err(e) = fs::write(&oom_group, "1") {
                log::warn!("Failed to set memory.oom.group: {}", e);
            }
        }
        log::debug!("Created v2 cgroup {}", path.display());
        Ok(())
    }

    fn apply_limits(&self, limits: &CgroupLimits) -> Result<()> {
        let path = self.path()?;
        if let Some(bytes) = limits.memory_bytes {
            write_file(&path.join("memory.max"), &bytes.to_string())?;
        }
        if let Some(shares) = limits.cpu_shares {
            write_file(&path.join("cpu.weight"), &shares_to_weight(shares).to_string())?;
        }
        if let Some(cpus) = &limits.cpuset_cpus {
            write_file(&path.join("cpuset.cpus"), cpus)?;
        }
        if !limits.devices.is_empty() {
            // No devices file on v2; the sandbox /dev carries the allow-list
            log::debug!("{} device rules enforced through sandbox /dev", limits.devices.len());
        }
        Ok(())
    }

    fn attach_process(&self, pid: i32) -> Result<()> {
        let procs = self.path()?.join("cgroup.procs");
        fs::write(&procs, pid.to_string()).map_err(|e| {
            TaskboxError::Cgroup(format!("Failed to attach process {} to cgroup: {}", pid, e))
        })
    }

    fn member_pids(&self) -> Result<Vec<i32>> {
        read_pids(&self.path()?.join("cgroup.procs"))
    }

    fn oom_kill_count(&self) -> Result<u64> {
        read_keyed_counter(&self.path()?.join("memory.events"), "oom_kill")
    }

    fn remove(&self) -> Result<()> {
        remove_dirs(&self.layout.distinct_paths())
    }

    fn paths(&self) -> Vec<PathBuf> {
        self.layout.distinct_paths()
    }
}
