//! Cgroup v1 resource governance.

use super::backend::{
    read_keyed_counter, read_pids, remove_dirs, write_file, CgroupBackend, CgroupLimits,
};
use super::paths::CgroupLayout;
use super::shares::{MAX_CPU_SHARES, MIN_CPU_SHARES};
use crate::config::types::{Result, TaskboxError};
use std::fs;
use std::path::{Path, PathBuf};

/// One directory per controller hierarchy.
pub struct CgroupV1 {
    layout: CgroupLayout,
}

impl CgroupV1 {
    pub fn new(layout: CgroupLayout) -> Self {
        Self { layout }
    }

    fn controller_path(&self, controller: &str) -> Result<&Path> {
        self.layout.path_for(controller).ok_or_else(|| {
            TaskboxError::Cgroup(format!("{} controller path not available", controller))
        })
    }

    fn set_memory_limit(&self, limit_bytes: u64) -> Result<()> {
        let memory = self.controller_path("memory")?;
        write_file(&memory.join("memory.limit_in_bytes"), &limit_bytes.to_string())?;

        // Keep swap from extending the ceiling when the kernel accounts it
        let memsw = memory.join("memory.memsw.limit_in_bytes");
        if memsw.exists() {
            write_file(&memsw, &limit_bytes.to_string())?;
        }
        Ok(())
    }

    fn set_cpu_shares(&self, shares: u64) -> Result<()> {
        if !(MIN_CPU_SHARES..=MAX_CPU_SHARES).contains(&shares) {
            return Err(TaskboxError::Cgroup(format!(
                "Invalid CPU shares: {} (must be {}-{})",
                shares, MIN_CPU_SHARES, MAX_CPU_SHARES
            )));
        }
        let cpu = self.controller_path("cpu")?;
        write_file(&cpu.join("cpu.shares"), &shares.to_string())
    }

    fn set_devices(&self, limits: &CgroupLimits) -> Result<()> {
        let devices = self.controller_path("devices")?;
        write_file(&devices.join("devices.deny"), "a")?;
        for rule in &limits.devices {
            let file = if rule.allow { "devices.allow" } else { "devices.deny" };
            write_file(&devices.join(file), &rule.cgroup_v1_entry())?;
        }
        Ok(())
    }
}

/// Fill empty cpuset.cpus / cpuset.mems from the nearest populated ancestor.
///
/// A v1 cpuset group rejects tasks until both files are set.
fn inherit_cpuset(leaf: &Path) -> Result<()> {
    for file in ["cpuset.cpus", "cpuset.mems"] {
        let mut empty = Vec::new();
        let mut current = Some(leaf);
        let mut value = String::new();
        while let Some(dir) = current {
            let content = fs::read_to_string(dir.join(file)).unwrap_or_default();
            if !content.trim().is_empty() {
                value = content.trim().to_string();
                break;
            }
            empty.push(dir);
            current = dir.parent();
        }
        if value.is_empty() {
            continue;
        }
        for dir in empty.iter().rev() {
            write_file(&dir.join(file), &value)?;
        }
    }
    Ok(())
}

impl CgroupBackend for CgroupV1 {
    fn backend_name(&self) -> &'static str {
        "cgroup_v1"
    }

    fn create(&self) -> Result<()> {
        for (controller, path) in self.layout.controllers() {
            fs::create_dir_all(path).map_err(|e| {
                TaskboxError::Cgroup(format!(
                    "Failed to create {} cgroup {}: {}",
                    controller,
                    path.display(),
                    e
                ))
            })?;
            if controller == "cpuset" {
                inherit_cpuset(path)?;
            }
        }
        log::debug!("Created v1 cgroups: {:?}", self.layout.distinct_paths());
        Ok(())
    }

    fn apply_limits(&self, limits: &CgroupLimits) -> Result<()> {
        if let Some(bytes) = limits.memory_bytes {
            self.set_memory_limit(bytes)?;
        }
        if let Some(shares) = limits.cpu_shares {
            self.set_cpu_shares(shares)?;
        }
        if let Some(cpus) = &limits.cpuset_cpus {
            let cpuset = self.controller_path("cpuset")?;
            write_file(&cpuset.join("cpuset.cpus"), cpus)?;
        }
        if !limits.devices.is_empty() {
            self.set_devices(limits)?;
        }
        Ok(())
    }

    fn attach_process(&self, pid: i32) -> Result<()> {
        for (controller, path) in self.layout.controllers() {
            fs::write(path.join("cgroup.procs"), pid.to_string()).map_err(|e| {
                TaskboxError::Cgroup(format!(
                    "Failed to attach {} to {} cgroup: {}",
                    pid, controller, e
                ))
            })?;
        }
        Ok(())
    }

    fn member_pids(&self) -> Result<Vec<i32>> {
        let mut pids = Vec::new();
        for path in self.layout.distinct_paths() {
            pids.extend(read_pids(&path.join("cgroup.procs"))?);
        }
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }

    fn oom_kill_count(&self) -> Result<u64> {
        match self.layout.path_for("memory") {
            Some(memory) => read_keyed_counter(&memory.join("memory.oom_control"), "oom_kill"),
            None => Ok(0),
        }
    }

    fn remove(&self) -> Result<()> {
        remove_dirs(&self.layout.distinct_paths())
    }

    fn paths(&self) -> Vec<PathBuf> {
        self.layout.distinct_paths()
    }
}
