/// Executor configuration loading from a JSON file
use crate::config::types::{Result, TaskboxError};
use crate::kernel::cgroup::CgroupMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cgroup mode selection in the config file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupModeSetting {
    #[default]
    Auto,
    Off,
    V1,
    V2,
}

/// Node-level executor settings shared by every launch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub cgroup_root: PathBuf,
    pub cgroup_mode: CgroupModeSetting,
    /// Parent group for computed task cgroups
    pub cgroup_parent: String,
    /// Node compute in MHz; detected when absent
    pub total_compute: Option<u64>,
    /// Environment variable globs stripped from every task
    pub denied_envvars: Vec<String>,
    pub default_devices: bool,
    pub sweep_timeout_ms: u64,
    pub cleanup_retries: u32,
    pub cleanup_backoff_ms: u64,
    /// Per-stream capture cap for exec output
    pub exec_output_limit: usize,
    pub kill_wait_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            cgroup_mode: CgroupModeSetting::Auto,
            cgroup_parent: "taskbox".to_string(),
            total_compute: None,
            denied_envvars: Vec::new(),
            default_devices: true,
            sweep_timeout_ms: 5_000,
            cleanup_retries: 5,
            cleanup_backoff_ms: 50,
            exec_output_limit: 4 * 1024 * 1024,
            kill_wait_ms: 5_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl ExecutorConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TaskboxError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: ExecutorConfig = serde_json::from_str(content)
            .map_err(|e| TaskboxError::Configuration(format!("Failed to parse config: {}", e)))?;
        if !config.cgroup_root.is_absolute() {
            return Err(TaskboxError::Configuration(format!(
                "cgroup_root must be an absolute path, got {}",
                config.cgroup_root.display()
            )));
        }
        Ok(config)
    }

    /// Effective cgroup mode, probing the host when set to auto.
    pub fn resolved_cgroup_mode(&self) -> CgroupMode {
        match self.cgroup_mode {
            CgroupModeSetting::Auto => CgroupMode::detect_at(&self.cgroup_root),
            CgroupModeSetting::Off => CgroupMode::Off,
            CgroupModeSetting::V1 => CgroupMode::V1,
            CgroupModeSetting::V2 => CgroupMode::V2,
        }
    }

    pub fn resolved_total_compute(&self) -> u64 {
        self.total_compute.unwrap_or_else(detect_total_compute)
    }

    pub fn sweep_timeout(&self) -> Duration {
        Duration::from_millis(self.sweep_timeout_ms)
    }

    pub fn cleanup_backoff(&self) -> Duration {
        Duration::from_millis(self.cleanup_backoff_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Sum of per-core clock speed in MHz, the unit CPU shares are requested in.
pub fn detect_total_compute() -> u64 {
    match std::fs::read_to_string("/proc/cpuinfo") {
        Ok(content) => {
            let total = total_compute_from_cpuinfo(&content);
            if total > 0 {
                return total;
            }
        }
        Err(e) => log::warn!("Failed to read /proc/cpuinfo: {}", e),
    }

    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u64)
        .unwrap_or(1);
    cores * 1000
}

fn total_compute_from_cpuinfo(content: &str) -> u64 {
    content
        .lines()
        .filter(|line| line.starts_with("cpu MHz"))
        .filter_map(|line| line.split(':').nth(1))
        .filter_map(|value| value.trim().parse::<f64>().ok())
        .map(|mhz| mhz.round() as u64)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ExecutorConfig::default();
        assert_eq!(config.cgroup_root, PathBuf::from("/sys/fs/cgroup"));
        assert_eq!(config.cgroup_parent, "taskbox");
        assert_eq!(config.cgroup_mode, CgroupModeSetting::Auto);
        assert!(config.default_devices);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ExecutorConfig::from_json(
            r#"{"cgroup_mode": "off", "denied_envvars": ["*_TOKEN"], "total_compute": 12000}"#,
        )
        .unwrap();
        assert_eq!(config.resolved_cgroup_mode(), CgroupMode::Off);
        assert_eq!(config.denied_envvars, vec!["*_TOKEN".to_string()]);
        assert_eq!(config.resolved_total_compute(), 12000);
        assert_eq!(config.cleanup_retries, 5);
    }

    #[test]
    fn test_relative_cgroup_root_rejected() {
        let err = ExecutorConfig::from_json(r#"{"cgroup_root": "sys/fs/cgroup"}"#).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"cgroup_parent": "nomad", "kill_wait_ms": 250}}"#).unwrap();
        let config = ExecutorConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.cgroup_parent, "nomad");
        assert_eq!(config.kill_wait(), Duration::from_millis(250));
    }

    #[test]
    fn test_total_compute_from_cpuinfo() {
        let cpuinfo = "processor\t: 0\ncpu MHz\t\t: 2999.998\n\nprocessor\t: 1\ncpu MHz\t\t: 3000.2\n";
        assert_eq!(total_compute_from_cpuinfo(cpuinfo), 6000);
        assert_eq!(total_compute_from_cpuinfo("processor : 0\n"), 0);
    }
}
