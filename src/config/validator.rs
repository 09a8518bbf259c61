// Command validation
// Every check here runs before any side effect; a failure is a
// configuration error and is never retried.

use crate::config::types::{CommandSpec, Result, TaskboxError};
use crate::kernel::capabilities::CapabilitySet;
use crate::kernel::devices::valid_permissions;
use crate::utils::env_hygiene::{invalid_env_key, EnvPolicy};
use serde::Serialize;

/// Memory requests below this are accepted with a warning
const SMALL_MEMORY_BYTES: u64 = 1024 * 1024;

/// Validation result with detailed errors
#[derive(Debug, Default, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Check a command specification without touching the system.
pub fn validate_command(spec: &CommandSpec) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_paths(spec, &mut result);
    validate_resources(spec, &mut result);
    validate_security(spec, &mut result);
    validate_environment(spec, &mut result);

    result
}

/// `validate_command`, with errors turned into one configuration error.
pub fn validate_or_reject(spec: &CommandSpec) -> Result<ValidationResult> {
    let result = validate_command(spec);
    for warning in &result.warnings {
        log::warn!("Command validation warning: {}", warning);
    }
    if !result.is_valid() {
        return Err(TaskboxError::Configuration(result.errors.join("; ")));
    }
    Ok(result)
}

fn validate_paths(spec: &CommandSpec, result: &mut ValidationResult) {
    if spec.command().trim().is_empty() {
        result.add_error("command must not be empty".to_string());
    }

    if !spec.task_dir().is_absolute() {
        result.add_error("task_dir must be an absolute path".to_string());
    }

    if let Some(work_dir) = spec.work_dir() {
        if !work_dir.is_absolute() {
            result.add_error("work_dir must be an absolute path".to_string());
        }
    }

    for mount in spec.mounts() {
        if !mount.task_path.is_absolute() {
            result.add_error(format!(
                "mount task path {} must be an absolute path",
                mount.task_path.display()
            ));
        }
        if !mount.host_path.is_absolute() {
            result.add_error(format!(
                "mount host path {} must be an absolute path",
                mount.host_path.display()
            ));
        }
    }
}

fn validate_resources(spec: &CommandSpec, result: &mut ValidationResult) {
    let resources = spec.resources();

    if !resources.override_cgroup_v1.is_empty() && resources.override_cgroup_v2.is_some() {
        result.add_error(
            "only one of cgroups_v1_override and cgroups_v2_override may be set".to_string(),
        );
    }

    match resources.memory_bytes {
        Some(0) => result.add_error("memory_bytes must be greater than zero".to_string()),
        Some(bytes) if bytes < SMALL_MEMORY_BYTES => result.add_warning(format!(
            "memory_bytes {} is below 1 MiB; the task may be OOM killed immediately",
            bytes
        )),
        _ => {}
    }

    if let Some(cpus) = &resources.cpuset_cpus {
        if cpus.trim().is_empty() {
            result.add_error("cpuset_cpus must not be empty when set".to_string());
        }
    }

    if !spec.resource_limits()
        && (resources.memory_bytes.is_some() || resources.cpu_shares.is_some())
    {
        result.add_warning("resource limits are disabled; memory and cpu requests are ignored".to_string());
    }
}

fn validate_security(spec: &CommandSpec, result: &mut ValidationResult) {
    if spec.oom_score_adj() < 0 {
        result.add_error("oom_score_adj must not be negative".to_string());
    }

    if let Err(e) = CapabilitySet::calculate(CapabilitySet::empty(), spec.cap_add(), spec.cap_drop()) {
        result.add_error(e.to_string());
    }

    for device in spec.devices() {
        if !valid_permissions(&device.permissions) {
            result.add_error(format!(
                "device {} permissions '{}' must be a non-empty subset of rwm",
                device.host_path.display(),
                device.permissions
            ));
        }
        if !device.task_path.is_absolute() {
            result.add_error(format!(
                "device task path {} must be an absolute path",
                device.task_path.display()
            ));
        }
    }
}

fn validate_environment(spec: &CommandSpec, result: &mut ValidationResult) {
    for key in spec.env().keys() {
        if let Some(message) = invalid_env_key(key) {
            result.add_error(message);
        }
    }

    if let Err(e) = EnvPolicy::new(spec.denied_envvars(), &[]) {
        result.add_error(e.to_string());
    }
}
