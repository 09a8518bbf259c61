//! Device access rules for the task's cgroup and sandbox /dev.
use crate::config::types::{DeviceConfig, Result, TaskboxError};
use nix::sys::stat::{major, minor, stat, SFlag};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Char,
    Block,
    All,
}

impl DeviceKind {
    fn as_char(self) -> char {
        match self {
            DeviceKind::Char => 'c',
            DeviceKind::Block => 'b',
            DeviceKind::All => 'a',
        }
    }
}

/// One allow/deny entry. `None` major or minor means wildcard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRule {
    pub kind: DeviceKind,
    pub major: Option<u64>,
    pub minor: Option<u64>,
    pub permissions: String,
    pub allow: bool,
    /// Where the node appears inside the sandbox, if it gets one
    pub task_path: Option<PathBuf>,
    /// Node bind-mounted into the sandbox
    pub host_path: Option<PathBuf>,
}

impl DeviceRule {
    fn char_node(path: &str, major: u64, minor: u64) -> Self {
        Self {
            kind: DeviceKind::Char,
            major: Some(major),
            minor: Some(minor),
            permissions: "rwm".to_string(),
            allow: true,
            task_path: Some(PathBuf::from(path)),
            host_path: Some(PathBuf::from(path)),
        }
    }

    /// Line written to devices.allow / devices.deny.
    pub fn cgroup_v1_entry(&self) -> String {
        if self.kind == DeviceKind::All {
            return "a".to_string();
        }
        let num = |n: Option<u64>| n.map_or_else(|| "*".to_string(), |n| n.to_string());
        format!(
            "{} {}:{} {}",
            self.kind.as_char(),
            num(self.major),
            num(self.minor),
            self.permissions
        )
    }

    /// Whether a node should be created under the sandbox /dev.
    pub fn has_node(&self) -> bool {
        self.task_path.is_some() && self.host_path.is_some()
    }
}

impl fmt::Display for DeviceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.allow { "allow" } else { "deny" };
        write!(f, "{} {}", verb, self.cgroup_v1_entry())
    }
}

/// Baseline allow-list every task receives.
pub fn default_devices() -> Vec<DeviceRule> {
    vec![
        DeviceRule::char_node("/dev/null", 1, 3),
        DeviceRule::char_node("/dev/zero", 1, 5),
        DeviceRule::char_node("/dev/full", 1, 7),
        DeviceRule::char_node("/dev/random", 1, 8),
        DeviceRule::char_node("/dev/urandom", 1, 9),
        DeviceRule::char_node("/dev/tty", 5, 0),
        DeviceRule::char_node("/dev/ptmx", 5, 2),
        // pseudo-terminal slaves
        DeviceRule {
            kind: DeviceKind::Char,
            major: Some(136),
            minor: None,
            permissions: "rwm".to_string(),
            allow: true,
            task_path: None,
            host_path: None,
        },
    ]
}

pub fn valid_permissions(perms: &str) -> bool {
    !perms.is_empty() && perms.chars().all(|c| matches!(c, 'r' | 'w' | 'm'))
}

/// Stat a host device node and build its allow rule.
pub fn device_rule_for(device: &DeviceConfig) -> Result<DeviceRule> {
    if !valid_permissions(&device.permissions) {
        return Err(TaskboxError::Configuration(format!(
            "device {} has invalid permissions '{}'",
            device.host_path.display(),
            device.permissions
        )));
    }

    let (kind, major, minor) = stat_device(&device.host_path)?;
    Ok(DeviceRule {
        kind,
        major: Some(major),
        minor: Some(minor),
        permissions: device.permissions.clone(),
        allow: true,
        task_path: Some(device.task_path.clone()),
        host_path: Some(device.host_path.clone()),
    })
}

fn stat_device(path: &Path) -> Result<(DeviceKind, u64, u64)> {
    let st = stat(path).map_err(|e| {
        TaskboxError::Configuration(format!("failed to stat device {}: {}", path.display(), e))
    })?;
    let kind = match SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT {
        SFlag::S_IFCHR => DeviceKind::Char,
        SFlag::S_IFBLK => DeviceKind::Block,
        _ => {
            return Err(TaskboxError::Configuration(format!(
                "{} is not a device node",
                path.display()
            )))
        }
    };
    Ok((kind, major(st.st_rdev), minor(st.st_rdev)))
}

/// Defaults (when enabled) followed by the caller's devices in order.
///
/// Duplicates are kept; a later rule can broaden an earlier one.
pub fn build_device_rules(include_defaults: bool, extra: &[DeviceConfig]) -> Result<Vec<DeviceRule>> {
    let mut rules = if include_defaults {
        default_devices()
    } else {
        Vec::new()
    };
    for device in extra {
        let rule = device_rule_for(device)?;
        log::debug!("Device grant: {} -> {}", rule, device.task_path.display());
        rules.push(rule);
    }
    Ok(rules)
}
