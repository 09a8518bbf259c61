use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Which cgroup hierarchy the node runs, or none at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CgroupMode {
    Off,
    /// Legacy per-controller hierarchies
    V1,
    /// Unified hierarchy
    V2,
}

impl CgroupMode {
    pub fn detect() -> Self {
        Self::detect_at(Path::new("/sys/fs/cgroup"))
    }

    /// v2 preferred, v1 fallback, otherwise off.
    pub fn detect_at(root: &Path) -> Self {
        if root.join("cgroup.controllers").exists() {
            CgroupMode::V2
        } else if root.join("memory").is_dir() && root.join("cpu").is_dir() {
            CgroupMode::V1
        } else {
            CgroupMode::Off
        }
    }

    pub fn is_enabled(self) -> bool {
        self != CgroupMode::Off
    }
}

impl fmt::Display for CgroupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CgroupMode::Off => write!(f, "off"),
            CgroupMode::V1 => write!(f, "cgroup_v1"),
            CgroupMode::V2 => write!(f, "cgroup_v2"),
        }
    }
}
