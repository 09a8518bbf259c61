use crate::kernel::capabilities::CapabilitySet;
use crate::kernel::mount::SandboxMounts;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Agent->child launch contract, sent once the cgroup is ready.
///
/// Everything here is already resolved; the child only applies it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Executable path as seen after entering the sandbox root
    pub task_path: PathBuf,
    /// Full argv, argv[0] being the command as the caller wrote it
    pub argv: Vec<String>,
    /// Sorted KEY=VALUE list; the agent's environment is never inherited
    pub env: Vec<String>,
    pub work_dir: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub capabilities: CapabilitySet,
    pub oom_score_adj: i32,
    pub mounts: SandboxMounts,
    /// Host paths, opened before the root changes
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
}

/// Child->agent failure report written to the status pipe.
///
/// A successful exec closes the pipe without writing anything.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildStatus {
    /// Setup step that failed
    pub stage: String,
    pub error: String,
}

impl ChildStatus {
    pub fn failed(stage: &str, error: impl fmt::Display) -> Self {
        Self {
            stage: stage.to_string(),
            error: error.to_string(),
        }
    }
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_status_display() {
        let status = ChildStatus::failed("mounts", "Failed to mount proc on /srv/task/proc: EPERM");
        assert_eq!(
            status.to_string(),
            "mounts: Failed to mount proc on /srv/task/proc: EPERM"
        );
    }

    #[test]
    fn test_launch_request_json_shape() {
        let request = LaunchRequest {
            task_path: PathBuf::from("/bin/sleep"),
            argv: vec!["sleep".to_string(), "10".to_string()],
            env: vec!["HOME=/".to_string()],
            work_dir: PathBuf::from("/"),
            uid: 65534,
            gid: 65534,
            capabilities: CapabilitySet::from_bits(0x400),
            oom_score_adj: 0,
            mounts: SandboxMounts::new(std::path::Path::new("/srv/task"), &[], &[]),
            stdout_path: None,
            stderr_path: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["task_path"], "/bin/sleep");
        assert_eq!(value["capabilities"], 0x400);
        assert_eq!(value["mounts"]["root"], "/srv/task");
    }
}
