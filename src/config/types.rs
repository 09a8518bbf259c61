/// Core types and structures for the taskbox executor
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Isolation mode for the PID and IPC namespaces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IsolationMode {
    /// Share the agent's namespace
    #[default]
    Host,
    /// Fresh namespace for the task
    Private,
}

impl IsolationMode {
    /// Parse a mode string. Anything other than `private` is treated as `host`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "private" => IsolationMode::Private,
            "host" | "" => IsolationMode::Host,
            other => {
                log::warn!("Unrecognized isolation mode '{}', treating as host", other);
                IsolationMode::Host
            }
        }
    }

    pub fn is_private(self) -> bool {
        self == IsolationMode::Private
    }
}

impl From<String> for IsolationMode {
    fn from(value: String) -> Self {
        IsolationMode::parse(&value)
    }
}

impl From<IsolationMode> for String {
    fn from(mode: IsolationMode) -> Self {
        mode.to_string()
    }
}

impl fmt::Display for IsolationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationMode::Host => write!(f, "host"),
            IsolationMode::Private => write!(f, "private"),
        }
    }
}

/// Bind mount exception to the sandbox root
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    /// Source path on the host
    pub host_path: PathBuf,
    /// Path seen by the task, absolute within the sandbox root
    pub task_path: PathBuf,
    #[serde(default)]
    pub readonly: bool,
}

/// Explicit device grant
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub host_path: PathBuf,
    pub task_path: PathBuf,
    /// Subset of "rwm"
    #[serde(default = "default_device_permissions")]
    pub permissions: String,
}

fn default_device_permissions() -> String {
    "rwm".to_string()
}

/// Resources handed down by the allocation layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub memory_bytes: Option<u64>,
    pub cpu_shares: Option<u64>,
    /// Cgroup path derived from the allocation ID and task name
    pub cpuset_cgroup_path: Option<PathBuf>,
    /// Reserved core set, e.g. "0-3,6"
    pub cpuset_cpus: Option<String>,
    /// Per-controller overrides for the legacy hierarchy
    pub override_cgroup_v1: BTreeMap<String, PathBuf>,
    /// Whole-path override for the unified hierarchy
    pub override_cgroup_v2: Option<PathBuf>,
}

/// Immutable description of one task process.
///
/// Built once through [`CommandSpecBuilder`] and consumed by a single launch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    user: Option<String>,
    task_dir: PathBuf,
    #[serde(default)]
    work_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    resource_limits: bool,
    #[serde(default)]
    resources: Resources,
    #[serde(default)]
    pid_mode: IsolationMode,
    #[serde(default)]
    ipc_mode: IsolationMode,
    #[serde(default)]
    cap_add: Vec<String>,
    #[serde(default)]
    cap_drop: Vec<String>,
    #[serde(default)]
    devices: Vec<DeviceConfig>,
    #[serde(default)]
    mounts: Vec<MountConfig>,
    #[serde(default)]
    oom_score_adj: i32,
    #[serde(default)]
    denied_envvars: Vec<String>,
    #[serde(default)]
    stdout_path: Option<PathBuf>,
    #[serde(default)]
    stderr_path: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl CommandSpec {
    pub fn builder(command: impl Into<String>, task_dir: impl Into<PathBuf>) -> CommandSpecBuilder {
        CommandSpecBuilder::new(command, task_dir)
    }

    pub fn command(&self) -> &str {
        &self.command
    }
    pub fn args(&self) -> &[String] {
        &self.args
    }
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }
    pub fn task_dir(&self) -> &PathBuf {
        &self.task_dir
    }
    pub fn work_dir(&self) -> Option<&PathBuf> {
        self.work_dir.as_ref()
    }
    pub fn resource_limits(&self) -> bool {
        self.resource_limits
    }
    pub fn resources(&self) -> &Resources {
        &self.resources
    }
    pub fn pid_mode(&self) -> IsolationMode {
        self.pid_mode
    }
    pub fn ipc_mode(&self) -> IsolationMode {
        self.ipc_mode
    }
    pub fn cap_add(&self) -> &[String] {
        &self.cap_add
    }
    pub fn cap_drop(&self) -> &[String] {
        &self.cap_drop
    }
    pub fn devices(&self) -> &[DeviceConfig] {
        &self.devices
    }
    pub fn mounts(&self) -> &[MountConfig] {
        &self.mounts
    }
    pub fn oom_score_adj(&self) -> i32 {
        self.oom_score_adj
    }
    pub fn denied_envvars(&self) -> &[String] {
        &self.denied_envvars
    }
    pub fn stdout_path(&self) -> Option<&PathBuf> {
        self.stdout_path.as_ref()
    }
    pub fn stderr_path(&self) -> Option<&PathBuf> {
        self.stderr_path.as_ref()
    }
}

/// Builder for [`CommandSpec`].
#[derive(Clone, Debug)]
pub struct CommandSpecBuilder {
    spec: CommandSpec,
}

impl CommandSpecBuilder {
    pub fn new(command: impl Into<String>, task_dir: impl Into<PathBuf>) -> Self {
        Self {
            spec: CommandSpec {
                command: command.into(),
                args: Vec::new(),
                env: BTreeMap::new(),
                user: None,
                task_dir: task_dir.into(),
                work_dir: None,
                resource_limits: true,
                resources: Resources::default(),
                pid_mode: IsolationMode::Host,
                ipc_mode: IsolationMode::Host,
                cap_add: Vec::new(),
                cap_drop: Vec::new(),
                devices: Vec::new(),
                mounts: Vec::new(),
                oom_score_adj: 0,
                denied_envvars: Vec::new(),
                stdout_path: None,
                stderr_path: None,
            },
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.spec.env.extend(env);
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.spec.user = Some(user.into());
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spec.work_dir = Some(dir.into());
        self
    }

    pub fn resource_limits(mut self, enabled: bool) -> Self {
        self.spec.resource_limits = enabled;
        self
    }

    pub fn resources(mut self, resources: Resources) -> Self {
        self.spec.resources = resources;
        self
    }

    pub fn memory_bytes(mut self, bytes: u64) -> Self {
        self.spec.resources.memory_bytes = Some(bytes);
        self
    }

    pub fn cpu_shares(mut self, shares: u64) -> Self {
        self.spec.resources.cpu_shares = Some(shares);
        self
    }

    pub fn cpuset_cgroup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.resources.cpuset_cgroup_path = Some(path.into());
        self
    }

    pub fn cpuset_cpus(mut self, cpus: impl Into<String>) -> Self {
        self.spec.resources.cpuset_cpus = Some(cpus.into());
        self
    }

    pub fn override_cgroup_v1(mut self, controller: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.spec
            .resources
            .override_cgroup_v1
            .insert(controller.into(), path.into());
        self
    }

    pub fn override_cgroup_v2(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.resources.override_cgroup_v2 = Some(path.into());
        self
    }

    pub fn pid_mode(mut self, mode: IsolationMode) -> Self {
        self.spec.pid_mode = mode;
        self
    }

    pub fn ipc_mode(mut self, mode: IsolationMode) -> Self {
        self.spec.ipc_mode = mode;
        self
    }

    pub fn cap_add(mut self, cap: impl Into<String>) -> Self {
        self.spec.cap_add.push(cap.into());
        self
    }

    pub fn cap_drop(mut self, cap: impl Into<String>) -> Self {
        self.spec.cap_drop.push(cap.into());
        self
    }

    pub fn device(mut self, device: DeviceConfig) -> Self {
        self.spec.devices.push(device);
        self
    }

    pub fn mount(mut self, mount: MountConfig) -> Self {
        self.spec.mounts.push(mount);
        self
    }

    pub fn oom_score_adj(mut self, adj: i32) -> Self {
        self.spec.oom_score_adj = adj;
        self
    }

    pub fn deny_envvar(mut self, pattern: impl Into<String>) -> Self {
        self.spec.denied_envvars.push(pattern.into());
        self
    }

    pub fn stdout_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.stdout_path = Some(path.into());
        self
    }

    pub fn stderr_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.stderr_path = Some(path.into());
        self
    }

    pub fn build(self) -> CommandSpec {
        self.spec
    }
}

/// Lifecycle position of a launcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LauncherState {
    Created,
    Launched,
    Running,
    Exited,
    Killed,
    OomKilled,
    TornDown,
}

impl LauncherState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LauncherState::Exited
                | LauncherState::Killed
                | LauncherState::OomKilled
                | LauncherState::TornDown
        )
    }
}

/// Observed state of the launched process.
///
/// Written once by the reaper and cached for every later observer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessState {
    pub pid: i32,
    pub started_at: DateTime<Utc>,
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub oom_killed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessState {
    pub fn started(pid: i32, started_at: DateTime<Utc>) -> Self {
        Self {
            pid,
            started_at,
            exit_code: 0,
            signal: None,
            oom_killed: false,
            completed_at: None,
        }
    }

    pub fn has_exited(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn successful(&self) -> bool {
        self.has_exited() && self.exit_code == 0 && self.signal.is_none() && !self.oom_killed
    }
}

/// Result of an auxiliary command run inside a live sandbox.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// stdout and stderr interleaved in arrival order
    pub combined: Vec<u8>,
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub timed_out: bool,
    pub truncated: bool,
}

impl ExecOutput {
    pub fn successful(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none() && !self.timed_out
    }
}

/// Error type for taskbox operations
#[derive(Error, Debug)]
pub enum TaskboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Configuration(String),

    #[error("file {cmd} not found under path {root}")]
    BinaryNotFound { cmd: String, root: String },

    #[error("path {path} escapes the sandbox root")]
    Escape { path: String },

    #[error("Launch error: {0}")]
    Launch(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Namespace isolation error: {0}")]
    Namespace(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("process is not running")]
    NotRunning,

    #[error("wait cancelled")]
    WaitCancelled,

    #[error("Cleanup error: {0}")]
    Cleanup(String),
}

impl TaskboxError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, TaskboxError::Configuration(_))
    }

    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            TaskboxError::BinaryNotFound { .. } | TaskboxError::Escape { .. }
        )
    }

    pub fn is_launch(&self) -> bool {
        matches!(
            self,
            TaskboxError::Launch(_)
                | TaskboxError::Cgroup(_)
                | TaskboxError::Namespace(_)
                | TaskboxError::Privilege(_)
                | TaskboxError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TaskboxError>;
