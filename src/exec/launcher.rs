//! Process launcher: one task process from launch to teardown.
//!
//! `Created -> Launched -> Running -> {Exited | Killed | OomKilled} -> TornDown`
//!
//! Launch resolves the whole isolation profile before any side effect, then
//! sweeps and claims the cgroup. A supervisor thread owned by the launcher
//! clones the child blocked, attaches it and releases it to exec, then
//! stays on as the reaper: it owns `waitpid`, publishes the terminal state
//! once and tears the cgroup down.
use crate::config::config::ExecutorConfig;
use crate::config::types::{
    CommandSpec, ExecOutput, LauncherState, ProcessState, Result, TaskboxError,
};
use crate::config::validator::validate_or_reject;
use crate::core::supervisor::{signal_group, spawn_blocked};
use crate::core::types::LaunchRequest;
use crate::exec::nsexec::{exec_in_sandbox, ExecTarget};
use crate::exec::wait::{CancelToken, ExitWatch, Latch};
use crate::kernel::capabilities::{agent_ceiling, CapabilitySet};
use crate::kernel::cgroup::{
    open_backend, sweep_stale_occupants, CgroupBackend, CgroupLimits, CgroupMode,
    CgroupPathResolver, CpuShareNormalizer,
};
use crate::kernel::credentials::TaskUser;
use crate::kernel::devices::{build_device_rules, DeviceRule};
use crate::kernel::mount::SandboxMounts;
use crate::kernel::namespace::build_namespaces;
use crate::kernel::signal::parse_signal;
use crate::safety::cleanup::CgroupCleanup;
use crate::safety::sandbox_root::SandboxRoot;
use crate::utils::env_hygiene::{build_env_list, EnvPolicy};
use chrono::Utc;
use crossbeam_channel::{bounded, Sender};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

/// Cgroup claimed for one launch.
struct TaskCgroup {
    cleanup: Arc<CgroupCleanup>,
    /// OOM-kill counter sampled before the task started
    oom_before: u64,
}

impl TaskCgroup {
    fn backend(&self) -> &Arc<dyn CgroupBackend> {
        self.cleanup.backend()
    }
}

/// What later operations need from a running launch.
struct RunningTask {
    pid: i32,
    exec: ExecTarget,
    cgroup_paths: Vec<PathBuf>,
}

struct Shared {
    phase: Mutex<LauncherState>,
    exit: ExitWatch,
    torn_down: Latch,
    shutdown_started: AtomicBool,
    shutdown_done: Latch,
    task: OnceLock<RunningTask>,
}

impl Shared {
    fn phase(&self) -> LauncherState {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, id: &str, next: LauncherState) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        debug!("Launcher {}: {:?} -> {:?}", id, *phase, next);
        *phase = next;
    }
}

/// Launches and supervises a single task process.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct ProcessLauncher {
    id: String,
    config: ExecutorConfig,
    claimed: AtomicBool,
    shared: Arc<Shared>,
}

impl ProcessLauncher {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            claimed: AtomicBool::new(false),
            shared: Arc::new(Shared {
                phase: Mutex::new(LauncherState::Created),
                exit: ExitWatch::new(),
                torn_down: Latch::new(),
                shutdown_started: AtomicBool::new(false),
                shutdown_done: Latch::new(),
                task: OnceLock::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn state(&self) -> LauncherState {
        self.shared.phase()
    }

    /// Host PID of the task once it is running.
    pub fn pid(&self) -> Option<i32> {
        self.shared.task.get().map(|task| task.pid)
    }

    /// Cgroup directories claimed by the launch.
    pub fn cgroup_paths(&self) -> Vec<PathBuf> {
        self.shared
            .task
            .get()
            .map(|task| task.cgroup_paths.clone())
            .unwrap_or_default()
    }

    /// Cached terminal state, if the task has exited.
    pub fn process_state(&self) -> Option<ProcessState> {
        self.shared.exit.get().cloned()
    }

    /// Start the task described by `spec`.
    ///
    /// Configuration and resolution errors surface before anything is
    /// created. A launcher runs at most one process.
    pub fn launch(&self, spec: CommandSpec) -> Result<ProcessState> {
        if self.claimed.swap(true, Ordering::SeqCst) {
            return Err(TaskboxError::Launch(format!(
                "launcher {} has already been used",
                self.id
            )));
        }

        match self.try_launch(&spec) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!("Launch of {} failed: {}", spec.command(), e);
                self.shared.set_phase(&self.id, LauncherState::TornDown);
                self.shared.exit.abandon();
                self.shared.torn_down.close();
                Err(e)
            }
        }
    }

    fn try_launch(&self, spec: &CommandSpec) -> Result<ProcessState> {
        validate_or_reject(spec)?;

        let user = TaskUser::resolve(spec.user())?;
        let namespaces = build_namespaces(spec.pid_mode(), spec.ipc_mode());
        let ceiling = agent_ceiling();
        let baseline = CapabilitySet::baseline_for_uid(user.uid, ceiling);
        let capabilities =
            CapabilitySet::calculate(baseline, spec.cap_add(), spec.cap_drop())?.within(ceiling);
        let devices = build_device_rules(self.config.default_devices, spec.devices())?;
        let policy = EnvPolicy::new(self.config.denied_envvars.as_slice(), spec.denied_envvars())?;
        let env = build_env_list(spec.env(), &policy, Some(&user));
        let binary = SandboxRoot::new(spec.task_dir(), spec.mounts()).resolve_binary(spec.command())?;
        let work_dir = spec
            .work_dir()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("/"));

        debug!(
            "Launcher {}: {} -> {}, namespaces {:?}, capabilities {}",
            self.id,
            spec.command(),
            binary.host_path.display(),
            namespaces.names(),
            capabilities
        );

        let mut argv = vec![spec.command().to_string()];
        argv.extend(spec.args().iter().cloned());
        let request = LaunchRequest {
            task_path: binary.task_path.clone(),
            argv,
            env: env.clone(),
            work_dir: work_dir.clone(),
            uid: user.uid,
            gid: user.gid,
            capabilities,
            oom_score_adj: spec.oom_score_adj(),
            mounts: SandboxMounts::new(spec.task_dir(), spec.mounts(), &devices),
            stdout_path: spec.stdout_path().cloned(),
            stderr_path: spec.stderr_path().cloned(),
        };

        let cgroup = self.claim_cgroup(spec, &devices)?;
        let exec = ExecTarget {
            pid: 0,
            namespaces,
            uid: user.uid,
            gid: user.gid,
            capabilities,
            env,
            work_dir,
            output_limit: self.config.exec_output_limit,
        };

        // The parent-death signal is tied to the thread that clones, so the
        // clone happens on the thread that lives as long as the task.
        let (report_tx, report_rx) = bounded(1);
        let shared = self.shared.clone();
        let id = self.id.clone();
        let cleanup = cgroup.as_ref().map(|c| c.cleanup.clone());
        let spawned = thread::Builder::new()
            .name(format!("task-{}", self.id))
            .spawn(move || supervise_task(shared, id, request, exec, cgroup, report_tx));
        if let Err(e) = spawned {
            if let Some(cleanup) = &cleanup {
                cleanup.teardown();
            }
            return Err(TaskboxError::Launch(format!(
                "Failed to start supervisor thread: {}",
                e
            )));
        }

        let started = match report_rx.recv() {
            Ok(result) => result?,
            Err(_) => {
                if let Some(cleanup) = &cleanup {
                    cleanup.teardown();
                }
                return Err(TaskboxError::Launch(
                    "supervisor thread exited before the task started".to_string(),
                ));
            }
        };
        info!(
            "Launched {} as pid {} (launcher {})",
            spec.command(),
            started.pid,
            self.id
        );
        Ok(started)
    }

    /// Resolve, sweep and create the task's cgroup with its limits applied.
    fn claim_cgroup(&self, spec: &CommandSpec, devices: &[DeviceRule]) -> Result<Option<TaskCgroup>> {
        if !spec.resource_limits() {
            debug!("Launcher {}: resource limits disabled", self.id);
            return Ok(None);
        }

        let mode = self.config.resolved_cgroup_mode();
        let leaf = match mode {
            CgroupMode::V2 => format!("{}.scope", self.id),
            _ => self.id.clone(),
        };
        let resolver = CgroupPathResolver::new(mode, &self.config.cgroup_root)
            .with_overrides(spec.resources());
        let Some(layout) = resolver.layout(
            &self.config.cgroup_parent,
            &leaf,
            spec.resources().cpuset_cgroup_path.as_deref(),
        ) else {
            info!("Cgroups unavailable, launching without resource limits");
            return Ok(None);
        };
        let Some(backend) = open_backend(&layout) else {
            return Ok(None);
        };
        let backend: Arc<dyn CgroupBackend> = Arc::from(backend);

        let sweep = sweep_stale_occupants(backend.as_ref(), self.config.sweep_timeout());
        if !sweep.killed.is_empty() {
            warn!(
                "Killed stale occupants {:?} of {:?}",
                sweep.killed,
                backend.paths()
            );
        }
        if let Some(e) = &sweep.list_error {
            warn!("Could not verify {:?} is empty: {}", backend.paths(), e);
        } else if !sweep.is_clean() {
            warn!(
                "Stale occupants {:?} of {:?} survived the sweep",
                sweep.remaining,
                backend.paths()
            );
        }

        let cleanup = Arc::new(CgroupCleanup::from_config(backend.clone(), &self.config));
        let resources = spec.resources();
        let normalizer = CpuShareNormalizer::new(self.config.resolved_total_compute());
        let limits = CgroupLimits {
            memory_bytes: resources.memory_bytes,
            cpu_shares: resources.cpu_shares.map(|shares| normalizer.clamp(shares)),
            cpuset_cpus: resources.cpuset_cpus.clone(),
            devices: devices.to_vec(),
        };

        if let Err(e) = backend.create().and_then(|()| backend.apply_limits(&limits)) {
            cleanup.teardown();
            return Err(e);
        }

        let oom_before = backend.oom_kill_count().unwrap_or_else(|e| {
            warn!("Failed to read OOM counter for {:?}: {}", backend.paths(), e);
            0
        });
        info!(
            "Claimed {} cgroup {:?} (launcher {})",
            backend.backend_name(),
            backend.paths(),
            self.id
        );
        Ok(Some(TaskCgroup {
            cleanup,
            oom_before,
        }))
    }

    /// Block until the task exits or `cancel` fires.
    pub fn wait(&self, cancel: &CancelToken) -> Result<ProcessState> {
        if self.state() == LauncherState::Created {
            return Err(TaskboxError::NotRunning);
        }
        self.shared.exit.wait(cancel)
    }

    /// `Ok(None)` when the task is still running after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<ProcessState>> {
        if self.state() == LauncherState::Created {
            return Err(TaskboxError::NotRunning);
        }
        Ok(self.shared.exit.wait_timeout(timeout))
    }

    /// Block until teardown has finished; `false` on timeout.
    pub fn wait_torn_down(&self, timeout: Duration) -> bool {
        self.shared.torn_down.wait_timeout(timeout)
    }

    /// Signal the task's process group, escalating to SIGKILL after `grace`.
    ///
    /// A no-op before launch or after exit. A second caller never sends a
    /// second escalation; it waits for the first one to finish.
    pub fn shutdown(&self, signal: &str, grace: Duration) -> Result<()> {
        let signal = parse_signal(signal)?;
        let Some(task) = self.shared.task.get() else {
            debug!("Launcher {}: shutdown before launch is a no-op", self.id);
            return Ok(());
        };
        if self.shared.exit.get().is_some() {
            return Ok(());
        }

        if self.shared.shutdown_started.swap(true, Ordering::SeqCst) {
            debug!("Launcher {}: shutdown already in progress", self.id);
            // Nothing is sent; returns once the first caller closes the latch
            let _ = self.shared.shutdown_done.receiver().recv();
            return Ok(());
        }

        let result = self.escalate(task.pid, signal, grace);
        self.shared.shutdown_done.close();
        result
    }

    fn escalate(&self, pid: i32, signal: Signal, grace: Duration) -> Result<()> {
        info!("Sending {} to task {} (grace {:?})", signal, pid, grace);
        if !signal_group(pid, signal)? {
            return Ok(());
        }
        if self.shared.exit.wait_timeout(grace).is_some() {
            return Ok(());
        }

        info!("Task {} still running after {:?}, sending SIGKILL", pid, grace);
        signal_group(pid, Signal::SIGKILL)?;
        if self.shared.exit.wait_timeout(self.config.kill_wait()).is_none() {
            warn!(
                "Task {} not reaped {:?} after SIGKILL",
                pid,
                self.config.kill_wait()
            );
        }
        Ok(())
    }

    /// Run a one-off command inside the running task's sandbox.
    pub fn exec(&self, cmd: &str, args: &[String], timeout: Duration) -> Result<ExecOutput> {
        if self.state() != LauncherState::Running {
            return Err(TaskboxError::NotRunning);
        }
        let task = self.shared.task.get().ok_or(TaskboxError::NotRunning)?;
        exec_in_sandbox(&task.exec, cmd, args, timeout)
    }
}

fn wait_for_exit(pid: Pid) -> Option<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(status @ WaitStatus::Exited(..)) | Ok(status @ WaitStatus::Signaled(..)) => {
                return Some(status)
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("waitpid({}) failed: {}", pid, e);
                return None;
            }
        }
    }
}

/// Supervisor thread body: clone the child blocked, attach it to its
/// cgroup, release it and report back to the launching thread. From then
/// on the thread is the task's reaper.
fn supervise_task(
    shared: Arc<Shared>,
    id: String,
    request: LaunchRequest,
    mut exec: ExecTarget,
    cgroup: Option<TaskCgroup>,
    report: Sender<Result<ProcessState>>,
) {
    let fail = |cgroup: &Option<TaskCgroup>, e: TaskboxError| {
        if let Some(cgroup) = cgroup {
            cgroup.cleanup.teardown();
        }
        let _ = report.send(Err(e));
    };

    let child = match spawn_blocked(&exec.namespaces) {
        Ok(child) => child,
        Err(e) => return fail(&cgroup, e),
    };
    let pid = child.pid().as_raw();
    shared.set_phase(&id, LauncherState::Launched);

    if let Some(task_cgroup) = &cgroup {
        if let Err(e) = task_cgroup.backend().attach_process(pid) {
            child.abort();
            return fail(&cgroup, e);
        }
    }
    if let Err(e) = child.release(&request) {
        return fail(&cgroup, e);
    }

    let started = ProcessState::started(pid, Utc::now());
    exec.pid = pid;
    let cgroup_paths = cgroup
        .as_ref()
        .map(|c| c.backend().paths())
        .unwrap_or_default();
    let _ = shared.task.set(RunningTask {
        pid,
        exec,
        cgroup_paths,
    });
    shared.set_phase(&id, LauncherState::Running);
    if report.send(Ok(started.clone())).is_err() {
        warn!("Launcher {}: launching thread went away, supervising pid {} anyway", id, pid);
    }

    reap_and_teardown(shared, id, started, cgroup);
}

/// Reaper body: wait, publish, tear down.
fn reap_and_teardown(
    shared: Arc<Shared>,
    id: String,
    started: ProcessState,
    cgroup: Option<TaskCgroup>,
) {
    let pid = started.pid;
    let mut state = started;

    match wait_for_exit(Pid::from_raw(pid)) {
        Some(WaitStatus::Exited(_, code)) => state.exit_code = code,
        Some(WaitStatus::Signaled(_, signal, _)) => {
            state.signal = Some(signal as i32);
            state.exit_code = 128 + signal as i32;
        }
        _ => state.exit_code = -1,
    }
    state.completed_at = Some(Utc::now());

    if let Some(cgroup) = &cgroup {
        let after = cgroup.backend().oom_kill_count().unwrap_or(cgroup.oom_before);
        let abnormal = state.signal.is_some() || state.exit_code != 0;
        state.oom_killed = after > cgroup.oom_before && abnormal;
    }

    let phase = if state.oom_killed {
        LauncherState::OomKilled
    } else if state.signal.is_some() {
        LauncherState::Killed
    } else {
        LauncherState::Exited
    };
    info!(
        "Task {} finished: exit_code={} signal={:?} oom_killed={}",
        pid, state.exit_code, state.signal, state.oom_killed
    );
    shared.set_phase(&id, phase);
    shared.exit.publish(state);

    if let Some(cgroup) = cgroup {
        let report = cgroup.cleanup.teardown();
        debug!("Cgroup teardown for {}: {:?}", id, report);
    }
    shared.set_phase(&id, LauncherState::TornDown);
    shared.torn_down.close();
}
