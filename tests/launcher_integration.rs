//! End-to-end launcher tests.
//!
//! These need root to create namespaces and mounts; the resource tests also
//! need a writable cgroup hierarchy. Each test skips early otherwise.

use nix::unistd::Uid;
use serial_test::serial;
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use taskbox::config::config::{CgroupModeSetting, ExecutorConfig};
use taskbox::kernel::capabilities::CapabilityProfile;
use taskbox::kernel::cgroup::CgroupMode;
use taskbox::{
    CancelToken, CommandSpec, DeviceConfig, IsolationMode, LauncherState, MountConfig, ProcessLauncher,
    TaskboxError,
};

const HOST_DIRS: [&str; 5] = ["/bin", "/sbin", "/lib", "/lib64", "/usr"];

fn is_root() -> bool {
    if !Uid::effective().is_root() {
        eprintln!("skipping: requires root");
        return false;
    }
    true
}

fn has_cgroups() -> bool {
    if !ExecutorConfig::default().resolved_cgroup_mode().is_enabled() {
        eprintln!("skipping: cgroups unavailable");
        return false;
    }
    true
}

fn no_cgroups() -> ExecutorConfig {
    ExecutorConfig {
        cgroup_mode: CgroupModeSetting::Off,
        kill_wait_ms: 2_000,
        ..ExecutorConfig::default()
    }
}

fn task_root() -> tempfile::TempDir {
    tempfile::tempdir().unwrap()
}

fn shell(root: &Path, script: &str) -> taskbox::config::types::CommandSpecBuilder {
    let mut builder = CommandSpec::builder("/bin/sh", root).args(["-c", script]);
    for dir in HOST_DIRS.iter().map(Path::new).filter(|d| d.exists()) {
        builder = builder.mount(MountConfig {
            host_path: dir.to_path_buf(),
            task_path: dir.to_path_buf(),
            readonly: true,
        });
    }
    builder
}

fn wait(launcher: &ProcessLauncher) -> taskbox::ProcessState {
    launcher
        .wait_timeout(Duration::from_secs(30))
        .unwrap()
        .expect("task did not exit")
}

#[test]
#[serial]
fn test_exit_code_and_output_file() {
    if !is_root() {
        return;
    }
    let root = task_root();
    let logs = tempfile::tempdir().unwrap();
    let stdout = logs.path().join("stdout.log");

    let launcher = ProcessLauncher::new(no_cgroups());
    let spec = shell(root.path(), "echo hello from $USER; exit 3")
        .stdout_path(&stdout)
        .build();
    let started = launcher.launch(spec).unwrap();
    assert!(started.pid > 0);

    let state = wait(&launcher);
    assert_eq!(state.exit_code, 3);
    assert_eq!(state.signal, None);
    assert!(!state.oom_killed);
    assert!(state.completed_at.is_some());
    assert!(launcher.wait_torn_down(Duration::from_secs(10)));
    assert_eq!(launcher.state(), LauncherState::TornDown);
    assert_eq!(fs::read_to_string(&stdout).unwrap(), "hello from root\n");
}

#[test]
#[serial]
fn test_waiters_share_state_and_cancel_is_local() {
    if !is_root() {
        return;
    }
    let root = task_root();
    let launcher = Arc::new(ProcessLauncher::new(no_cgroups()));
    launcher.launch(shell(root.path(), "sleep 0.3; exit 7").build()).unwrap();

    let token = CancelToken::new();
    let cancelled = {
        let (launcher, token) = (launcher.clone(), token.clone());
        thread::spawn(move || launcher.wait(&token))
    };
    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let launcher = launcher.clone();
            thread::spawn(move || launcher.wait(&CancelToken::new()))
        })
        .collect();

    token.cancel();
    assert!(matches!(cancelled.join().unwrap(), Err(TaskboxError::WaitCancelled)));
    for waiter in waiters {
        assert_eq!(waiter.join().unwrap().unwrap().exit_code, 7);
    }
    // Cached after exit
    assert_eq!(launcher.wait(&CancelToken::new()).unwrap().exit_code, 7);
}

#[test]
#[serial]
fn test_shutdown_escalates_in_pid_namespace() {
    if !is_root() {
        return;
    }
    let root = task_root();
    let launcher = Arc::new(ProcessLauncher::new(no_cgroups()));
    // Records every SIGTERM and keeps running
    let spec = shell(
        root.path(),
        "trap 'echo TERM >> /signals' TERM; while :; do sleep 0.05; done",
    )
    .pid_mode(IsolationMode::Private)
    .build();
    launcher.launch(spec).unwrap();
    thread::sleep(Duration::from_millis(200));

    let second = {
        let launcher = launcher.clone();
        thread::spawn(move || launcher.shutdown("TERM", Duration::from_millis(300)))
    };
    launcher.shutdown("SIGTERM", Duration::from_millis(300)).unwrap();
    second.join().unwrap().unwrap();

    let state = wait(&launcher);
    assert_eq!(state.signal, Some(libc::SIGKILL));
    assert_eq!(state.exit_code, 128 + libc::SIGKILL);
    assert!(launcher.state().is_terminal());
    let signals = fs::read_to_string(root.path().join("signals")).unwrap();
    assert_eq!(signals, "TERM\n", "exactly one SIGTERM before the SIGKILL");

    // After exit it is a no-op
    launcher.shutdown("SIGKILL", Duration::ZERO).unwrap();
}

#[test]
#[serial]
fn test_task_outlives_launching_thread() {
    if !is_root() {
        return;
    }
    let root = task_root();
    let launcher = Arc::new(ProcessLauncher::new(no_cgroups()));
    {
        let launcher = launcher.clone();
        let spec = shell(root.path(), "sleep 1; exit 5").build();
        thread::spawn(move || launcher.launch(spec).map(|_| ()))
            .join()
            .unwrap()
            .unwrap();
    }

    // The launching thread is gone; the task must not be killed with it
    assert!(launcher.wait_timeout(Duration::from_millis(500)).unwrap().is_none());
    let state = wait(&launcher);
    assert_eq!(state.exit_code, 5);
    assert_eq!(state.signal, None);
}

#[test]
#[serial]
fn test_shutdown_graceful_exit() {
    if !is_root() {
        return;
    }
    let root = task_root();
    let launcher = ProcessLauncher::new(no_cgroups());
    launcher
        .launch(shell(root.path(), "trap 'exit 0' TERM; while :; do sleep 0.05; done").build())
        .unwrap();
    thread::sleep(Duration::from_millis(200));

    launcher.shutdown("", Duration::from_secs(5)).unwrap();
    let state = wait(&launcher);
    assert_eq!(state.exit_code, 0);
    assert_eq!(state.signal, None);
}

#[test]
#[serial]
fn test_exec_inside_sandbox() {
    if !is_root() {
        return;
    }
    let root = task_root();
    fs::write(root.path().join("marker"), "inside\n").unwrap();
    std::env::set_var("TASKBOX_AGENT_MARKER", "agent-only");
    let launcher = ProcessLauncher::new(no_cgroups());
    launcher
        .launch(
            shell(root.path(), "sleep 30")
                .env("GREETING", "hi")
                .pid_mode(IsolationMode::Private)
                .ipc_mode(IsolationMode::Private)
                .build(),
        )
        .unwrap();

    let args = vec![
        "-c".to_string(),
        "cat /marker; echo $GREETING; echo oops >&2; exit 4".to_string(),
    ];
    let output = launcher.exec("/bin/sh", &args, Duration::from_secs(10)).unwrap();
    assert_eq!(output.exit_code, 4);
    assert!(!output.timed_out);
    assert_eq!(String::from_utf8_lossy(&output.stdout), "inside\nhi\n");
    assert_eq!(String::from_utf8_lossy(&output.stderr), "oops\n");
    assert_eq!(output.combined.len(), output.stdout.len() + output.stderr.len());

    // Only the task's own environment, none of the agent's
    let env = launcher.exec("env", &[], Duration::from_secs(10)).unwrap();
    let env = String::from_utf8_lossy(&env.stdout).into_owned();
    assert!(env.lines().any(|l| l == "GREETING=hi"), "{}", env);
    assert!(env.lines().any(|l| l == "USER=root"), "{}", env);
    assert!(!env.contains("TASKBOX_AGENT_MARKER"), "{}", env);
    std::env::remove_var("TASKBOX_AGENT_MARKER");

    let slow = launcher
        .exec("/bin/sh", &["-c".to_string(), "sleep 10".to_string()], Duration::from_millis(200))
        .unwrap();
    assert!(slow.timed_out);
    assert_eq!(slow.signal, Some(libc::SIGKILL));

    launcher.shutdown("SIGKILL", Duration::ZERO).unwrap();
    wait(&launcher);
    assert!(matches!(
        launcher.exec("/bin/true", &[], Duration::from_secs(1)),
        Err(TaskboxError::NotRunning)
    ));
}

#[test]
#[serial]
fn test_capability_masks_match_on_live_task() {
    if !is_root() {
        return;
    }
    let root = task_root();
    let launcher = ProcessLauncher::new(no_cgroups());
    let spec = shell(root.path(), "exec sleep 30")
        .cap_drop("all")
        .cap_add("net_bind_service")
        .build();
    let started = launcher.launch(spec).unwrap();
    thread::sleep(Duration::from_millis(100));

    let profile = CapabilityProfile::read_from_status(started.pid).unwrap();
    for mask in [
        profile.inheritable,
        profile.permitted,
        profile.effective,
        profile.bounding,
        profile.ambient,
    ] {
        assert_eq!(mask.bits(), 0x400, "{}", profile);
    }

    launcher.shutdown("SIGKILL", Duration::ZERO).unwrap();
    wait(&launcher);
}

/// Restores the test process's oom_score_adj on drop.
struct OomScoreGuard(String);

impl OomScoreGuard {
    fn set(value: i32) -> Self {
        let previous = fs::read_to_string("/proc/self/oom_score_adj").unwrap();
        fs::write("/proc/self/oom_score_adj", value.to_string()).unwrap();
        Self(previous.trim().to_string())
    }
}

impl Drop for OomScoreGuard {
    fn drop(&mut self) {
        let _ = fs::write("/proc/self/oom_score_adj", &self.0);
    }
}

fn task_oom_score(spec: CommandSpec) -> String {
    let launcher = ProcessLauncher::new(no_cgroups());
    let started = launcher.launch(spec).unwrap();
    let score = fs::read_to_string(format!("/proc/{}/oom_score_adj", started.pid)).unwrap();
    launcher.shutdown("SIGKILL", Duration::ZERO).unwrap();
    wait(&launcher);
    score.trim().to_string()
}

#[test]
#[serial]
fn test_oom_score_not_inherited_from_agent() {
    if !is_root() {
        return;
    }
    let root = task_root();
    let _guard = OomScoreGuard::set(500);

    assert_eq!(task_oom_score(shell(root.path(), "exec sleep 30").build()), "0");
    assert_eq!(
        task_oom_score(shell(root.path(), "exec sleep 30").oom_score_adj(100).build()),
        "100"
    );
}

#[test]
#[serial]
fn test_extra_device_visible_and_allowed() {
    if !is_root() {
        return;
    }
    if !Path::new("/dev/fuse").exists() {
        eprintln!("skipping: /dev/fuse missing");
        return;
    }
    let root = task_root();
    let mut config = no_cgroups();
    if ExecutorConfig::default().resolved_cgroup_mode().is_enabled() {
        config.cgroup_mode = CgroupModeSetting::Auto;
    }
    let launcher = ProcessLauncher::new(config);
    let started = launcher
        .launch(
            shell(root.path(), "exec sleep 30")
                .device(DeviceConfig {
                    host_path: PathBuf::from("/dev/fuse"),
                    task_path: PathBuf::from("/dev/fuse"),
                    permissions: "rwm".to_string(),
                })
                .build(),
        )
        .unwrap();

    assert!(Path::new(&format!("/proc/{}/root/dev/fuse", started.pid)).exists());
    if launcher.config().resolved_cgroup_mode() == CgroupMode::V1 {
        let devices = launcher
            .cgroup_paths()
            .into_iter()
            .find(|p| p.starts_with(launcher.config().cgroup_root.join("devices")))
            .expect("devices cgroup");
        let list = fs::read_to_string(devices.join("devices.list")).unwrap();
        assert!(list.lines().any(|l| l == "c 10:229 rwm"), "{}", list);
    }

    launcher.shutdown("SIGKILL", Duration::ZERO).unwrap();
    wait(&launcher);
}

#[test]
#[serial]
fn test_child_setup_failure_is_launch_error() {
    if !is_root() {
        return;
    }
    let root = task_root();
    let launcher = ProcessLauncher::new(no_cgroups());
    let err = launcher
        .launch(shell(root.path(), "true").work_dir("/does/not/exist").build())
        .unwrap_err();
    assert!(err.is_launch(), "{}", err);
    assert!(err.to_string().contains("/does/not/exist"));
    assert_eq!(launcher.state(), LauncherState::TornDown);
    assert!(matches!(
        launcher.wait(&CancelToken::new()),
        Err(TaskboxError::NotRunning)
    ));
}

#[test]
#[serial]
fn test_cgroup_claimed_and_removed() {
    if !is_root() || !has_cgroups() {
        return;
    }
    let root = task_root();
    let launcher = ProcessLauncher::new(ExecutorConfig::default());
    launcher
        .launch(shell(root.path(), "sleep 0.2").memory_bytes(64 * 1024 * 1024).cpu_shares(512).build())
        .unwrap();

    let paths: Vec<PathBuf> = launcher.cgroup_paths();
    assert!(!paths.is_empty());
    assert!(paths.iter().all(|p| p.is_dir()));

    assert_eq!(wait(&launcher).exit_code, 0);
    assert!(launcher.wait_torn_down(Duration::from_secs(10)));
    assert!(paths.iter().all(|p| !p.exists()), "{:?}", paths);
}

#[test]
#[serial]
fn test_oom_kill_is_reported() {
    if !is_root() || !has_cgroups() {
        return;
    }
    let root = task_root();
    let launcher = ProcessLauncher::new(ExecutorConfig::default());
    let spec = shell(
        root.path(),
        "x=$(head -c 268435456 /dev/zero | tr '\\0' a); echo ${#x}",
    )
    .memory_bytes(32 * 1024 * 1024)
    .build();
    launcher.launch(spec).unwrap();

    let state = wait(&launcher);
    assert!(state.oom_killed, "{:?}", state);
    assert!(launcher.wait_torn_down(Duration::from_secs(10)));
    assert_eq!(launcher.state(), LauncherState::TornDown);
}

#[test]
#[serial]
fn test_stale_occupant_swept_before_launch() {
    if !is_root() || !has_cgroups() {
        return;
    }
    let config = ExecutorConfig::default();
    if config.resolved_cgroup_mode() != CgroupMode::V2 {
        eprintln!("skipping: needs the unified hierarchy");
        return;
    }
    let group = config
        .cgroup_root
        .join(format!("taskbox-stale-{}", uuid::Uuid::new_v4()));
    fs::create_dir(&group).unwrap();
    let mut stale = Command::new("sleep").arg("60").spawn().unwrap();
    fs::write(group.join("cgroup.procs"), stale.id().to_string()).unwrap();

    let root = task_root();
    let launcher = ProcessLauncher::new(config);
    let started = launcher
        .launch(shell(root.path(), "exec sleep 5").cpuset_cgroup_path(&group).build())
        .unwrap();

    let members = fs::read_to_string(group.join("cgroup.procs")).unwrap();
    assert_eq!(members.trim(), started.pid.to_string());
    // Already reaped by the sweep, or dead and waiting for us
    match stale.try_wait() {
        Ok(Some(status)) => assert_eq!(status.signal(), Some(libc::SIGKILL)),
        Ok(None) => panic!("stale occupant {} still running", stale.id()),
        Err(_) => {}
    }

    launcher.shutdown("SIGKILL", Duration::ZERO).unwrap();
    wait(&launcher);
    assert!(launcher.wait_torn_down(Duration::from_secs(10)));
    assert!(!group.exists());
}
