//! One-off commands inside a running task's sandbox.
//!
//! The PID namespace is joined by a dedicated thread so only that thread's
//! children land in it. That thread does nothing but fork: after joining,
//! it can no longer create threads. The forked child joins IPC and mount
//! namespaces, enters the task's root, drops to the task's identity and
//! execs. Back on the calling thread, output is captured with a hard byte
//! cap and the command is killed at the deadline.
use crate::config::types::{ExecOutput, Result, TaskboxError};
use crate::core::supervisor::signal_group;
use crate::kernel::capabilities::{apply_profile, keep_caps_across_setuid, restrict_bounding_set, CapabilitySet};
use crate::kernel::credentials::transition_to;
use crate::kernel::namespace::{NamespaceHandles, NamespaceSet};
use crate::safety::sandbox_root::SandboxRoot;
use crate::utils::output::OutputCapture;
use nix::sched::{setns, CloneFlags};
use nix::sys::signal::Signal;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long output pipes may stay open after the command is gone
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

/// What an exec needs to know about the running task.
#[derive(Clone, Debug)]
pub struct ExecTarget {
    /// Host PID of the task
    pub pid: i32,
    pub namespaces: NamespaceSet,
    pub uid: u32,
    pub gid: u32,
    pub capabilities: CapabilitySet,
    /// KEY=VALUE list the task itself was started with
    pub env: Vec<String>,
    pub work_dir: PathBuf,
    pub output_limit: usize,
}

fn to_io(err: TaskboxError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err.to_string())
}

/// Run `cmd` inside `target`'s sandbox, killing it after `timeout`.
pub fn exec_in_sandbox(
    target: &ExecTarget,
    cmd: &str,
    args: &[String],
    timeout: Duration,
) -> Result<ExecOutput> {
    let handles = NamespaceHandles::open(target.pid, &target.namespaces)?;
    let task_root = PathBuf::from(format!("/proc/{}/root", target.pid));
    let binary = SandboxRoot::new(&task_root, &[]).resolve_binary(cmd)?;

    let joined = target.clone();
    let args = args.to_vec();
    let task_path = binary.task_path;
    let forker = thread::Builder::new()
        .name(format!("exec-{}", target.pid))
        .spawn(move || spawn_joined(handles, &joined, &task_path, &args))
        .map_err(|e| TaskboxError::Launch(format!("Failed to start exec thread: {}", e)))?;

    let child = forker
        .join()
        .map_err(|_| TaskboxError::Launch("exec thread panicked".to_string()))??;
    supervise(child, target, timeout)
}

/// Join the task's PID namespace and fork the command. Runs on a throwaway
/// thread, which exits right after.
fn spawn_joined(
    handles: NamespaceHandles,
    target: &ExecTarget,
    task_path: &Path,
    args: &[String],
) -> Result<Child> {
    let NamespaceHandles { pid, ipc, mnt, root } = handles;
    if let Some(pid_ns) = &pid {
        setns(pid_ns, CloneFlags::CLONE_NEWPID)
            .map_err(|e| TaskboxError::Namespace(format!("Failed to join PID namespace: {}", e)))?;
    }

    let mut command = Command::new(task_path);
    command
        .args(args)
        .env_clear()
        .envs(target.env.iter().filter_map(|entry| entry.split_once('=')))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let work_dir = target.work_dir.clone();
    let (uid, gid, caps) = (target.uid, target.gid, target.capabilities);
    // SAFETY: the closure runs in the forked child and only makes syscalls.
    unsafe {
        command.pre_exec(move || {
            if let Some(ipc_ns) = &ipc {
                setns(ipc_ns, CloneFlags::CLONE_NEWIPC)?;
            }
            setns(&mnt, CloneFlags::CLONE_NEWNS)?;
            if libc::fchdir(root.as_raw_fd()) != 0 {
                return Err(io::Error::last_os_error());
            }
            nix::unistd::chroot(".")?;
            nix::unistd::chdir(work_dir.as_path())?;
            nix::unistd::setsid()?;
            restrict_bounding_set(caps).map_err(to_io)?;
            keep_caps_across_setuid().map_err(to_io)?;
            transition_to(uid, gid).map_err(to_io)?;
            apply_profile(caps).map_err(to_io)?;
            Ok(())
        });
    }

    let child = command.spawn().map_err(|e| {
        TaskboxError::Launch(format!("Failed to exec {} in task {}: {}", task_path.display(), target.pid, e))
    })?;
    log::debug!("Exec {} as pid {} in task {}", task_path.display(), child.id(), target.pid);
    Ok(child)
}

/// Capture output and enforce the deadline from the caller's thread.
fn supervise(mut child: Child, target: &ExecTarget, timeout: Duration) -> Result<ExecOutput> {
    let child_pid = child.id() as i32;
    let capture = match OutputCapture::start(child.stdout.take(), child.stderr.take(), target.output_limit) {
        Ok(capture) => capture,
        Err(e) => {
            let _ = signal_group(child_pid, Signal::SIGKILL);
            let _ = child.kill();
            let _ = child.wait();
            return Err(TaskboxError::Launch(format!("Failed to capture exec output: {}", e)));
        }
    };
    let deadline = Instant::now() + timeout;
    let mut timed_out = false;

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            timed_out = true;
            log::info!("Exec in task {} timed out after {:?}, killing", target.pid, timeout);
            if let Err(e) = signal_group(child_pid, Signal::SIGKILL) {
                log::warn!("Failed to kill exec group {}: {}", child_pid, e);
            }
            let _ = child.kill();
            break child.wait()?;
        }
        thread::sleep(POLL_INTERVAL);
    };

    let captured = capture.finish(OUTPUT_DRAIN);
    let (exit_code, signal) = exit_of(status);
    Ok(ExecOutput {
        stdout: captured.stdout,
        stderr: captured.stderr,
        combined: captured.combined,
        exit_code,
        signal,
        timed_out,
        truncated: captured.truncated,
    })
}

/// Exit code with signal deaths reported as 128 + signal.
fn exit_of(status: ExitStatus) -> (i32, Option<i32>) {
    match (status.code(), status.signal()) {
        (Some(code), _) => (code, None),
        (None, Some(sig)) => (128 + sig, Some(sig)),
        (None, None) => (-1, None),
    }
}
