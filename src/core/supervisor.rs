//! Parent side of the launch handshake.
//!
//! The child is cloned into its namespaces and parks on the launch pipe, so
//! the agent can place it in its cgroup before any task code runs.
use crate::config::types::{Result, TaskboxError};
use crate::core::proxy::child_main;
use crate::core::types::{ChildStatus, LaunchRequest};
use crate::kernel::namespace::NamespaceSet;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sched::clone;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{pipe2, Pid};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;

const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// A cloned child waiting for its launch request.
pub struct PendingChild {
    pid: Pid,
    launch: File,
    status: File,
}

fn process_error(prefix: &str, err: impl std::fmt::Display) -> TaskboxError {
    TaskboxError::Launch(format!("{}: {}", prefix, err))
}

/// Clone a child into `namespaces` and leave it blocked.
pub fn spawn_blocked(namespaces: &NamespaceSet) -> Result<PendingChild> {
    let (launch_read, launch_write) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| process_error("pipe(launch)", e))?;
    let (status_read, status_write) =
        pipe2(OFlag::O_CLOEXEC).map_err(|e| process_error("pipe(status)", e))?;

    let child_launch = launch_read.as_raw_fd();
    let child_status = status_write.as_raw_fd();
    let parent_launch = launch_write.as_raw_fd();
    let parent_status = status_read.as_raw_fd();

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let callback: Box<dyn FnMut() -> isize> = Box::new(move || {
        // Parent ends must go, or the launch pipe never reaches EOF
        let _ = nix::unistd::close(parent_launch);
        let _ = nix::unistd::close(parent_status);
        child_main(child_launch, child_status)
    });

    // SAFETY: without CLONE_VM the child runs on a private copy of memory and
    // leaves only through execve or _exit.
    let pid = unsafe {
        clone(
            callback,
            &mut stack,
            namespaces.clone_flags(),
            Some(libc::SIGCHLD),
        )
    }
    .map_err(|e| match e {
        Errno::EPERM => TaskboxError::Namespace(format!(
            "creating {:?} namespaces requires root: {}",
            namespaces.names(),
            e
        )),
        other => process_error("clone", other),
    })?;

    drop(launch_read);
    drop(status_write);
    log::debug!("Cloned task child {} into {:?}", pid, namespaces.names());

    Ok(PendingChild {
        pid,
        launch: File::from(launch_write),
        status: File::from(status_read),
    })
}

impl PendingChild {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Send the request and wait for the child to exec.
    ///
    /// On any failure the child is reaped before returning.
    pub fn release(self, request: &LaunchRequest) -> Result<()> {
        let PendingChild { pid, launch, status } = self;
        match handshake(launch, status, request) {
            Ok(None) => Ok(()),
            Ok(Some(failure)) => {
                reap(pid);
                Err(TaskboxError::Launch(failure.to_string()))
            }
            Err(e) => {
                let _ = kill(pid, Signal::SIGKILL);
                reap(pid);
                Err(e)
            }
        }
    }

    /// Kill and reap a child that will never be released.
    pub fn abort(self) {
        let _ = kill(self.pid, Signal::SIGKILL);
        reap(self.pid);
    }
}

/// Write the request, then read the child's report. `None` means it exec'd.
fn handshake(mut launch: File, mut status: File, request: &LaunchRequest) -> Result<Option<ChildStatus>> {
    let payload = serde_json::to_vec(request)
        .map_err(|e| process_error("failed to encode launch request", e))?;
    launch
        .write_all(&payload)
        .map_err(|e| process_error("failed to send launch request", e))?;
    drop(launch);

    let mut report = Vec::new();
    status
        .read_to_end(&mut report)
        .map_err(|e| process_error("failed to read child status", e))?;
    if report.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&report).unwrap_or_else(|_| {
        ChildStatus::failed("handshake", String::from_utf8_lossy(&report))
    })))
}

fn reap(pid: Pid) {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            Ok(status) => {
                log::debug!("Reaped failed task child {}: {:?}", pid, status);
                break;
            }
            Err(e) => {
                log::warn!("waitpid({}) failed: {}", pid, e);
                break;
            }
        }
    }
}

/// Signal the task's process group.
///
/// Returns `false` when the group no longer exists.
pub fn signal_group(pid: i32, signal: Signal) -> Result<bool> {
    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(process_error(&format!("killpg({}, {})", pid, signal), e)),
    }
}
