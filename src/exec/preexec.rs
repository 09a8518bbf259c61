/// Ordered child setup between clone and execve
///
/// The sequence is fixed:
/// 1. setsid() and parent-death signal
/// 2. close inherited descriptors, wire stdio
/// 3. reset oom_score_adj to the requested value
/// 4. mount propagation: / to MS_PRIVATE | MS_REC
/// 5. sandbox /dev, /proc and bind mounts, then chroot and chdir
/// 6. bounding set restriction and keep-caps
/// 7. setgroups([]), setresgid, setresuid
/// 8. capset and ambient raise
/// 9. execve
///
/// Each step consumes the previous state, so an out-of-order call does not
/// compile. Only `TaskChild<ExecReady>` can exec.
use crate::config::types::{Result, TaskboxError};
use crate::core::types::LaunchRequest;
use crate::kernel::capabilities::{apply_profile, keep_caps_across_setuid, restrict_bounding_set};
use crate::kernel::credentials::transition_to;
use crate::kernel::mount::enter_root;
use crate::kernel::namespace::harden_mount_propagation;
use crate::utils::fd_closure::close_inherited_fds;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{close, dup2};
use std::convert::Infallible;
use std::ffi::CString;
use std::marker::PhantomData;
use std::os::unix::ffi::OsStrExt;
use std::os::fd::RawFd;
use std::path::Path;

/// Fresh clone, nothing applied yet
pub struct FreshChild;
/// Own session, clean descriptor table
pub struct SessionReady;
/// Mount events no longer propagate to the host
pub struct MountsPrivate;
/// Inside the sandbox root
pub struct RootConfined;
/// Running as the task user
pub struct CredsDropped;
/// Capability masks final
pub struct PrivsLocked;
pub struct ExecReady;

/// The task child at a given setup stage.
pub struct TaskChild<'a, S> {
    request: &'a LaunchRequest,
    status_fd: RawFd,
    _state: PhantomData<S>,
}

impl<'a, S> TaskChild<'a, S> {
    fn advance<T>(self) -> TaskChild<'a, T> {
        TaskChild {
            request: self.request,
            status_fd: self.status_fd,
            _state: PhantomData,
        }
    }
}

fn launch_error(what: &str, err: impl std::fmt::Display) -> TaskboxError {
    TaskboxError::Launch(format!("{}: {}", what, err))
}

/// Ensure the child dies with the agent.
pub fn setup_parent_death_signal() -> Result<()> {
    use nix::sys::prctl;
    use nix::sys::signal::Signal;

    prctl::set_pdeathsig(Signal::SIGKILL)
        .map_err(|e| launch_error("Failed to set parent death signal", e))
}

fn open_output(path: Option<&Path>) -> Result<RawFd> {
    match path {
        Some(path) => open(
            path,
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND | OFlag::O_CLOEXEC,
            Mode::from_bits_truncate(0o644),
        )
        .map_err(|e| launch_error(&format!("open {}", path.display()), e)),
        None => open("/dev/null", OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty())
            .map_err(|e| launch_error("open /dev/null", e)),
    }
}

fn redirect(fd: RawFd, target: RawFd) -> Result<()> {
    dup2(fd, target).map_err(|e| launch_error(&format!("dup2 onto {}", target), e))?;
    let _ = close(fd);
    Ok(())
}

impl<'a> TaskChild<'a, FreshChild> {
    pub fn new(request: &'a LaunchRequest, status_fd: RawFd) -> Self {
        Self {
            request,
            status_fd,
            _state: PhantomData,
        }
    }

    /// Steps 1 to 3.
    pub fn start_session(self) -> Result<TaskChild<'a, SessionReady>> {
        nix::unistd::setsid().map_err(|e| launch_error("setsid", e))?;
        setup_parent_death_signal()?;

        close_inherited_fds(&[self.status_fd])?;
        let stdin = open("/dev/null", OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
            .map_err(|e| launch_error("open /dev/null", e))?;
        redirect(stdin, libc::STDIN_FILENO)?;
        redirect(
            open_output(self.request.stdout_path.as_deref())?,
            libc::STDOUT_FILENO,
        )?;
        redirect(
            open_output(self.request.stderr_path.as_deref())?,
            libc::STDERR_FILENO,
        )?;

        // Never inherit the agent's own adjustment
        std::fs::write(
            "/proc/self/oom_score_adj",
            self.request.oom_score_adj.to_string(),
        )
        .map_err(|e| launch_error("write oom_score_adj", e))?;

        Ok(self.advance())
    }
}

impl<'a> TaskChild<'a, SessionReady> {
    /// Step 4, inside the fresh mount namespace.
    pub fn make_mounts_private(self) -> Result<TaskChild<'a, MountsPrivate>> {
        harden_mount_propagation()?;
        Ok(self.advance())
    }
}

impl<'a> TaskChild<'a, MountsPrivate> {
    /// Step 5.
    pub fn enter_sandbox_root(self) -> Result<TaskChild<'a, RootConfined>> {
        self.request.mounts.apply()?;
        enter_root(&self.request.mounts.root, &self.request.work_dir)?;
        Ok(self.advance())
    }
}

impl<'a> TaskChild<'a, RootConfined> {
    /// Steps 6 and 7. The bounding set is cut while still privileged.
    pub fn drop_credentials(self) -> Result<TaskChild<'a, CredsDropped>> {
        restrict_bounding_set(self.request.capabilities)?;
        keep_caps_across_setuid()?;
        transition_to(self.request.uid, self.request.gid)?;
        Ok(self.advance())
    }
}

impl<'a> TaskChild<'a, CredsDropped> {
    /// Step 8.
    pub fn lock_privileges(self) -> Result<TaskChild<'a, PrivsLocked>> {
        apply_profile(self.request.capabilities)?;
        Ok(self.advance())
    }
}

impl<'a> TaskChild<'a, PrivsLocked> {
    pub fn ready_for_exec(self) -> TaskChild<'a, ExecReady> {
        self.advance()
    }
}

fn c_strings(values: &[String], what: &str) -> Result<Vec<CString>> {
    values
        .iter()
        .map(|value| {
            CString::new(value.as_str())
                .map_err(|_| TaskboxError::Configuration(format!("{} contains NUL byte", what)))
        })
        .collect()
}

impl<'a> TaskChild<'a, ExecReady> {
    /// Step 9. Only returns on failure.
    pub fn exec_payload(self) -> Result<Infallible> {
        let path = CString::new(self.request.task_path.as_os_str().as_bytes())
            .map_err(|_| TaskboxError::Configuration("task path contains NUL byte".to_string()))?;
        let argv = c_strings(&self.request.argv, "argument")?;
        let env = c_strings(&self.request.env, "environment entry")?;

        nix::unistd::execve(&path, &argv, &env).map_err(|e| {
            launch_error(
                &format!("execve {}", self.request.task_path.display()),
                e,
            )
        })
    }
}
