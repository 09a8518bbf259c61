//! Child side of the launch handshake.
//!
//! Runs in the cloned child: block on the launch pipe, walk the setup chain,
//! exec. Any failure is written to the status pipe as JSON and the child
//! exits 127.
use crate::config::types::{Result, TaskboxError};
use crate::core::types::{ChildStatus, LaunchRequest};
use crate::exec::preexec::{FreshChild, TaskChild};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{FromRawFd, RawFd};

/// Exit code of a child whose setup failed before exec.
pub const SETUP_FAILED_EXIT: i32 = 127;

fn read_request(launch_fd: RawFd) -> Result<LaunchRequest> {
    // SAFETY: the launch fd is owned by this child and read exactly once.
    let mut file = unsafe { File::from_raw_fd(launch_fd) };
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    if data.is_empty() {
        return Err(TaskboxError::Launch(
            "launch pipe closed before a request arrived".to_string(),
        ));
    }
    serde_json::from_slice(&data)
        .map_err(|e| TaskboxError::Launch(format!("failed to decode launch request: {}", e)))
}

fn write_status(status_fd: RawFd, status: &ChildStatus) {
    // SAFETY: the status fd is owned by this child; nothing else writes it.
    let mut file = unsafe { File::from_raw_fd(status_fd) };
    if let Ok(payload) = serde_json::to_vec(status) {
        let _ = file.write_all(&payload);
    }
}

fn run_chain(request: &LaunchRequest, status_fd: RawFd) -> std::result::Result<(), ChildStatus> {
    let child = TaskChild::<FreshChild>::new(request, status_fd)
        .start_session()
        .map_err(|e| ChildStatus::failed("session", e))?;
    let child = child
        .make_mounts_private()
        .map_err(|e| ChildStatus::failed("mount propagation", e))?;
    let child = child
        .enter_sandbox_root()
        .map_err(|e| ChildStatus::failed("sandbox root", e))?;
    let child = child
        .drop_credentials()
        .map_err(|e| ChildStatus::failed("credentials", e))?;
    let child = child
        .lock_privileges()
        .map_err(|e| ChildStatus::failed("capabilities", e))?;
    match child.ready_for_exec().exec_payload() {
        Ok(never) => match never {},
        Err(e) => Err(ChildStatus::failed("exec", e)),
    }
}

/// Entrypoint of the cloned child. Never returns.
pub fn child_main(launch_fd: RawFd, status_fd: RawFd) -> ! {
    let failure = match read_request(launch_fd) {
        Ok(request) => match run_chain(&request, status_fd) {
            Ok(()) => ChildStatus::failed("exec", "execve returned"),
            Err(status) => status,
        },
        Err(e) => ChildStatus::failed("handshake", e),
    };
    write_status(status_fd, &failure);
    // SAFETY: _exit skips atexit handlers inherited from the agent.
    unsafe { libc::_exit(SETUP_FAILED_EXIT) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use std::os::fd::IntoRawFd;

    #[test]
    fn test_empty_launch_pipe_is_rejected() {
        let (read, write) = pipe().unwrap();
        drop(write);
        let err = read_request(read.into_raw_fd()).unwrap_err();
        assert!(err.is_launch());
    }

    #[test]
    fn test_status_round_trips_through_pipe() {
        let (read, write) = pipe().unwrap();
        write_status(write.into_raw_fd(), &ChildStatus::failed("credentials", "EPERM"));
        let mut data = Vec::new();
        File::from(read).read_to_end(&mut data).unwrap();
        let status: ChildStatus = serde_json::from_slice(&data).unwrap();
        assert_eq!(status.stage, "credentials");
    }
}
