/// Inherited file descriptor closure for the task child
///
/// Prefers close_range(2) and falls back to iterating /proc/self/fd.
use crate::config::types::{Result, TaskboxError};
use nix::unistd::close;
use std::fs;
use std::os::fd::RawFd;

/// Close every descriptor above stderr except those in `keep`.
pub fn close_inherited_fds(keep: &[RawFd]) -> Result<()> {
    let mut keep: Vec<RawFd> = keep.iter().copied().filter(|fd| *fd > 2).collect();
    keep.sort_unstable();
    keep.dedup();

    if close_gaps(&keep) {
        return Ok(());
    }
    close_fds_via_proc(&keep)
}

/// close_range over each gap between kept descriptors.
fn close_gaps(keep: &[RawFd]) -> bool {
    let mut start: libc::c_uint = 3;
    for fd in keep {
        let fd = *fd as libc::c_uint;
        if fd > start && !close_range(start, fd - 1) {
            return false;
        }
        start = fd + 1;
    }
    close_range(start, libc::c_uint::MAX)
}

fn close_range(first: libc::c_uint, last: libc::c_uint) -> bool {
    // SAFETY: close_range only closes descriptors in the given range.
    unsafe { libc::syscall(libc::SYS_close_range, first, last, 0 as libc::c_uint) == 0 }
}

fn close_fds_via_proc(keep: &[RawFd]) -> Result<()> {
    let fds = open_fds()?;
    for fd in fds.into_iter().filter(|fd| *fd > 2 && !keep.contains(fd)) {
        // EBADF here is the directory handle used for the listing
        match close(fd) {
            Ok(()) | Err(nix::errno::Errno::EBADF) => {}
            Err(e) => {
                return Err(TaskboxError::Launch(format!("Failed to close fd {}: {}", fd, e)))
            }
        }
    }
    Ok(())
}

/// Sorted list of this process's open descriptors.
pub fn open_fds() -> Result<Vec<RawFd>> {
    let entries = fs::read_dir("/proc/self/fd")
        .map_err(|e| TaskboxError::Launch(format!("Failed to read /proc/self/fd: {}", e)))?;
    let mut fds: Vec<RawFd> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| name.parse::<RawFd>().ok())
        .collect();
    fds.sort_unstable();
    Ok(fds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_fds_has_stdio() {
        let fds = open_fds().unwrap();
        assert!(fds.contains(&0));
        assert!(fds.contains(&1));
        assert!(fds.contains(&2));
    }

    #[test]
    fn test_close_in_forked_child_keeps_requested_fd() {
        use nix::sys::wait::{waitpid, WaitStatus};
        use nix::unistd::{fork, ForkResult};
        use std::os::fd::AsRawFd;

        let kept = fs::File::open("/dev/null").unwrap();
        let dropped = fs::File::open("/dev/zero").unwrap();
        let (kept_fd, dropped_fd) = (kept.as_raw_fd(), dropped.as_raw_fd());

        // SAFETY: the child only makes syscalls and exits.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let ok = close_inherited_fds(&[kept_fd]).is_ok()
                    && nix::fcntl::fcntl(kept_fd, nix::fcntl::FcntlArg::F_GETFD).is_ok()
                    && nix::fcntl::fcntl(dropped_fd, nix::fcntl::FcntlArg::F_GETFD).is_err();
                unsafe { libc::_exit(if ok { 0 } else { 1 }) };
            }
            ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
            }
        }
    }
}
