//! UID/GID switch for the task child.
//!
//! setresgid MUST be called BEFORE setresuid, otherwise the GID change is
//! no longer permitted.

use crate::config::types::{Result, TaskboxError};
use nix::unistd::{getegid, geteuid, getgid, getuid, setgroups, setresgid, setresuid, Gid, Uid};

/// Clear groups, switch GID then UID, and verify.
///
/// A no-op when the caller is unprivileged and already the target identity.
pub fn transition_to(uid: u32, gid: u32) -> Result<()> {
    let euid = geteuid().as_raw();
    if euid != 0 && euid == uid && getegid().as_raw() == gid {
        return Ok(());
    }

    setgroups(&[]).map_err(|e| {
        TaskboxError::Privilege(format!("Failed to clear supplementary groups: {}", e))
    })?;

    let gid_t = Gid::from_raw(gid);
    setresgid(gid_t, gid_t, gid_t)
        .map_err(|e| TaskboxError::Privilege(format!("Failed to setresgid({}): {}", gid, e)))?;

    let uid_t = Uid::from_raw(uid);
    setresuid(uid_t, uid_t, uid_t)
        .map_err(|e| TaskboxError::Privilege(format!("Failed to setresuid({}): {}", uid, e)))?;

    verify(uid, gid)
}

fn verify(uid: u32, gid: u32) -> Result<()> {
    let (ruid, euid) = (getuid().as_raw(), geteuid().as_raw());
    if ruid != uid || euid != uid {
        return Err(TaskboxError::Privilege(format!(
            "UID verification failed: expected {}, got real={}, effective={}",
            uid, ruid, euid
        )));
    }
    let (rgid, egid) = (getgid().as_raw(), getegid().as_raw());
    if rgid != gid || egid != gid {
        return Err(TaskboxError::Privilege(format!(
            "GID verification failed: expected {}, got real={}, effective={}",
            gid, rgid, egid
        )));
    }
    Ok(())
}
