//! Child-side capability application.
//!
//! These run between clone and execve, so they avoid allocation and logging.
use super::{
    CapabilitySet, LINUX_CAPABILITY_VERSION_3, MAX_CAP, PR_CAPBSET_DROP, PR_CAP_AMBIENT,
    PR_CAP_AMBIENT_CLEAR_ALL, PR_CAP_AMBIENT_RAISE, PR_SET_KEEPCAPS,
};
use crate::config::types::{Result, TaskboxError};

#[cfg(target_arch = "x86_64")]
const SYS_CAPSET: libc::c_long = 126;
#[cfg(target_arch = "aarch64")]
const SYS_CAPSET: libc::c_long = 91;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("SYS_capset number not defined for this architecture");

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

fn privilege_error(what: &str) -> TaskboxError {
    TaskboxError::Privilege(format!("{}: {}", what, std::io::Error::last_os_error()))
}

/// Drop every capability outside `keep` from the bounding set.
///
/// Capabilities the running kernel does not know report EINVAL and are skipped.
pub fn restrict_bounding_set(keep: CapabilitySet) -> Result<()> {
    for cap in 0..=MAX_CAP {
        if keep.contains(cap) {
            continue;
        }
        // SAFETY: prctl(PR_CAPBSET_DROP) takes a plain integer argument.
        let rc = unsafe { libc::prctl(PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) };
        if rc != 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::EINVAL) {
            return Err(privilege_error("PR_CAPBSET_DROP"));
        }
    }
    Ok(())
}

/// Retain the permitted set across the upcoming setresuid.
pub fn keep_caps_across_setuid() -> Result<()> {
    // SAFETY: prctl(PR_SET_KEEPCAPS, 1) only flips a per-thread flag.
    let rc = unsafe { libc::prctl(PR_SET_KEEPCAPS, 1 as libc::c_ulong, 0, 0, 0) };
    if rc != 0 {
        return Err(privilege_error("PR_SET_KEEPCAPS"));
    }
    Ok(())
}

/// Write `set` into the effective, permitted and inheritable masks, then
/// replace the ambient mask with it.
///
/// Must run after the credential switch. With the bounding set already
/// restricted, the task's five masks carry identical membership after execve.
pub fn apply_profile(set: CapabilitySet) -> Result<()> {
    let bits = set.bits();
    let low = bits as u32;
    let high = (bits >> 32) as u32;

    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = [
        CapUserData {
            effective: low,
            permitted: low,
            inheritable: low,
        },
        CapUserData {
            effective: high,
            permitted: high,
            inheritable: high,
        },
    ];

    // SAFETY: version 3 header with pid 0 and two initialised data entries.
    let rc = unsafe {
        libc::syscall(
            SYS_CAPSET,
            &header as *const CapUserHeader,
            data.as_ptr(),
        )
    };
    if rc != 0 {
        return Err(privilege_error("capset"));
    }

    // SAFETY: clearing the ambient set has no pointer arguments.
    let rc = unsafe {
        libc::prctl(
            PR_CAP_AMBIENT,
            PR_CAP_AMBIENT_CLEAR_ALL as libc::c_ulong,
            0,
            0,
            0,
        )
    };
    if rc != 0 && !set.is_empty() {
        return Err(privilege_error("PR_CAP_AMBIENT_CLEAR_ALL"));
    }

    for cap in 0..=MAX_CAP {
        if !set.contains(cap) {
            continue;
        }
        // SAFETY: raising an ambient capability that is permitted and inheritable.
        let rc = unsafe {
            libc::prctl(
                PR_CAP_AMBIENT,
                PR_CAP_AMBIENT_RAISE as libc::c_ulong,
                cap as libc::c_ulong,
                0,
                0,
            )
        };
        if rc != 0 {
            return Err(privilege_error("PR_CAP_AMBIENT_RAISE"));
        }
    }
    Ok(())
}
