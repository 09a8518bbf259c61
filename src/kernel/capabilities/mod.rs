//! Linux capability computation and application.
//!
//! [`CapabilitySet::calculate`] is pure; the `apply` submodule performs the
//! prctl/capset calls inside the child before exec.

mod apply;

pub use apply::{apply_profile, keep_caps_across_setuid, restrict_bounding_set};

use crate::config::types::{Result, TaskboxError};
use serde::{Deserialize, Serialize};
use std::fmt;

pub(crate) const PR_CAPBSET_DROP: libc::c_int = 24;
pub(crate) const PR_SET_KEEPCAPS: libc::c_int = 8;
pub(crate) const PR_CAP_AMBIENT: libc::c_int = 47;
pub(crate) const PR_CAP_AMBIENT_RAISE: libc::c_int = 2;
pub(crate) const PR_CAP_AMBIENT_CLEAR_ALL: libc::c_int = 4;
pub(crate) const LINUX_CAPABILITY_VERSION_3: u32 = 0x20080522;

/// Highest capability number known to this table.
pub const MAX_CAP: u32 = 40;

/// Sentinel accepted in drop lists to clear the whole baseline.
pub const DROP_ALL: &str = "all";

const CAPABILITY_NAMES: [&str; (MAX_CAP + 1) as usize] = [
    "chown",
    "dac_override",
    "dac_read_search",
    "fowner",
    "fsetid",
    "kill",
    "setgid",
    "setuid",
    "setpcap",
    "linux_immutable",
    "net_bind_service",
    "net_broadcast",
    "net_admin",
    "net_raw",
    "ipc_lock",
    "ipc_owner",
    "sys_module",
    "sys_rawio",
    "sys_chroot",
    "sys_ptrace",
    "sys_pacct",
    "sys_admin",
    "sys_boot",
    "sys_nice",
    "sys_resource",
    "sys_time",
    "sys_tty_config",
    "mknod",
    "lease",
    "audit_write",
    "audit_control",
    "setfcap",
    "mac_override",
    "mac_admin",
    "syslog",
    "wake_alarm",
    "block_suspend",
    "audit_read",
    "perfmon",
    "bpf",
    "checkpoint_restore",
];

/// Restrictive default granted to non-root task users.
const TASK_DEFAULT_CAPABILITIES: [&str; 13] = [
    "audit_write",
    "chown",
    "dac_override",
    "fowner",
    "fsetid",
    "kill",
    "mknod",
    "net_bind_service",
    "setfcap",
    "setgid",
    "setpcap",
    "setuid",
    "sys_chroot",
];

/// Look up a capability number by name (`net_raw`, `CAP_NET_RAW`, ...).
pub fn capability_number(name: &str) -> Option<u32> {
    let lowered = name.trim().to_ascii_lowercase();
    let bare = lowered.strip_prefix("cap_").unwrap_or(&lowered);
    CAPABILITY_NAMES
        .iter()
        .position(|candidate| *candidate == bare)
        .map(|idx| idx as u32)
}

pub fn capability_name(cap: u32) -> Option<&'static str> {
    CAPABILITY_NAMES.get(cap as usize).copied()
}

/// Bitmask of capabilities, bit N = capability number N.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilitySet(u64);

impl CapabilitySet {
    pub const fn empty() -> Self {
        CapabilitySet(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        CapabilitySet(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    /// Every capability up to and including `last_cap`.
    pub fn full(last_cap: u32) -> Self {
        let last = last_cap.min(63);
        if last == 63 {
            CapabilitySet(u64::MAX)
        } else {
            CapabilitySet((1u64 << (last + 1)) - 1)
        }
    }

    /// Curated default for unprivileged users.
    pub fn task_default() -> Self {
        let mut set = CapabilitySet::empty();
        for name in TASK_DEFAULT_CAPABILITIES {
            if let Some(cap) = capability_number(name) {
                set.insert(cap);
            }
        }
        set
    }

    /// Baseline for a user: root gets the full ceiling, everyone else the default.
    pub fn baseline_for_uid(uid: u32, ceiling: CapabilitySet) -> Self {
        if uid == 0 {
            ceiling
        } else {
            CapabilitySet::task_default().intersect(ceiling)
        }
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut set = CapabilitySet::empty();
        for name in names {
            let name = name.as_ref();
            let cap = capability_number(name).ok_or_else(|| {
                TaskboxError::Configuration(format!("unknown capability: {}", name))
            })?;
            set.insert(cap);
        }
        Ok(set)
    }

    pub fn insert(&mut self, cap: u32) {
        if cap < 64 {
            self.0 |= 1u64 << cap;
        }
    }

    pub fn remove(&mut self, cap: u32) {
        if cap < 64 {
            self.0 &= !(1u64 << cap);
        }
    }

    pub fn contains(self, cap: u32) -> bool {
        cap < 64 && self.0 & (1u64 << cap) != 0
    }

    pub fn union(self, other: CapabilitySet) -> Self {
        CapabilitySet(self.0 | other.0)
    }

    pub fn difference(self, other: CapabilitySet) -> Self {
        CapabilitySet(self.0 & !other.0)
    }

    pub fn intersect(self, other: CapabilitySet) -> Self {
        CapabilitySet(self.0 & other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = u32> {
        (0..64u32).filter(move |cap| self.contains(*cap))
    }

    pub fn names(self) -> Vec<&'static str> {
        self.iter().filter_map(capability_name).collect()
    }

    /// `(baseline \ drop) ∪ add`, with `all` in `drop` clearing the baseline.
    ///
    /// Additions are applied last and win over drops. Unknown names are rejected.
    pub fn calculate<A, D>(baseline: CapabilitySet, add: &[A], drop: &[D]) -> Result<Self>
    where
        A: AsRef<str>,
        D: AsRef<str>,
    {
        let drop_all = drop
            .iter()
            .any(|name| name.as_ref().trim().eq_ignore_ascii_case(DROP_ALL));
        let add_all = add
            .iter()
            .any(|name| name.as_ref().trim().eq_ignore_ascii_case(DROP_ALL));

        let named_drops: Vec<&str> = drop
            .iter()
            .map(|n| n.as_ref())
            .filter(|n| !n.trim().eq_ignore_ascii_case(DROP_ALL))
            .collect();
        let named_adds: Vec<&str> = add
            .iter()
            .map(|n| n.as_ref())
            .filter(|n| !n.trim().eq_ignore_ascii_case(DROP_ALL))
            .collect();

        let mut working = if drop_all {
            CapabilitySet::empty()
        } else {
            baseline.difference(CapabilitySet::from_names(&named_drops)?)
        };
        if add_all {
            working = CapabilitySet::full(MAX_CAP);
        }
        Ok(working.union(CapabilitySet::from_names(&named_adds)?))
    }

    /// Clip to what the running kernel can represent.
    pub fn within(self, ceiling: CapabilitySet) -> Self {
        self.intersect(ceiling)
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Kernel capability ceiling from /proc/sys/kernel/cap_last_cap.
pub fn kernel_ceiling() -> CapabilitySet {
    let last_cap = std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .unwrap_or_else(|| {
            log::warn!("Cannot read cap_last_cap, assuming {}", MAX_CAP);
            MAX_CAP
        });
    CapabilitySet::full(last_cap)
}

/// What the agent can actually grant: the kernel ceiling narrowed by the
/// agent's own bounding and permitted sets.
///
/// Falls back to the kernel ceiling when our own status cannot be read.
pub fn agent_ceiling() -> CapabilitySet {
    let kernel = kernel_ceiling();
    match CapabilityProfile::read_from_status(std::process::id() as i32) {
        Ok(own) => own.grantable().within(kernel),
        Err(e) => {
            log::warn!("Cannot read own capabilities, using kernel ceiling: {}", e);
            kernel
        }
    }
}

/// The five capability masks of a process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityProfile {
    pub inheritable: CapabilitySet,
    pub permitted: CapabilitySet,
    pub effective: CapabilitySet,
    pub bounding: CapabilitySet,
    pub ambient: CapabilitySet,
}

impl CapabilityProfile {
    /// Same membership in all five masks.
    pub fn symmetric(set: CapabilitySet) -> Self {
        Self {
            inheritable: set,
            permitted: set,
            effective: set,
            bounding: set,
            ambient: set,
        }
    }

    pub fn is_symmetric(&self) -> bool {
        let s = self.bounding;
        self.inheritable == s && self.permitted == s && self.effective == s && self.ambient == s
    }

    /// Parse CapInh/CapPrm/CapEff/CapBnd/CapAmb lines from /proc/<pid>/status.
    pub fn parse_status(status: &str) -> Result<Self> {
        let mut profile = CapabilityProfile::default();
        let mut seen = 0;
        for line in status.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let slot = match key.trim() {
                "CapInh" => &mut profile.inheritable,
                "CapPrm" => &mut profile.permitted,
                "CapEff" => &mut profile.effective,
                "CapBnd" => &mut profile.bounding,
                "CapAmb" => &mut profile.ambient,
                _ => continue,
            };
            let bits = u64::from_str_radix(value.trim(), 16).map_err(|e| {
                TaskboxError::Configuration(format!("bad capability line '{}': {}", line, e))
            })?;
            *slot = CapabilitySet::from_bits(bits);
            seen += 1;
        }
        if seen < 4 {
            return Err(TaskboxError::Configuration(
                "status text has no capability lines".to_string(),
            ));
        }
        Ok(profile)
    }

    /// Capabilities this process can pass on to a child.
    pub fn grantable(&self) -> CapabilitySet {
        self.bounding.intersect(self.permitted)
    }

    pub fn read_from_status(pid: i32) -> Result<Self> {
        let status = std::fs::read_to_string(format!("/proc/{}/status", pid))?;
        Self::parse_status(&status)
    }
}

impl fmt::Display for CapabilityProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CapInh: {}\nCapPrm: {}\nCapEff: {}\nCapBnd: {}\nCapAmb: {}",
            self.inheritable, self.permitted, self.effective, self.bounding, self.ambient
        )
    }
}
