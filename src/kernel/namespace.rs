/// Namespace set derivation and namespace entry helpers
use crate::config::types::{IsolationMode, Result, TaskboxError};
use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::PathBuf;

/// Isolation domain the task may receive privately.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NamespaceKind {
    Mount,
    Pid,
    Ipc,
}

impl NamespaceKind {
    pub fn clone_flag(self) -> CloneFlags {
        match self {
            NamespaceKind::Mount => CloneFlags::CLONE_NEWNS,
            NamespaceKind::Pid => CloneFlags::CLONE_NEWPID,
            NamespaceKind::Ipc => CloneFlags::CLONE_NEWIPC,
        }
    }

    /// Entry name under /proc/<pid>/ns
    pub fn proc_name(self) -> &'static str {
        match self {
            NamespaceKind::Mount => "mnt",
            NamespaceKind::Pid => "pid",
            NamespaceKind::Ipc => "ipc",
        }
    }
}

/// Ordered, deduplicated namespace list. Mount is always first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSet {
    kinds: Vec<NamespaceKind>,
}

impl NamespaceSet {
    fn with_mount() -> Self {
        Self {
            kinds: vec![NamespaceKind::Mount],
        }
    }

    fn push(&mut self, kind: NamespaceKind) {
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
        }
    }

    pub fn kinds(&self) -> &[NamespaceKind] {
        &self.kinds
    }

    pub fn contains(&self, kind: NamespaceKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn clone_flags(&self) -> CloneFlags {
        self.kinds
            .iter()
            .fold(CloneFlags::empty(), |flags, kind| flags | kind.clone_flag())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.kinds.iter().map(|k| k.proc_name()).collect()
    }
}

/// Derive the namespace set for the given PID and IPC modes.
pub fn build_namespaces(pid_mode: IsolationMode, ipc_mode: IsolationMode) -> NamespaceSet {
    let mut set = NamespaceSet::with_mount();
    if pid_mode.is_private() {
        set.push(NamespaceKind::Pid);
    }
    if ipc_mode.is_private() {
        set.push(NamespaceKind::Ipc);
    }
    set
}

/// Open handles to a running process's namespaces and root directory.
///
/// Opened up front so the handles stay valid even if the target exits mid-join.
pub struct NamespaceHandles {
    pub pid: Option<File>,
    pub ipc: Option<File>,
    pub mnt: File,
    pub root: File,
}

impl NamespaceHandles {
    pub fn open(target_pid: i32, set: &NamespaceSet) -> Result<Self> {
        let base = PathBuf::from(format!("/proc/{}", target_pid));
        let open = |rel: &str| {
            let path = base.join(rel);
            File::open(&path).map_err(|e| {
                TaskboxError::Namespace(format!("Failed to open {}: {}", path.display(), e))
            })
        };

        let pid = if set.contains(NamespaceKind::Pid) {
            Some(open("ns/pid")?)
        } else {
            None
        };
        let ipc = if set.contains(NamespaceKind::Ipc) {
            Some(open("ns/ipc")?)
        } else {
            None
        };

        Ok(Self {
            pid,
            ipc,
            mnt: open("ns/mnt")?,
            root: open("root")?,
        })
    }
}

/// Harden mount propagation: mount(NULL, "/", NULL, MS_REC | MS_PRIVATE, NULL)
///
/// Must run inside the fresh mount namespace before any sandbox mounts.
pub fn harden_mount_propagation() -> Result<()> {
    use nix::mount::{mount, MsFlags};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| {
        TaskboxError::Namespace(format!(
            "Failed to make / private and recursive (MS_PRIVATE|MS_REC): {}",
            e
        ))
    })?;

    log::debug!("Mount propagation hardened: / set to MS_PRIVATE|MS_REC");
    Ok(())
}
