/// Sandbox root construction inside the task's mount namespace
use crate::config::types::{MountConfig, Result, TaskboxError};
use crate::kernel::devices::DeviceRule;
use nix::mount::{mount, MsFlags};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One bind mount into the sandbox root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub source: PathBuf,
    /// Absolute host-side path under the sandbox root
    pub target: PathBuf,
    pub readonly: bool,
}

impl BindMount {
    pub fn flags(&self) -> MsFlags {
        if self.readonly {
            MsFlags::MS_BIND | MsFlags::MS_RDONLY
        } else {
            MsFlags::MS_BIND
        }
    }

    pub fn propagation() -> MsFlags {
        MsFlags::MS_PRIVATE | MsFlags::MS_REC
    }
}

/// Host path a task-side path lands on under `root`.
pub fn host_target(root: &Path, task_path: &Path) -> PathBuf {
    root.join(task_path.strip_prefix("/").unwrap_or(task_path))
}

pub fn mount_plan(root: &Path, mounts: &[MountConfig]) -> Vec<BindMount> {
    mounts
        .iter()
        .map(|m| BindMount {
            source: m.host_path.clone(),
            target: host_target(root, &m.task_path),
            readonly: m.readonly,
        })
        .collect()
}

/// Everything the child mounts before chrooting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxMounts {
    pub root: PathBuf,
    pub binds: Vec<BindMount>,
    /// (host node, target under root)
    pub device_nodes: Vec<(PathBuf, PathBuf)>,
}

impl SandboxMounts {
    pub fn new(root: &Path, mounts: &[MountConfig], devices: &[DeviceRule]) -> Self {
        let device_nodes = devices
            .iter()
            .filter_map(|rule| match (&rule.host_path, &rule.task_path) {
                (Some(host), Some(task)) => Some((host.clone(), host_target(root, task))),
                _ => None,
            })
            .collect();
        Self {
            root: root.to_path_buf(),
            binds: mount_plan(root, mounts),
            device_nodes,
        }
    }

    /// Mount /dev, /proc and the bind mounts under the root.
    pub fn apply(&self) -> Result<()> {
        self.mount_dev()?;
        self.mount_proc()?;
        for bind in &self.binds {
            apply_bind(bind)?;
        }
        Ok(())
    }

    fn mount_dev(&self) -> Result<()> {
        let dev = self.root.join("dev");
        fs::create_dir_all(&dev)?;
        mount(
            Some("tmpfs"),
            &dev,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some("mode=755,size=64k"),
        )
        .map_err(|e| mount_error("tmpfs", &dev, e))?;

        for (host, target) in &self.device_nodes {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::File::create(target)?;
            mount(Some(host.as_path()), target, None::<&str>, MsFlags::MS_BIND, None::<&str>)
                .map_err(|e| mount_error(&host.display().to_string(), target, e))?;
        }

        let pts = dev.join("pts");
        fs::create_dir_all(&pts)?;
        // Without devpts the task still runs, just without ttys
        let _ = mount(
            Some("devpts"),
            &pts,
            Some("devpts"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some("newinstance,ptmxmode=0666,mode=0620"),
        );
        Ok(())
    }

    fn mount_proc(&self) -> Result<()> {
        let proc_dir = self.root.join("proc");
        fs::create_dir_all(&proc_dir)?;
        mount(
            Some("proc"),
            &proc_dir,
            Some("proc"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            None::<&str>,
        )
        .map_err(|e| mount_error("proc", &proc_dir, e))
    }
}

fn mount_error(source: &str, target: &Path, e: nix::Error) -> TaskboxError {
    TaskboxError::Launch(format!("Failed to mount {} on {}: {}", source, target.display(), e))
}

fn apply_bind(bind: &BindMount) -> Result<()> {
    if bind.source.is_dir() {
        fs::create_dir_all(&bind.target)?;
    } else {
        if let Some(parent) = bind.target.parent() {
            fs::create_dir_all(parent)?;
        }
        if !bind.target.exists() {
            fs::File::create(&bind.target)?;
        }
    }

    let source = bind.source.display().to_string();
    mount(
        Some(bind.source.as_path()),
        &bind.target,
        None::<&str>,
        bind.flags() | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| mount_error(&source, &bind.target, e))?;

    // MS_RDONLY is ignored on the initial bind and needs a remount
    if bind.readonly {
        mount(
            None::<&str>,
            &bind.target,
            None::<&str>,
            bind.flags() | MsFlags::MS_REMOUNT,
            None::<&str>,
        )
        .map_err(|e| mount_error(&source, &bind.target, e))?;
    }

    mount(
        None::<&str>,
        &bind.target,
        None::<&str>,
        BindMount::propagation(),
        None::<&str>,
    )
    .map_err(|e| mount_error(&source, &bind.target, e))
}

/// chroot into `root` and change to `work_dir` inside it.
pub fn enter_root(root: &Path, work_dir: &Path) -> Result<()> {
    nix::unistd::chroot(root)
        .map_err(|e| TaskboxError::Launch(format!("chroot {} failed: {}", root.display(), e)))?;
    nix::unistd::chdir(work_dir).map_err(|e| {
        TaskboxError::Launch(format!("chdir {} failed: {}", work_dir.display(), e))
    })
}
