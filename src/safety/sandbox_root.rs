//! Sandbox root: a directory boundary plus bind-mount exceptions.
//!
//! Binary resolution walks paths the way the task will see them after
//! chroot: absolute symlink targets restart at the root and nothing is
//! looked up on the host's own search path.
use crate::config::types::{MountConfig, Result, TaskboxError};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Symlinks followed before giving up, matching the kernel's limit.
const MAX_SYMLINKS: usize = 40;

/// Directories searched for a bare command name, relative to the root.
const SEARCH_DIRS: [&str; 6] = ["local", "usr/local/bin", "usr/bin", "bin", "usr/sbin", "sbin"];

/// Where a command lives, inside the sandbox and on the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedBinary {
    /// Path the task execs after entering the root
    pub task_path: PathBuf,
    /// Same file as seen from the agent
    pub host_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct SandboxRoot {
    root: PathBuf,
    mounts: Vec<MountConfig>,
}

enum Step {
    Parent,
    Name(OsString),
}

fn steps(path: &Path) -> VecDeque<Step> {
    path.components()
        .filter_map(|c| match c {
            Component::ParentDir => Some(Step::Parent),
            Component::Normal(name) => Some(Step::Name(name.to_os_string())),
            _ => None,
        })
        .collect()
}

/// Absolute, lexically cleaned form of a task path.
///
/// `Escape` when `..` would climb above the root.
fn clean(task_path: &Path) -> Result<PathBuf> {
    let mut cleaned: Vec<OsString> = Vec::new();
    for step in steps(task_path) {
        match step {
            Step::Parent => {
                if cleaned.pop().is_none() {
                    return Err(TaskboxError::Escape {
                        path: task_path.display().to_string(),
                    });
                }
            }
            Step::Name(name) => cleaned.push(name),
        }
    }
    let mut absolute = PathBuf::from("/");
    absolute.extend(cleaned);
    Ok(absolute)
}

impl SandboxRoot {
    pub fn new(root: impl Into<PathBuf>, mounts: &[MountConfig]) -> Self {
        Self {
            root: root.into(),
            mounts: mounts.to_vec(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Locate `cmd` for exec inside the sandbox.
    ///
    /// 1. paths with a separator are cleaned lexically; `..` above the root
    ///    is an escape
    /// 2. absolute paths under a mount's task path resolve inside that
    ///    mount's host path and nowhere else
    /// 3. other absolute paths must resolve under the root
    /// 4. bare names search the task-local dir, then the standard bin dirs
    ///
    /// Mount targets are never searched for bare names.
    pub fn resolve_binary(&self, cmd: &str) -> Result<ResolvedBinary> {
        let not_found = || TaskboxError::BinaryNotFound {
            cmd: cmd.to_string(),
            root: self.root.display().to_string(),
        };

        if cmd.trim().is_empty() {
            return Err(not_found());
        }

        if !cmd.contains('/') {
            for dir in SEARCH_DIRS {
                let task_path = Path::new("/").join(dir).join(cmd);
                if let Some(found) = self.confined_file(&task_path)? {
                    return Ok(found);
                }
            }
            return Err(not_found());
        }

        // Relative paths with separators are taken from the sandbox root
        let task_path = clean(Path::new(cmd))?;

        if let Some(mount) = self.mount_for(&task_path) {
            return self.through_mount(mount, &task_path)?.ok_or_else(not_found);
        }
        self.confined_file(&task_path)?.ok_or_else(not_found)
    }

    /// Longest mount whose task path prefixes `task_path`.
    fn mount_for(&self, task_path: &Path) -> Option<&MountConfig> {
        self.mounts
            .iter()
            .filter(|m| task_path.starts_with(&m.task_path))
            .max_by_key(|m| m.task_path.components().count())
    }

    /// Resolve the part of `task_path` below `mount` inside the mount's
    /// host directory. Symlinks are followed within the mount only.
    fn through_mount(&self, mount: &MountConfig, task_path: &Path) -> Result<Option<ResolvedBinary>> {
        let rest = task_path.strip_prefix(&mount.task_path).unwrap_or(Path::new(""));
        let Some(resolved) = SandboxRoot::new(&mount.host_path, &[]).confine(rest)? else {
            return Ok(None);
        };
        let (task_path, host_path) = if resolved.as_os_str().is_empty() {
            (mount.task_path.clone(), mount.host_path.clone())
        } else {
            (mount.task_path.join(&resolved), mount.host_path.join(&resolved))
        };
        if !host_path.is_file() {
            return Ok(None);
        }
        log::debug!(
            "Resolved {} through mount {}",
            task_path.display(),
            mount.host_path.display()
        );
        Ok(Some(ResolvedBinary {
            task_path,
            host_path,
        }))
    }

    fn confined_file(&self, task_path: &Path) -> Result<Option<ResolvedBinary>> {
        let Some(resolved) = self.confine(task_path)? else {
            return Ok(None);
        };
        let host_path = self.root.join(&resolved);
        if !host_path.is_file() {
            return Ok(None);
        }
        Ok(Some(ResolvedBinary {
            task_path: Path::new("/").join(resolved),
            host_path,
        }))
    }

    /// Resolve `task_path` to a path relative to the root, following
    /// symlinks inside the root only.
    ///
    /// `Ok(None)` when a component is missing or the link budget runs out;
    /// `Escape` when `..` would climb above the root.
    pub fn confine(&self, task_path: &Path) -> Result<Option<PathBuf>> {
        let mut resolved: Vec<OsString> = Vec::new();
        let mut pending = steps(task_path);
        let mut links = 0;

        while let Some(step) = pending.pop_front() {
            let name = match step {
                Step::Parent => {
                    if resolved.pop().is_none() {
                        return Err(TaskboxError::Escape {
                            path: task_path.display().to_string(),
                        });
                    }
                    continue;
                }
                Step::Name(name) => name,
            };

            let mut candidate = self.root.clone();
            candidate.extend(&resolved);
            candidate.push(&name);

            let meta = match fs::symlink_metadata(&candidate) {
                Ok(meta) => meta,
                Err(_) => return Ok(None),
            };
            if !meta.file_type().is_symlink() {
                resolved.push(name);
                continue;
            }

            links += 1;
            if links > MAX_SYMLINKS {
                log::debug!("Too many symlinks resolving {}", task_path.display());
                return Ok(None);
            }
            let target = fs::read_link(&candidate)?;
            if target.is_absolute() {
                resolved.clear();
            }
            let mut expanded = steps(&target);
            expanded.extend(pending);
            pending = expanded;
        }

        Ok(Some(resolved.iter().collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::os::unix::fs::symlink;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "#!/bin/sh\n").unwrap();
    }

    #[test]
    fn test_bare_name_search_order() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("bin/tool"));
        touch(&root.path().join("usr/local/bin/tool"));

        let sandbox = SandboxRoot::new(root.path(), &[]);
        let found = sandbox.resolve_binary("tool").unwrap();
        assert_eq!(found.task_path, PathBuf::from("/usr/local/bin/tool"));

        touch(&root.path().join("local/tool"));
        let found = sandbox.resolve_binary("tool").unwrap();
        assert_eq!(found.task_path, PathBuf::from("/local/tool"));
        assert_eq!(found.host_path, root.path().join("local/tool"));
    }

    #[test]
    fn test_bare_name_never_uses_host_path() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = SandboxRoot::new(root.path(), &[]);
        let err = sandbox.resolve_binary("sh").unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("file sh not found under path {}", root.path().display())
        );
    }

    #[test]
    fn test_absolute_symlink_stays_in_root() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("opt/app/run"));
        fs::create_dir_all(root.path().join("usr/bin")).unwrap();
        symlink("/opt/app/run", root.path().join("usr/bin/run")).unwrap();

        let sandbox = SandboxRoot::new(root.path(), &[]);
        let found = sandbox.resolve_binary("/usr/bin/run").unwrap();
        assert_eq!(found.task_path, PathBuf::from("/opt/app/run"));
        assert_eq!(found.host_path, root.path().join("opt/app/run"));
    }

    #[test]
    fn test_parent_traversal_above_root_is_escape() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = SandboxRoot::new(root.path(), &[]);
        let err = sandbox.resolve_binary("/../../bin/sh").unwrap_err();
        assert!(matches!(err, TaskboxError::Escape { .. }));
        assert!(err.is_resolution());
    }

    #[test]
    fn test_clean_paths() {
        assert_eq!(clean(Path::new("/a/./b/../c")).unwrap(), PathBuf::from("/a/c"));
        assert_eq!(clean(Path::new("local/bin/app")).unwrap(), PathBuf::from("/local/bin/app"));
        assert_eq!(clean(Path::new("/a/..")).unwrap(), PathBuf::from("/"));
        assert!(matches!(
            clean(Path::new("/a/../../etc")),
            Err(TaskboxError::Escape { .. })
        ));
    }

    #[test]
    fn test_symlink_loop_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        symlink("/b", root.path().join("a")).unwrap();
        symlink("/a", root.path().join("b")).unwrap();
        let sandbox = SandboxRoot::new(root.path(), &[]);
        assert!(matches!(
            sandbox.resolve_binary("/a"),
            Err(TaskboxError::BinaryNotFound { .. })
        ));
    }

    #[test]
    fn test_relative_path_with_separator() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("local/bin/app"));
        let sandbox = SandboxRoot::new(root.path(), &[]);
        let found = sandbox.resolve_binary("local/bin/app").unwrap();
        assert_eq!(found.task_path, PathBuf::from("/local/bin/app"));
    }

    #[test]
    fn test_directory_is_not_a_binary() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("bin/tool")).unwrap();
        let sandbox = SandboxRoot::new(root.path(), &[]);
        assert!(sandbox.resolve_binary("tool").is_err());
    }
}
