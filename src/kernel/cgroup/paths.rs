//! Per-controller cgroup path computation and override handling.
use super::mode::CgroupMode;
use crate::config::types::Resources;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Controllers a task joins on the legacy hierarchy.
pub const V1_CONTROLLERS: [&str; 5] = ["cpu", "cpuset", "memory", "pids", "devices"];

/// Controller used to carry the shared path on the unified hierarchy.
const UNIFIED: &str = "unified";

/// Absolute cgroup path per controller.
///
/// On the unified hierarchy every controller shares one path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CgroupLayout {
    mode: CgroupMode,
    root: PathBuf,
    paths: BTreeMap<String, PathBuf>,
}

impl CgroupLayout {
    /// Layout containing a single directory, used to address an existing group.
    pub fn single(mode: CgroupMode, root: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        let mut paths = BTreeMap::new();
        paths.insert(UNIFIED.to_string(), path.into());
        Self {
            mode,
            root: root.into(),
            paths,
        }
    }

    pub fn mode(&self) -> CgroupMode {
        self.mode
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, controller: &str) -> Option<&Path> {
        match self.mode {
            CgroupMode::Off => None,
            CgroupMode::V1 => self.paths.get(controller).map(PathBuf::as_path),
            CgroupMode::V2 => self.paths.values().next().map(PathBuf::as_path),
        }
    }

    pub fn controllers(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.paths.iter().map(|(c, p)| (c.as_str(), p.as_path()))
    }

    /// Every distinct directory in the layout.
    pub fn distinct_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.paths.values().cloned().collect();
        paths.sort();
        paths.dedup();
        paths
    }
}

/// Computes the cgroup a task lands in, honoring caller overrides.
#[derive(Clone, Debug)]
pub struct CgroupPathResolver {
    mode: CgroupMode,
    root: PathBuf,
    v1_overrides: BTreeMap<String, PathBuf>,
    v2_override: Option<PathBuf>,
}

impl CgroupPathResolver {
    pub fn new(mode: CgroupMode, root: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            root: root.into(),
            v1_overrides: BTreeMap::new(),
            v2_override: None,
        }
    }

    pub fn with_overrides(mut self, resources: &Resources) -> Self {
        self.v1_overrides = resources.override_cgroup_v1.clone();
        self.v2_override = resources.override_cgroup_v2.clone();
        self
    }

    pub fn mode(&self) -> CgroupMode {
        self.mode
    }

    /// Final path for `controller`, or `None` when cgroups are off.
    ///
    /// Legacy: an absolute override replaces the default; a relative one is
    /// joined to the controller's hierarchy root. Unified: the single
    /// override replaces the path for every controller, relative ones
    /// joined to the cgroup root.
    pub fn resolve(&self, controller: &str, computed_default: &Path) -> Option<PathBuf> {
        match self.mode {
            CgroupMode::Off => None,
            CgroupMode::V1 => Some(match self.v1_overrides.get(controller) {
                Some(path) if path.is_absolute() => path.clone(),
                Some(relative) => self.root.join(controller).join(relative),
                None => computed_default.to_path_buf(),
            }),
            CgroupMode::V2 => Some(match &self.v2_override {
                Some(path) if path.is_absolute() => path.clone(),
                Some(relative) => self.root.join(relative),
                None => computed_default.to_path_buf(),
            }),
        }
    }

    /// Default path before overrides.
    pub fn default_path(&self, controller: &str, parent: &str, leaf: &str) -> PathBuf {
        match self.mode {
            CgroupMode::V1 => self.root.join(controller).join(parent).join(leaf),
            _ => self.root.join(parent).join(leaf),
        }
    }

    /// Resolve the full layout for a task.
    ///
    /// `cpuset_path` is the caller's cgroup for the task. On the legacy
    /// hierarchy it names the cpuset leaf and lends its final component to
    /// the other controllers; otherwise `leaf` is used.
    pub fn layout(&self, parent: &str, leaf: &str, cpuset_path: Option<&Path>) -> Option<CgroupLayout> {
        let mut paths = BTreeMap::new();
        match self.mode {
            CgroupMode::Off => return None,
            CgroupMode::V1 => {
                let leaf_name = cpuset_path
                    .and_then(|p| p.file_name())
                    .and_then(|n| n.to_str())
                    .unwrap_or(leaf);
                for controller in V1_CONTROLLERS {
                    let default = match (controller, cpuset_path) {
                        ("cpuset", Some(path)) => self.under(&self.root.join("cpuset"), path),
                        _ => self.default_path(controller, parent, leaf_name),
                    };
                    if let Some(resolved) = self.resolve(controller, &default) {
                        paths.insert(controller.to_string(), resolved);
                    }
                }
            }
            CgroupMode::V2 => {
                let default = match cpuset_path {
                    Some(path) => self.under(&self.root, path),
                    None => self.default_path(UNIFIED, parent, leaf),
                };
                if let Some(resolved) = self.resolve(UNIFIED, &default) {
                    paths.insert(UNIFIED.to_string(), resolved);
                }
            }
        }
        Some(CgroupLayout {
            mode: self.mode,
            root: self.root.clone(),
            paths,
        })
    }

    fn under(&self, base: &Path, path: &Path) -> PathBuf {
        if path.starts_with(base) {
            path.to_path_buf()
        } else {
            base.join(path.strip_prefix("/").unwrap_or(path))
        }
    }
}

/// Cgroup leaf name for a task of an allocation.
pub fn task_scope_name(alloc_id: &str, task: &str, mode: CgroupMode) -> String {
    match mode {
        CgroupMode::V2 => format!("{}.{}.scope", alloc_id, task),
        _ => format!("{}.{}", alloc_id, task),
    }
}
