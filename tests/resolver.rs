//! Binary resolution against realistic task directory layouts.
//!
//! Pure filesystem work under a temp dir; no privileges needed.

use pretty_assertions::assert_eq;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use taskbox::safety::sandbox_root::SandboxRoot;
use taskbox::{MountConfig, TaskboxError};

fn touch(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, "#!/bin/sh\n").unwrap();
}

fn mount(host: &Path, task: &str) -> MountConfig {
    MountConfig {
        host_path: host.to_path_buf(),
        task_path: PathBuf::from(task),
        readonly: true,
    }
}

#[test]
fn test_absolute_path_through_mount() {
    let root = tempfile::tempdir().unwrap();
    let host = tempfile::tempdir().unwrap();
    touch(&host.path().join("bin/server"));

    let sandbox = SandboxRoot::new(root.path(), &[mount(host.path(), "/opt/app")]);
    let found = sandbox.resolve_binary("/opt/app/bin/server").unwrap();
    assert_eq!(found.task_path, PathBuf::from("/opt/app/bin/server"));
    assert_eq!(found.host_path, host.path().join("bin/server"));
}

#[test]
fn test_longest_mount_wins() {
    let root = tempfile::tempdir().unwrap();
    let outer = tempfile::tempdir().unwrap();
    let inner = tempfile::tempdir().unwrap();
    touch(&outer.path().join("tools/run"));
    touch(&inner.path().join("run"));

    let sandbox = SandboxRoot::new(
        root.path(),
        &[mount(outer.path(), "/opt"), mount(inner.path(), "/opt/tools")],
    );
    let found = sandbox.resolve_binary("/opt/tools/run").unwrap();
    assert_eq!(found.host_path, inner.path().join("run"));
}

#[test]
fn test_bare_names_ignore_mounts() {
    let root = tempfile::tempdir().unwrap();
    let host = tempfile::tempdir().unwrap();
    touch(&host.path().join("tool"));

    let sandbox = SandboxRoot::new(root.path(), &[mount(host.path(), "/usr/bin")]);
    let err = sandbox.resolve_binary("tool").unwrap_err();
    assert!(matches!(err, TaskboxError::BinaryNotFound { .. }));
}

#[test]
fn test_task_local_dir_before_system_dirs() {
    let root = tempfile::tempdir().unwrap();
    touch(&root.path().join("usr/bin/python3"));
    touch(&root.path().join("local/python3"));

    let found = SandboxRoot::new(root.path(), &[]).resolve_binary("python3").unwrap();
    assert_eq!(found.task_path, PathBuf::from("/local/python3"));
}

#[test]
fn test_symlink_pointing_outside_is_rerooted() {
    let root = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    touch(&outside.path().join("secret"));
    fs::create_dir_all(root.path().join("bin")).unwrap();
    symlink(outside.path().join("secret"), root.path().join("bin/secret")).unwrap();

    // The absolute target restarts at the task root, where it does not exist
    let err = SandboxRoot::new(root.path(), &[]).resolve_binary("/bin/secret").unwrap_err();
    assert!(err.is_resolution());
}

#[test]
fn test_relative_symlink_escape() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir_all(root.path().join("bin")).unwrap();
    symlink("../../../../etc/passwd", root.path().join("bin/passwd")).unwrap();

    let err = SandboxRoot::new(root.path(), &[]).resolve_binary("/bin/passwd").unwrap_err();
    assert!(matches!(err, TaskboxError::Escape { .. }));
}

#[test]
fn test_parent_segments_cannot_leave_through_mount() {
    let root = tempfile::tempdir().unwrap();
    let host = tempfile::tempdir().unwrap();
    let sandbox = SandboxRoot::new(root.path(), &[mount(host.path(), "/data")]);

    // Climbing above the root is rejected outright
    let err = sandbox.resolve_binary("/data/../../../../../../bin/sh").unwrap_err();
    assert!(matches!(err, TaskboxError::Escape { .. }));

    // Leaving the mount lands back in the task root, never the host
    let err = sandbox.resolve_binary("/data/../bin/sh").unwrap_err();
    assert!(matches!(err, TaskboxError::BinaryNotFound { .. }));

    touch(&root.path().join("bin/sh"));
    let found = sandbox.resolve_binary("/data/../bin/sh").unwrap();
    assert_eq!(found.task_path, PathBuf::from("/bin/sh"));
    assert_eq!(found.host_path, root.path().join("bin/sh"));
}

#[test]
fn test_symlink_inside_mount_stays_in_mount() {
    let root = tempfile::tempdir().unwrap();
    let host = tempfile::tempdir().unwrap();
    touch(&host.path().join("releases/v2/server"));
    fs::create_dir_all(host.path().join("bin")).unwrap();
    symlink("../releases/v2/server", host.path().join("bin/server")).unwrap();
    symlink("../../../../../../bin/sh", host.path().join("bin/shell")).unwrap();

    let sandbox = SandboxRoot::new(root.path(), &[mount(host.path(), "/opt/app")]);
    let found = sandbox.resolve_binary("/opt/app/bin/server").unwrap();
    assert_eq!(found.task_path, PathBuf::from("/opt/app/releases/v2/server"));
    assert_eq!(found.host_path, host.path().join("releases/v2/server"));

    let err = sandbox.resolve_binary("/opt/app/bin/shell").unwrap_err();
    assert!(matches!(err, TaskboxError::Escape { .. }));
}

#[test]
fn test_mount_shadows_root_contents() {
    let root = tempfile::tempdir().unwrap();
    let host = tempfile::tempdir().unwrap();
    // Hidden by the mount once the task starts
    touch(&root.path().join("opt/app/run"));

    let sandbox = SandboxRoot::new(root.path(), &[mount(host.path(), "/opt/app")]);
    let err = sandbox.resolve_binary("/opt/app/run").unwrap_err();
    assert!(matches!(err, TaskboxError::BinaryNotFound { .. }));
}
