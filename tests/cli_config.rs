//! Configuration files, command specs and the pure computations behind the
//! CLI subcommands.

use pretty_assertions::assert_eq;
use std::io::Write;
use std::path::PathBuf;
use taskbox::config::config::{CgroupModeSetting, ExecutorConfig};
use taskbox::config::validator::{validate_command, validate_or_reject};
use taskbox::kernel::capabilities::CapabilitySet;
use taskbox::kernel::cgroup::{task_scope_name, CgroupMode, CpuShareNormalizer, MAX_CPU_SHARES};
use taskbox::{CommandSpec, IsolationMode};

const FULL_SPEC: &str = r#"{
    "command": "redis-server",
    "args": ["--port", "6379"],
    "env": {"REDIS_PASSWORD": "x", "VAULT_TOKEN": "y"},
    "task_dir": "/var/lib/taskbox/alloc/redis",
    "work_dir": "/local",
    "resources": {
        "memory_bytes": 268435456,
        "cpu_shares": 500,
        "cpuset_cpus": "0-1",
        "override_cgroup_v1": {"pids": "custom/path"}
    },
    "pid_mode": "private",
    "ipc_mode": "host",
    "cap_add": ["net_raw"],
    "cap_drop": ["ALL"],
    "mounts": [{"host_path": "/srv/shared", "task_path": "/shared", "readonly": true}],
    "devices": [{"host_path": "/dev/fuse", "task_path": "/dev/fuse"}],
    "denied_envvars": ["*_TOKEN"]
}"#;

#[test]
fn test_full_spec_parses_and_validates() {
    let spec: CommandSpec = serde_json::from_str(FULL_SPEC).unwrap();
    assert_eq!(spec.command(), "redis-server");
    assert_eq!(spec.pid_mode(), IsolationMode::Private);
    assert_eq!(spec.ipc_mode(), IsolationMode::Host);
    assert!(spec.resource_limits());
    assert_eq!(spec.devices()[0].permissions, "rwm");
    assert_eq!(
        spec.resources().override_cgroup_v1.get("pids"),
        Some(&PathBuf::from("custom/path"))
    );

    let result = validate_or_reject(&spec).unwrap();
    assert!(result.warnings.is_empty());
}

#[test]
fn test_unknown_isolation_mode_is_host() {
    let spec: CommandSpec =
        serde_json::from_str(r#"{"command": "x", "task_dir": "/t", "pid_mode": "sideways"}"#).unwrap();
    assert_eq!(spec.pid_mode(), IsolationMode::Host);
}

#[test]
fn test_all_errors_reported_together() {
    let spec = CommandSpec::builder("", "relative/task")
        .oom_score_adj(-1)
        .memory_bytes(0)
        .build();
    let result = validate_command(&spec);
    assert!(!result.is_valid());
    assert_eq!(result.errors.len(), 4, "{:?}", result.errors);
}

#[test]
fn test_executor_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"cgroup_mode": "v2", "cgroup_parent": "nomad.slice", "denied_envvars": ["*AWS*"]}}"#
    )
    .unwrap();
    let config = ExecutorConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config.cgroup_mode, CgroupModeSetting::V2);
    assert_eq!(config.resolved_cgroup_mode(), CgroupMode::V2);
    assert_eq!(config.cgroup_parent, "nomad.slice");
    assert_eq!(config.exec_output_limit, ExecutorConfig::default().exec_output_limit);
}

#[test]
fn test_bad_config_file_is_configuration_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"cgroup_mode": "v3"}}"#).unwrap();
    assert!(ExecutorConfig::load_from_file(file.path()).unwrap_err().is_configuration());
    assert!(ExecutorConfig::load_from_file("/nonexistent/taskbox.json")
        .unwrap_err()
        .is_configuration());
}

#[test]
fn test_clamp_reference_values() {
    let m = MAX_CPU_SHARES;
    assert_eq!(CpuShareNormalizer::new(12_000).clamp(m), m);
    assert_eq!(CpuShareNormalizer::new(12_000).clamp(1_000), 1_000);
    assert_eq!(CpuShareNormalizer::new(m + 1).clamp(m), m - 1);
    assert_eq!(CpuShareNormalizer::new(m + 1).clamp(1), 2);
    assert_eq!(CpuShareNormalizer::new(2 * m).clamp(1_000), 500);
    assert_eq!(CpuShareNormalizer::new(2 * m).clamp(m), m / 2);
}

#[test]
fn test_caps_for_unprivileged_user() {
    let ceiling = CapabilitySet::full(40);
    let baseline = CapabilitySet::baseline_for_uid(1000, ceiling);
    assert_eq!(baseline.bits(), 0xa80405fb);

    let set = CapabilitySet::calculate(baseline, &["net_raw"], &["all"]).unwrap();
    assert_eq!(set.names(), vec!["net_raw"]);
}

#[test]
fn test_scope_names() {
    assert_eq!(task_scope_name("abc123", "web", CgroupMode::V2), "abc123.web.scope");
    assert_eq!(task_scope_name("abc123", "web", CgroupMode::V1), "abc123.web");
}
