use crate::config::config::{detect_total_compute, ExecutorConfig};
use crate::config::types::{CommandSpec, LauncherState, ProcessState};
use crate::config::validator::validate_command;
use crate::exec::launcher::ProcessLauncher;
use crate::kernel::capabilities::{agent_ceiling, CapabilitySet};
use crate::kernel::cgroup::{open_backend, sweep_stale_occupants, CgroupLayout, CpuShareNormalizer};
use crate::kernel::credentials::TaskUser;
use crate::kernel::signal::SignalHandler;
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use nix::sys::signal::Signal;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Poll interval of the run loop while the task is alive.
const RUN_POLL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a task, wait for it and print its final state
    Run {
        /// Command specification (JSON)
        #[arg(long)]
        spec: PathBuf,
        /// Executor configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Shut the task down after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Check a command specification without launching it
    Validate {
        #[arg(long)]
        spec: PathBuf,
    },
    /// Print the capability set a task would run with
    Caps {
        /// Task user; the current user if absent
        #[arg(long)]
        user: Option<String>,
        #[arg(long = "add", value_name = "CAP")]
        add: Vec<String>,
        #[arg(long = "drop", value_name = "CAP")]
        drop: Vec<String>,
    },
    /// Kill every process left in a cgroup
    Sweep {
        /// Cgroup directory
        #[arg(long)]
        cgroup: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the normalized CPU share value
    Clamp {
        #[arg(long)]
        shares: u64,
        /// Node compute in MHz; detected when absent
        #[arg(long)]
        total_compute: Option<u64>,
    },
}

#[derive(Serialize)]
struct CapsReport {
    user: String,
    uid: u32,
    mask: String,
    capabilities: Vec<&'static str>,
}

fn load_config(path: Option<&Path>) -> Result<ExecutorConfig> {
    match path {
        Some(path) => Ok(ExecutorConfig::load_from_file(path)?),
        None => Ok(ExecutorConfig::default()),
    }
}

fn load_spec(path: &Path) -> Result<CommandSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read spec file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse spec file {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse arguments and run the chosen command; returns the process exit code.
pub fn run() -> Result<i32> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if !cfg!(target_os = "linux") {
        return Err(anyhow!("taskbox requires Linux namespaces and cgroups"));
    }

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            spec,
            config,
            timeout,
        } => {
            let config = load_config(config.as_deref())?;
            let spec = load_spec(&spec)?;
            let state = run_task(config, spec, timeout.map(Duration::from_secs))?;
            print_json(&state)?;
            Ok(state.exit_code)
        }
        Commands::Validate { spec } => {
            let result = validate_command(&load_spec(&spec)?);
            print_json(&result)?;
            Ok(if result.is_valid() { 0 } else { 1 })
        }
        Commands::Caps { user, add, drop } => {
            let user = TaskUser::resolve(user.as_deref())?;
            let ceiling = agent_ceiling();
            let baseline = CapabilitySet::baseline_for_uid(user.uid, ceiling);
            let set = CapabilitySet::calculate(baseline, &add, &drop)?.within(ceiling);
            print_json(&CapsReport {
                user: user.name,
                uid: user.uid,
                mask: format!("{:#x}", set.bits()),
                capabilities: set.names(),
            })?;
            Ok(0)
        }
        Commands::Sweep { cgroup, config } => {
            let config = load_config(config.as_deref())?;
            let mode = config.resolved_cgroup_mode();
            let layout = CgroupLayout::single(mode, &config.cgroup_root, &cgroup);
            let backend = open_backend(&layout)
                .ok_or_else(|| anyhow!("cgroups are not available under {}", config.cgroup_root.display()))?;
            let report = sweep_stale_occupants(backend.as_ref(), config.sweep_timeout());
            print_json(&report)?;
            Ok(if report.is_clean() { 0 } else { 1 })
        }
        Commands::Clamp {
            shares,
            total_compute,
        } => {
            let total = total_compute.unwrap_or_else(detect_total_compute);
            println!("{}", CpuShareNormalizer::new(total).clamp(shares));
            Ok(0)
        }
    }
}

/// Launch `spec` and supervise it until it has been torn down.
///
/// A signal to the CLI, or the timeout, shuts the task down with the
/// configured grace period.
fn run_task(config: ExecutorConfig, spec: CommandSpec, timeout: Option<Duration>) -> Result<ProcessState> {
    let signals = SignalHandler::init()?;
    let grace = config.shutdown_grace();
    let launcher = ProcessLauncher::new(config);
    let command = spec.command().to_string();

    let started = launcher.launch(spec)?;
    log::info!("Task {} running as pid {}", command, started.pid);

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut shutdown_sent = false;
    let state = loop {
        if let Some(state) = launcher.wait_timeout(RUN_POLL)? {
            break state;
        }
        if shutdown_sent {
            continue;
        }

        let reason = if signals.shutdown_requested() {
            let name = Signal::try_from(signals.received())
                .map(|s| s.as_str())
                .unwrap_or("SIGTERM");
            Some(format!("received {}", name))
        } else if deadline.is_some_and(|d| Instant::now() >= d) {
            Some("timeout reached".to_string())
        } else {
            None
        };

        if let Some(reason) = reason {
            log::info!("Shutting down task {}: {}", command, reason);
            shutdown_sent = true;
            launcher.shutdown("SIGTERM", grace)?;
        }
    };

    if !launcher.wait_torn_down(Duration::from_secs(30)) {
        log::warn!("Task {} teardown did not finish", command);
    }
    if launcher.state() != LauncherState::TornDown {
        log::debug!("Launcher ended in state {:?}", launcher.state());
    }
    Ok(state)
}
