//! taskbox: task process sandbox executor
//!
//! Launches one workload process per launcher inside fresh namespaces, a
//! dedicated cgroup and a reduced capability set, then supervises it until
//! exit and teardown.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::namespace`]: namespace set construction and joining
//! - [`kernel::cgroup`]: path resolution, stale-occupant sweep, CPU share clamp, v1/v2 backends
//! - [`kernel::capabilities`]: capability set calculation and application
//! - [`kernel::devices`]: device allow-list rules
//! - [`kernel::mount`]: sandbox root, `/dev` and bind mounts
//! - [`kernel::credentials`]: task user lookup and identity transition
//! - [`kernel::signal`]: signal names and CLI signal capture
//!
//! ## Task Lifecycle ([`exec`])
//! - [`exec::launcher`]: `ProcessLauncher` (launch, wait, shutdown, exec, teardown)
//! - [`exec::preexec`]: type-state ordered child setup
//! - [`exec::nsexec`]: one-off commands inside a running sandbox
//! - [`exec::wait`]: exit caching and cancellable waits
//!
//! ## Launch Handshake ([`core`])
//! - [`core::supervisor`]: blocked clone and release
//! - [`core::proxy`]: child side of the handshake
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::sandbox_root`]: binary resolution confined to the task root
//! - [`safety::cleanup`]: idempotent cgroup teardown with retry
//!
//! ## Configuration ([`config`])
//! - [`config::config`]: node-level executor settings
//! - [`config::types`]: command specification, states and errors
//! - [`config::validator`]: pre-launch checks
//!
//! ## Utilities ([`utils`])
//! - [`utils::fd_closure`]: inherited descriptor closure
//! - [`utils::env_hygiene`]: task environment construction
//! - [`utils::output`]: bounded output capture

// Kernel Primitives
pub mod kernel;

// Task Lifecycle
pub mod exec;

// Launch Handshake
pub mod core;

// Safety & Cleanup
pub mod safety;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint for the taskbox binary
pub mod cli;

pub use config::config::ExecutorConfig;
pub use config::types::*;
pub use exec::{CancelToken, ProcessLauncher};
