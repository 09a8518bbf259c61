//! Filesystem isolation for the sandbox root
//!
//! Bind-mount planning is pure; applying it happens in the child's private
//! mount namespace.

pub mod sandbox;

pub use sandbox::{enter_root, host_target, mount_plan, BindMount, SandboxMounts};
