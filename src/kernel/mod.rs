//! Thin wrappers around Linux kernel primitives.
//!
//! `unsafe` code is concentrated here with SAFETY comments.
//! Dependency direction: signal -> namespace -> capabilities -> credentials -> devices -> mount -> cgroup

pub mod capabilities;
pub mod cgroup;
pub mod credentials;
pub mod devices;
pub mod mount;
pub mod namespace;
pub mod signal;
