//! Cgroup resource governance
//!
//! Path resolution and share normalization are pure; the v1/v2 backends
//! touch the cgroup filesystem behind the [`CgroupBackend`] trait.

pub mod backend;
pub mod mode;
pub mod paths;
pub mod shares;
pub mod sweep;
pub mod v1;
pub mod v2;

pub use backend::{open_backend, CgroupBackend, CgroupLimits};
pub use mode::CgroupMode;
pub use paths::{task_scope_name, CgroupLayout, CgroupPathResolver};
pub use shares::{shares_to_weight, CpuShareNormalizer, MAX_CPU_SHARES, MIN_CPU_SHARES};
pub use sweep::{sweep_stale_occupants, SweepReport};
