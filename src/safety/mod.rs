//! Safety and cleanup
//!
//! Path confinement for the sandbox root and guaranteed release of claimed
//! cgroups.

pub mod cleanup;
pub mod sandbox_root;
