//! Launch handshake.
//!
//! The supervisor clones the task child and holds it until the cgroup is
//! ready; the proxy is the child's side of that exchange.

pub mod proxy;
pub mod supervisor;
pub mod types;
