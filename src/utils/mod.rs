//! Utilities
//!
//! Descriptor closure, environment construction and bounded output capture.

pub mod env_hygiene;
pub mod fd_closure;
pub mod output;
