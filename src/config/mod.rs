//! Configuration and validation
//!
//! Executor settings, the immutable command specification, and pre-launch checks.

pub mod config;
pub mod types;
pub mod validator;
