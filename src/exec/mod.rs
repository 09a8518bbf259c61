//! Task lifecycle
//!
//! Launch, wait, shutdown and exec for a single task process.

pub mod launcher;
pub mod nsexec;
pub mod preexec;
pub mod wait;

pub use launcher::ProcessLauncher;
pub use wait::CancelToken;
