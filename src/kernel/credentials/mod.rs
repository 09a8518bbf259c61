//! Task user lookup and UID/GID transitions.
//!
//! setresgid MUST run before setresuid.

mod transition;
mod user;

pub use transition::transition_to;
pub use user::TaskUser;
