use crate::config::types::{Result, TaskboxError};
use nix::unistd::{getuid, User};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identity a task runs as.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl TaskUser {
    /// Resolve a user name from the host's user database.
    pub fn lookup(name: &str) -> Result<Self> {
        let user = User::from_name(name)
            .map_err(|e| TaskboxError::Configuration(format!("failed to look up user {}: {}", name, e)))?
            .ok_or_else(|| TaskboxError::Configuration(format!("unknown user: {}", name)))?;
        Ok(Self::from_entry(user))
    }

    /// The agent's own identity, used when a task names no user.
    pub fn current() -> Self {
        let uid = getuid();
        match User::from_uid(uid) {
            Ok(Some(user)) => Self::from_entry(user),
            _ => Self {
                name: uid.as_raw().to_string(),
                uid: uid.as_raw(),
                gid: nix::unistd::getgid().as_raw(),
                home: PathBuf::from("/"),
            },
        }
    }

    /// `lookup` for `Some`, `current` otherwise.
    pub fn resolve(name: Option<&str>) -> Result<Self> {
        match name {
            Some(name) if !name.trim().is_empty() => Self::lookup(name.trim()),
            _ => Ok(Self::current()),
        }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    fn from_entry(user: User) -> Self {
        Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_root() {
        let root = TaskUser::lookup("root").unwrap();
        assert_eq!(root.uid, 0);
        assert_eq!(root.gid, 0);
        assert!(root.is_root());
    }

    #[test]
    fn test_unknown_user_is_configuration_error() {
        let err = TaskUser::lookup("no-such-user-taskbox").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_resolve_defaults_to_current() {
        let current = TaskUser::resolve(None).unwrap();
        assert_eq!(current.uid, getuid().as_raw());
        assert_eq!(TaskUser::resolve(Some("  ")).unwrap(), current);
    }
}
