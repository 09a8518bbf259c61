/// Environment construction for task processes
///
/// The task's environment is built only from the command's own map; the
/// agent's environment is never inherited.
use crate::config::types::{Result, TaskboxError};
use crate::kernel::credentials::TaskUser;
use glob::Pattern;
use std::collections::BTreeMap;

/// Denied-variable patterns from the executor and the task.
#[derive(Clone, Debug, Default)]
pub struct EnvPolicy {
    denied: Vec<Pattern>,
}

impl EnvPolicy {
    pub fn new<S: AsRef<str>>(executor_denied: &[S], task_denied: &[S]) -> Result<Self> {
        let denied = executor_denied
            .iter()
            .chain(task_denied.iter())
            .map(|raw| {
                Pattern::new(raw.as_ref()).map_err(|e| {
                    TaskboxError::Configuration(format!(
                        "invalid denied env pattern '{}': {}",
                        raw.as_ref(),
                        e
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { denied })
    }

    pub fn is_denied(&self, key: &str) -> bool {
        self.denied.iter().any(|pattern| pattern.matches(key))
    }
}

/// Sorted `KEY=VALUE` list with denied keys removed.
///
/// `USER` and `HOME` come from the task user unless the command sets them.
pub fn build_env_list(
    env: &BTreeMap<String, String>,
    policy: &EnvPolicy,
    user: Option<&TaskUser>,
) -> Vec<String> {
    let mut merged = env.clone();
    if let Some(user) = user {
        merged
            .entry("USER".to_string())
            .or_insert_with(|| user.name.clone());
        merged
            .entry("HOME".to_string())
            .or_insert_with(|| user.home.display().to_string());
    }

    merged
        .into_iter()
        .filter(|(key, _)| {
            let denied = policy.is_denied(key);
            if denied {
                log::debug!("Dropping denied environment variable {}", key);
            }
            !denied
        })
        .map(|(key, value)| format!("{}={}", key, value))
        .collect()
}

/// Validation message for a bad key, if any.
pub fn invalid_env_key(key: &str) -> Option<String> {
    if key.is_empty() {
        Some("environment variable name must not be empty".to_string())
    } else if key.contains('=') {
        Some(format!("environment variable name '{}' must not contain '='", key))
    } else if key.contains('\0') {
        Some(format!("environment variable name '{}' must not contain NUL", key.escape_default()))
    } else {
        None
    }
}
