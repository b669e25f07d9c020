//! Unit-of-work configuration.

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Behavior switches for [`UnitOfWork`](crate::unit_of_work::UnitOfWork).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitOfWorkConfig {
    /// Run `check_for_updates` at the start of every commit.
    pub detect_changes: bool,
    /// Re-capture the change baseline of updated entities once their commit succeeded.
    pub refresh_baselines: bool,
}

impl Default for UnitOfWorkConfig {
    fn default() -> Self {
        Self {
            detect_changes: true,
            refresh_baselines: true,
        }
    }
}

impl UnitOfWorkConfig {
    pub fn from_json(json: &str) -> Result<Self, StorageError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Defaults overridden by `FORGEORM_DETECT_CHANGES` / `FORGEORM_REFRESH_BASELINES`.
    ///
    /// Unset or unparsable variables keep the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            detect_changes: env_flag("FORGEORM_DETECT_CHANGES").unwrap_or(defaults.detect_changes),
            refresh_baselines: env_flag("FORGEORM_REFRESH_BASELINES")
                .unwrap_or(defaults.refresh_baselines),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok()?.trim().parse::<bool>().ok()
}
