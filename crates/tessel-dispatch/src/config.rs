//! Dispatch configuration.
//!
//! Defaults are usable as-is; `from_env` layers the `TESSEL_*` environment
//! variables on top and `from_json_file` reads a serialized config.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DispatchError, Result};

/// Environment variable that opts tuning in.
pub const AUTOTUNE_ENV: &str = "TESSEL_AUTOTUNE";
/// Environment variable naming a JSON table file.
pub const TABLES_ENV: &str = "TESSEL_TABLES";

/// How output regions with no argument record are zeroed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroingMode {
    /// Zero the whole output before the launch.
    #[default]
    PreZero,
    /// Emit explicit zero-fill regions alongside the argument records.
    InPass,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// `Some` forces tuning on or off; `None` defers to `TESSEL_AUTOTUNE`.
    pub autotune: Option<bool>,
    pub zeroing: ZeroingMode,
    /// Group count at which argument building goes parallel.
    pub parallel_group_threshold: usize,
    /// JSON table file replacing the built-in presets.
    pub tables_path: Option<PathBuf>,
    pub tuning_warmup: usize,
    pub tuning_iters: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            autotune: None,
            zeroing: ZeroingMode::PreZero,
            parallel_group_threshold: 16,
            tables_path: None,
            tuning_warmup: 1,
            tuning_iters: 3,
        }
    }
}

impl DispatchConfig {
    /// Defaults plus `TESSEL_TABLES` and `TESSEL_AUTOTUNE`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(path) = std::env::var_os(TABLES_ENV) {
            cfg.tables_path = Some(PathBuf::from(path));
        }
        if let Ok(value) = std::env::var(AUTOTUNE_ENV) {
            cfg.autotune = Some(is_truthy(&value));
        }
        cfg
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| DispatchError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: Self =
            serde_json::from_str(text).map_err(|e| DispatchError::Config(e.to_string()))?;
        cfg.validated()
    }

    fn validated(mut self) -> Result<Self> {
        if self.tuning_iters == 0 {
            return Err(DispatchError::Config("tuning_iters must be at least 1".into()));
        }
        if self.parallel_group_threshold == 0 {
            warn!("parallel_group_threshold of 0 treated as 1");
            self.parallel_group_threshold = 1;
        }
        Ok(self)
    }

    /// Whether a lookup miss should be tuned. Re-reads the environment on
    /// every call unless the config forces a value.
    pub fn autotune_enabled(&self) -> bool {
        match self.autotune {
            Some(forced) => forced,
            None => std::env::var(AUTOTUNE_ENV).map(|v| is_truthy(&v)).unwrap_or(false),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes"
    )
}
