/// Run configuration.
///
/// Built from command-line flags, optionally layered over a JSON file.
use crate::error::CorrelateError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Evidence directory, walked recursively.
    pub input: PathBuf,
    /// Forces the log grammar selector instead of the SOFTWARE hive's
    /// `CurrentVersion`.
    pub os_version_override: Option<String>,
    /// Extension (without the dot) of install-log files.
    pub log_extension: String,
    pub follow_links: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            os_version_override: None,
            log_extension: "log".to_string(),
            follow_links: false,
        }
    }
}

impl RunConfig {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            ..Self::default()
        }
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, CorrelateError> {
        let text = std::fs::read_to_string(path).map_err(|e| CorrelateError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| CorrelateError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn is_log_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&self.log_extension))
    }
}
