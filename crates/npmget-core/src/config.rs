use crate::error::Error;
use crate::pkg::registry::{DEFAULT_REGISTRY, REGISTRY_ENV};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Project-level settings file, looked up in the working directory.
pub const SETTINGS_FILE: &str = ".npmgetrc.json";

/// Runtime configuration for the npmget CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Current working directory.
    pub cwd: PathBuf,

    /// Whether to emit JSON logs.
    pub json_logs: bool,

    /// Verbosity level (0 = INFO, 1 = DEBUG, 2+ = TRACE).
    pub verbosity: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            json_logs: false,
            verbosity: 0,
        }
    }
}

impl Config {
    /// Create a new config with the given working directory.
    #[must_use]
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            ..Default::default()
        }
    }

    /// Set verbosity level.
    #[must_use]
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Set JSON log output.
    #[must_use]
    pub fn with_json_logs(mut self, json: bool) -> Self {
        self.json_logs = json;
        self
    }

    /// Path of the settings file for this working directory.
    #[must_use]
    pub fn settings_path(&self) -> PathBuf {
        self.cwd.join(SETTINGS_FILE)
    }

    /// Load `.npmgetrc.json` from the working directory, if present.
    pub fn load_settings(&self) -> Result<Settings, Error> {
        Settings::load(&self.settings_path())
    }
}

/// Install settings from `.npmgetrc.json`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Registry base URL.
    pub registry: Option<String>,
    /// Modules directory, relative to the working directory.
    pub modules_dir: Option<PathBuf>,
    /// Fetch concurrency limit.
    pub concurrency: Option<usize>,
    /// Stop at the first failure.
    pub fail_fast: Option<bool>,
}

impl Settings {
    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(Error::ConfigRead {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_str(&content).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Registry to use: explicit override, then `NPMGET_REGISTRY`, then the
    /// settings file, then the public registry.
    #[must_use]
    pub fn registry_url(&self, explicit: Option<&str>) -> String {
        if let Some(url) = explicit.filter(|u| !u.is_empty()) {
            return url.to_string();
        }

        if let Ok(url) = std::env::var(REGISTRY_ENV) {
            if !url.is_empty() {
                return url;
            }
        }

        self.registry
            .clone()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_REGISTRY.to_string())
    }

    /// Modules directory resolved against `cwd`.
    #[must_use]
    pub fn modules_root(&self, cwd: &Path, explicit: Option<&Path>) -> PathBuf {
        let dir = explicit
            .map(Path::to_path_buf)
            .or_else(|| self.modules_dir.clone())
            .unwrap_or_else(|| PathBuf::from("node_modules"));
        cwd.join(dir)
    }
}
