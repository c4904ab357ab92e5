use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::Deserialize;

use crate::backend::BackendKind;
use crate::policy::GainMode;

/// Application configuration loaded from TOML config file.
/// Every field has a default, so the config file is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Directories to search when none are given on the command line.
    pub music_dirs: Vec<PathBuf>,
    /// Number of albums analyzed in parallel. 0 = number of cores.
    pub jobs: usize,
    /// Default gain type when `--gain-type` is not given.
    pub gain_type: Option<GainMode>,
    /// Default backend when `--backend` is not given.
    pub backend: Option<BackendKind>,
    /// Replaces the built-in list of audio file extensions.
    pub extensions: Vec<String>,
    /// Location of the bs1770gain executable.
    pub bs1770gain_path: Option<PathBuf>,
}

impl AppConfig {
    /// Load config from `~/.config/rgsweep/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<AppConfig>(&contents) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                Self::default()
            }
        }
    }

    /// Resolve job count: explicit value, then config, then core count.
    pub fn resolve_jobs(&self, cli_jobs: Option<usize>) -> usize {
        match cli_jobs.filter(|&j| j > 0) {
            Some(jobs) => jobs,
            None if self.jobs > 0 => self.jobs,
            None => default_job_count(),
        }
    }

    /// Configured extensions, normalized; `None` means use the built-in list.
    pub fn extensions(&self) -> Option<Vec<String>> {
        let exts: Vec<String> = self
            .extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        (!exts.is_empty()).then_some(exts)
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Detected core count, falling back to 1.
pub fn default_job_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
