//! Configuration Management
//!
//! [`Settings`] is the persistent defaults file; [`RunConfig`] is the typed set
//! of parameters one run is executed with.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Units in flight at once
pub const DEFAULT_CONCURRENCY: usize = 20;

/// Detail calls in flight per unit
pub const DEFAULT_DETAIL_CONCURRENCY: usize = 4;

/// User configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Regions inventoried when none are given on the command line
    pub regions: Vec<String>,
    pub concurrency: usize,
    pub detail_concurrency: usize,
    /// Gateway endpoint template, see [`crate::remote::http::HttpGateway`]
    pub endpoint: Option<String>,
    /// Per-request timeout in seconds
    pub request_timeout_secs: Option<u64>,
    /// Directory of resource definitions replacing the built-in catalogue
    pub catalogue_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            regions: vec![],
            concurrency: DEFAULT_CONCURRENCY,
            detail_concurrency: DEFAULT_DETAIL_CONCURRENCY,
            endpoint: None,
            request_timeout_secs: None,
            catalogue_dir: None,
        }
    }
}

impl Settings {
    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("cloudinv").join("config.json"))
    }

    /// Load configuration from disk, falling back to defaults
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };

        if !path.exists() {
            return Self::default();
        }

        match Self::load_from(&path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Ignoring unreadable config {}: {:#}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path().context("No config directory on this platform")?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }
}

/// Parameters of one inventory run
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Resource ids to inventory, empty = whole catalogue
    pub resources: Vec<String>,
    /// Enabled regions, already checked for connectivity by the caller
    pub regions: Vec<String>,
    pub concurrency: usize,
    pub detail_concurrency: usize,
    /// Attach run metadata to the report
    pub with_meta: bool,
    /// Add derived fields to items
    pub with_extra: bool,
    /// Keep leaves for units that produced nothing
    pub with_empty: bool,
    /// Deadline for the whole run
    pub deadline: Option<Duration>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            resources: vec![],
            regions: vec![],
            concurrency: DEFAULT_CONCURRENCY,
            detail_concurrency: DEFAULT_DETAIL_CONCURRENCY,
            with_meta: false,
            with_extra: false,
            with_empty: false,
            deadline: None,
        }
    }
}

impl RunConfig {
    /// Start from the persisted defaults
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            regions: settings.regions.clone(),
            concurrency: settings.concurrency,
            detail_concurrency: settings.detail_concurrency,
            ..Self::default()
        }
    }

    pub fn with_regions(mut self, regions: &[&str]) -> Self {
        self.regions = regions.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn with_resources(mut self, resources: &[&str]) -> Self {
        self.resources = resources.iter().map(|r| r.to_string()).collect();
        self
    }

    /// Concurrency limits below one are raised to one
    pub fn concurrency(&self) -> usize {
        self.concurrency.max(1)
    }
}
