// ⚙️ Import Configuration - one immutable struct handed to every stage
//
// Loaded from TOML. Every tunable the pipeline needs (paths, batch size,
// tax ids, download cadence) lives here instead of module globals.

use crate::error::{ImportError, ImportResult};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

// ============================================================================
// REPAIR STRATEGY
// ============================================================================

/// How the sanitize stage repairs undecodable bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RepairStrategy {
    /// Drop each offending byte, keep the rest of the line
    #[default]
    Excise,

    /// Re-decode the whole line: UTF-8, then Windows-1252, then U+FFFD
    Transcode,
}

impl std::str::FromStr for RepairStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "excise" => Ok(RepairStrategy::Excise),
            "transcode" => Ok(RepairStrategy::Transcode),
            other => Err(format!("unknown repair strategy: {}", other)),
        }
    }
}

// ============================================================================
// LOGGING CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ============================================================================
// IMPORT CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    // ========================================================================
    // VENDOR SETTINGS (what the operator edits)
    // ========================================================================
    /// URL of the vendor CSV
    pub source_url: String,

    /// Reuse the last download while it is younger than this
    #[serde(default = "default_refresh_period")]
    pub refresh_period_seconds: i64,

    /// Comma-separated top-level categories, entries may be quoted.
    /// Empty or missing imports everything.
    #[serde(default)]
    pub category_allow_list: Option<String>,

    /// Markup applied to the vendor price
    #[serde(default = "default_margin")]
    pub margin_percent: f64,

    // ========================================================================
    // PATHS
    // ========================================================================
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// SQLite file holding the catalog and the ledger
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    // ========================================================================
    // DOWNLOAD TUNING
    // ========================================================================
    #[serde(default = "default_timeout")]
    pub download_timeout_secs: u64,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_progress_bytes")]
    pub progress_bytes: u64,

    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,

    // ========================================================================
    // RECONCILIATION TUNING
    // ========================================================================
    #[serde(default = "default_batch_size")]
    pub create_batch_size: usize,

    /// Rate of the sales tax assigned to new products
    #[serde(default = "default_tax_rate")]
    pub tax_rate: f64,

    #[serde(default = "default_tax_object_id")]
    pub tax_object_id: String,

    #[serde(default = "default_uom_category_id")]
    pub uom_category_id: i64,

    #[serde(default)]
    pub repair_strategy: RepairStrategy,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_refresh_period() -> i64 {
    3600
}

fn default_margin() -> f64 {
    15.0
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("/tmp/syscom_downloads")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("syscom_catalog.db")
}

fn default_timeout() -> u64 {
    300
}

fn default_chunk_size() -> usize {
    8 * 1024
}

fn default_progress_bytes() -> u64 {
    1024 * 1024
}

fn default_progress_interval() -> u64 {
    5
}

fn default_batch_size() -> usize {
    5000
}

fn default_tax_rate() -> f64 {
    16.0
}

fn default_tax_object_id() -> String {
    "02".to_string()
}

fn default_uom_category_id() -> i64 {
    1
}

impl ImportConfig {
    /// Config with every default filled in
    pub fn new(source_url: impl Into<String>) -> Self {
        ImportConfig {
            source_url: source_url.into(),
            refresh_period_seconds: default_refresh_period(),
            category_allow_list: None,
            margin_percent: default_margin(),
            download_dir: default_download_dir(),
            database_path: default_database_path(),
            download_timeout_secs: default_timeout(),
            chunk_size: default_chunk_size(),
            progress_bytes: default_progress_bytes(),
            progress_interval_secs: default_progress_interval(),
            create_batch_size: default_batch_size(),
            tax_rate: default_tax_rate(),
            tax_object_id: default_tax_object_id(),
            uom_category_id: default_uom_category_id(),
            repair_strategy: RepairStrategy::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn from_toml_str(raw: &str) -> ImportResult<Self> {
        let config: ImportConfig =
            toml::from_str(raw).map_err(|e| ImportError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> ImportResult<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))
            .map_err(|e| ImportError::Config(format!("{:#}", e)))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> ImportResult<()> {
        if self.source_url.trim().is_empty() {
            return Err(ImportError::Config("source_url is empty".to_string()));
        }
        if self.refresh_period_seconds <= 0 {
            return Err(ImportError::Config(format!(
                "refresh_period_seconds must be positive, got {}",
                self.refresh_period_seconds
            )));
        }
        if !self.margin_percent.is_finite() || self.margin_percent < 0.0 {
            return Err(ImportError::Config(format!(
                "margin_percent must be a non-negative number, got {}",
                self.margin_percent
            )));
        }
        if self.create_batch_size == 0 {
            return Err(ImportError::Config("create_batch_size must be > 0".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(ImportError::Config("chunk_size must be > 0".to_string()));
        }
        Ok(())
    }

    /// Parsed allow-list; empty means "import every category"
    pub fn allowed_categories(&self) -> Vec<String> {
        self.category_allow_list
            .as_deref()
            .map(parse_allow_list)
            .unwrap_or_default()
    }

    /// Stable fingerprint used to serialize runs against the same target
    pub fn identity(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source_url.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.download_dir.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.database_path.to_string_lossy().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Split a comma list, trimming whitespace and surrounding quotes
pub fn parse_allow_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(clean_category)
        .filter(|c| !c.is_empty())
        .collect()
}

/// Trim whitespace and `"`/`'` from both ends
pub fn clean_category(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c.is_whitespace())
        .to_string()
}
