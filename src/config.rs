use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

pub const DEFAULT_BASE_URL: &str = "https://ftp.ncbi.nlm.nih.gov/pub/pmc/oa_bulk/oa_comm/xml/";
pub const DEFAULT_SOURCE_NAME: &str = "pmc";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Courtesy delay slept between successive downloads, in seconds.
    #[serde(default = "default_download_delay")]
    pub download_delay_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Optional half-open PMCID filter applied to the catalog.
    #[serde(default)]
    pub pmcid_min: Option<u64>,
    #[serde(default)]
    pub pmcid_max: Option<u64>,
    /// When false, existing documents for this source are never rewritten.
    #[serde(default = "default_true")]
    pub allow_updates: bool,
    #[serde(default = "default_source_name")]
    pub source_name: String,
    /// SQLite file the importer writes to. Defaults to documents.sqlite
    /// inside the output directory.
    #[serde(default)]
    pub database_path: Option<String>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            base_url: default_base_url(),
            download_delay_secs: default_download_delay(),
            batch_size: default_batch_size(),
            pmcid_min: None,
            pmcid_max: None,
            allow_updates: true,
            source_name: default_source_name(),
            database_path: None,
        }
    }
}

impl HarvestConfig {
    pub fn resolve(path: Option<&str>) -> Result<Self, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("pmc-harvest.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| HarvestError::ConfigParse(err.to_string()))
    }

    pub fn resolved_database_path(&self) -> String {
        self.database_path
            .clone()
            .unwrap_or_else(|| format!("{}/documents.sqlite", self.output_dir))
    }
}

fn default_output_dir() -> String {
    "pmc_data".to_string()
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_download_delay() -> u64 {
    5
}

fn default_batch_size() -> usize {
    100
}

fn default_source_name() -> String {
    DEFAULT_SOURCE_NAME.to_string()
}

fn default_true() -> bool {
    true
}
