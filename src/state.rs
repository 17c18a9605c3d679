use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::HarvestError;
use crate::store::Store;

const MAX_RECENT_ERRORS: usize = 10;

/// One remote package and its local download status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageInfo {
    pub filename: String,
    pub pmcid_start: u64,
    pub pmcid_end: u64,
    #[serde(default)]
    pub size_bytes: u64,
    pub url: String,
    #[serde(default)]
    pub downloaded: bool,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub download_date: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DownloadProgress {
    #[serde(default)]
    pub total_packages: usize,
    #[serde(default)]
    pub downloaded_packages: usize,
    #[serde(default)]
    pub verified_packages: usize,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub downloaded_bytes: u64,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl DownloadProgress {
    pub fn push_error(&mut self, message: String) {
        self.errors.push(message);
        if self.errors.len() > MAX_RECENT_ERRORS {
            let excess = self.errors.len() - MAX_RECENT_ERRORS;
            self.errors.drain(..excess);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportProgress {
    #[serde(default)]
    pub processed_articles: usize,
    #[serde(default)]
    pub imported_articles: usize,
    #[serde(default)]
    pub updated_articles: usize,
    #[serde(default)]
    pub skipped_articles: usize,
    #[serde(default)]
    pub failed_articles: usize,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl ImportProgress {
    pub fn push_error(&mut self, message: String) {
        self.errors.push(message);
        if self.errors.len() > MAX_RECENT_ERRORS {
            let excess = self.errors.len() - MAX_RECENT_ERRORS;
            self.errors.drain(..excess);
        }
    }
}

/// Shape shared by both state files. `import_state.json` carries the
/// `import_progress` key; readers tolerate any key being absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub packages: BTreeMap<String, PackageInfo>,
    #[serde(default)]
    pub progress: DownloadProgress,
    #[serde(default)]
    pub import_progress: ImportProgress,
}

/// Best-effort JSON checkpoint. Download and import state live in separate
/// files so corruption in one never destroys the other's progress. A missing
/// or corrupt file degrades to empty defaults, never to a fatal error.
#[derive(Debug)]
pub struct PersistentState {
    store: Store,
    pub download: StateFile,
    pub import: StateFile,
}

impl PersistentState {
    pub fn load(store: Store) -> Self {
        let download = Self::load_file(&store.download_state_path());
        let import = Self::load_file(&store.import_state_path());
        Self {
            store,
            download,
            import,
        }
    }

    fn load_file(path: &camino::Utf8Path) -> StateFile {
        if !path.as_std_path().exists() {
            return StateFile::default();
        }
        match Store::read_json::<StateFile>(path) {
            Ok(state) => state,
            Err(err) => {
                warn!("unreadable state file {path}, starting from defaults: {err}");
                StateFile::default()
            }
        }
    }

    pub fn save_download(&mut self) -> Result<(), HarvestError> {
        self.download.progress.updated_at = Some(now_rfc3339());
        Store::write_json_atomic(&self.store.download_state_path(), &self.download)
    }

    pub fn save_import(&mut self) -> Result<(), HarvestError> {
        self.import.import_progress.updated_at = Some(now_rfc3339());
        Store::write_json_atomic(&self.store.import_state_path(), &self.import)
    }

    /// Recomputes aggregate download counters from the package map.
    pub fn recompute_download_progress(&mut self) {
        let progress = &mut self.download.progress;
        progress.total_packages = self.download.packages.len();
        progress.downloaded_packages = self
            .download
            .packages
            .values()
            .filter(|pkg| pkg.downloaded)
            .count();
        progress.verified_packages = self
            .download
            .packages
            .values()
            .filter(|pkg| pkg.verified)
            .count();
        progress.total_bytes = self.download.packages.values().map(|pkg| pkg.size_bytes).sum();
        progress.downloaded_bytes = self
            .download
            .packages
            .values()
            .filter(|pkg| pkg.downloaded)
            .map(|pkg| pkg.size_bytes)
            .sum();
        if progress.started_at.is_none() {
            progress.started_at = Some(now_rfc3339());
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
