use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::HarvestError;

/// Filesystem layout of one output directory:
/// `packages/<PMCstart>_PMC<end>.xml.gz`, `download_state.json`,
/// `import_state.json`.
#[derive(Debug, Clone)]
pub struct Store {
    output_root: Utf8PathBuf,
}

impl Store {
    pub fn new(output_root: Utf8PathBuf) -> Self {
        Self { output_root }
    }

    pub fn output_root(&self) -> &Utf8Path {
        &self.output_root
    }

    pub fn packages_dir(&self) -> Utf8PathBuf {
        self.output_root.join("packages")
    }

    pub fn package_path(&self, filename: &str) -> Utf8PathBuf {
        self.packages_dir().join(filename)
    }

    pub fn download_state_path(&self) -> Utf8PathBuf {
        self.output_root.join("download_state.json")
    }

    pub fn import_state_path(&self) -> Utf8PathBuf {
        self.output_root.join("import_state.json")
    }

    pub fn ensure_layout(&self) -> Result<(), HarvestError> {
        fs::create_dir_all(self.packages_dir().as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))
    }

    pub fn package_exists(&self, filename: &str) -> bool {
        self.package_path(filename).as_std_path().exists()
    }

    pub fn package_size(&self, filename: &str) -> Option<u64> {
        fs::metadata(self.package_path(filename).as_std_path())
            .ok()
            .map(|meta| meta.len())
    }

    pub fn remove_package(&self, filename: &str) -> Result<(), HarvestError> {
        let path = self.package_path(filename);
        if path.as_std_path().exists() {
            fs::remove_file(path.as_std_path())
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }

    /// Lists downloaded package files sorted by ascending pmcid_start.
    pub fn list_package_files(&self) -> Result<Vec<String>, HarvestError> {
        let dir = self.packages_dir();
        if !dir.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Ok((start, _)) = crate::domain::parse_package_range(&name) {
                names.push((start, name));
            }
        }
        names.sort();
        Ok(names.into_iter().map(|(_, name)| name).collect())
    }

    pub fn write_json_atomic<T: Serialize>(
        path: &Utf8Path,
        value: &T,
    ) -> Result<(), HarvestError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| HarvestError::StateIo(err.to_string()))?;
        }
        let tmp_path = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| HarvestError::StateIo(err.to_string()))?;
        fs::write(tmp_path.as_std_path(), &content)
            .map_err(|err| HarvestError::StateIo(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| HarvestError::StateIo(err.to_string()))?;
        Ok(())
    }

    pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<T, HarvestError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| HarvestError::StateIo(err.to_string()))?;
        serde_json::from_str(&content).map_err(|err| HarvestError::StateIo(err.to_string()))
    }
}
