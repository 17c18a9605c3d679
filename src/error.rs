use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("invalid package filename: {0}")]
    InvalidPackageName(String),

    #[error("invalid PMCID: {0}")]
    InvalidPmcid(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("package listing request failed: {0}")]
    CatalogHttp(String),

    #[error("package listing returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("no package entries found in listing at {0}")]
    CatalogEmpty(String),

    #[error("download of {filename} failed: {message}")]
    Download { filename: String, message: String },

    #[error("download of {filename} returned status {status}")]
    DownloadStatus { filename: String, status: u16 },

    #[error("gzip verification failed for {filename}: {message}")]
    Verification { filename: String, message: String },

    #[error("article parse error: {0}")]
    Parse(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("state file error: {0}")]
    StateIo(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl From<rusqlite::Error> for HarvestError {
    fn from(err: rusqlite::Error) -> Self {
        HarvestError::Database(err.to_string())
    }
}
