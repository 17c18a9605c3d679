use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::thread;
use std::time::Duration;

use flate2::read::MultiGzDecoder;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::HarvestError;
use crate::output::{ProgressEvent, ProgressSink};
use crate::state::{PersistentState, now_rfc3339};
use crate::store::Store;

const FALLBACK_BYTES_PER_SEC: u64 = 2 * 1024 * 1024;

/// Bounded retry with linear backoff (`base_delay * attempt`). The sleep
/// function is injectable so tests can observe the schedule without waiting.
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
    sleep: Box<dyn Fn(Duration) + Send + Sync>,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self::with_sleep(max_attempts, base_delay, Box::new(thread::sleep))
    }

    pub fn with_sleep(
        max_attempts: usize,
        base_delay: Duration,
        sleep: Box<dyn Fn(Duration) + Send + Sync>,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            sleep,
        }
    }

    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        self.base_delay * attempt as u32
    }

    pub fn run<T>(
        &self,
        mut op: impl FnMut(usize) -> Result<T, HarvestError>,
    ) -> Result<T, HarvestError> {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts => {
                    warn!("attempt {attempt} failed, retrying: {err}");
                    (self.sleep)(self.backoff_delay(attempt));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

pub trait PackageFetcher: Send + Sync {
    /// Streams one remote file to `destination`, returning the byte count.
    fn fetch_to_file(&self, url: &str, destination: &Path) -> Result<u64, HarvestError>;
}

#[derive(Clone)]
pub struct HttpPackageFetcher {
    client: Client,
}

impl HttpPackageFetcher {
    pub fn new() -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("pmc-harvester/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::CatalogHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            // Packages run to multiple gigabytes; the timeout covers the
            // whole streamed body, not only the handshake.
            .timeout(Duration::from_secs(3600))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| HarvestError::CatalogHttp(err.to_string()))?;
        Ok(Self { client })
    }
}

impl PackageFetcher for HttpPackageFetcher {
    fn fetch_to_file(&self, url: &str, destination: &Path) -> Result<u64, HarvestError> {
        let filename = destination
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut response = self.client.get(url).send().map_err(|err| {
            HarvestError::Download {
                filename: filename.clone(),
                message: err.to_string(),
            }
        })?;
        if !response.status().is_success() {
            return Err(HarvestError::DownloadStatus {
                filename,
                status: response.status().as_u16(),
            });
        }
        let mut file = File::create(destination)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        // io::copy streams the body in fixed-size chunks.
        io::copy(&mut response, &mut file).map_err(|err| HarvestError::Download {
            filename,
            message: err.to_string(),
        })
    }
}

/// Decompresses the whole file to a sink without materializing the content.
pub fn verify_gzip(path: &Path) -> Result<(), HarvestError> {
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let file = File::open(path).map_err(|err| HarvestError::Verification {
        filename: filename.clone(),
        message: err.to_string(),
    })?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(file));
    io::copy(&mut decoder, &mut io::sink()).map_err(|err| HarvestError::Verification {
        filename,
        message: err.to_string(),
    })?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadStatus {
    pub total_packages: usize,
    pub downloaded_packages: usize,
    pub verified_packages: usize,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub percent_complete: f64,
    pub recent_errors: Vec<String>,
    pub started_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadEstimate {
    pub pending_packages: usize,
    pub pending_bytes: u64,
    pub bytes_per_sec: u64,
    pub estimated_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub verified: usize,
    pub failed: usize,
}

pub struct PackageDownloader<'a, F: PackageFetcher> {
    fetcher: &'a F,
    store: Store,
    retry: RetryPolicy,
    download_delay: Duration,
    delay_sleep: Box<dyn Fn(Duration) + Send + Sync>,
}

impl<'a, F: PackageFetcher> PackageDownloader<'a, F> {
    pub fn new(fetcher: &'a F, store: Store, retry: RetryPolicy, download_delay: Duration) -> Self {
        Self {
            fetcher,
            store,
            retry,
            download_delay,
            delay_sleep: Box::new(thread::sleep),
        }
    }

    pub fn with_delay_sleep(mut self, sleep: Box<dyn Fn(Duration) + Send + Sync>) -> Self {
        self.delay_sleep = sleep;
        self
    }

    /// Downloads and verifies pending packages in catalog order. Returns the
    /// number of packages verified this run. Per-package failures are logged
    /// and leave the package pending; they never abort the run.
    pub fn download_packages(
        &self,
        state: &mut PersistentState,
        limit: Option<usize>,
        sink: &dyn ProgressSink,
    ) -> Result<usize, HarvestError> {
        self.store.ensure_layout()?;

        let mut pending: Vec<String> = state
            .download
            .packages
            .values()
            .filter(|pkg| !(pkg.downloaded && pkg.verified))
            .map(|pkg| (pkg.pmcid_start, pkg.filename.clone()))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .map(|(_, name)| name)
            .collect();
        if let Some(limit) = limit {
            pending.truncate(limit);
        }

        let total = pending.len();
        let mut verified_this_run = 0;
        let mut downloaded_previous = false;
        for (index, filename) in pending.iter().enumerate() {
            // Courtesy interval between successive network downloads only;
            // never after the last package or a disk-only short circuit.
            if downloaded_previous {
                (self.delay_sleep)(self.download_delay);
            }
            sink.event(ProgressEvent {
                message: format!("package {}/{}: {filename}", index + 1, total),
            });
            let outcome = self.process_package(state, filename, sink);
            state.recompute_download_progress();
            state.save_download()?;
            match outcome {
                PackageOutcome::Verified { used_network } => {
                    verified_this_run += 1;
                    downloaded_previous = used_network;
                }
                PackageOutcome::Failed { used_network } => {
                    downloaded_previous = used_network;
                }
                PackageOutcome::AlreadyDone => {
                    downloaded_previous = false;
                }
            }
        }
        Ok(verified_this_run)
    }

    fn process_package(
        &self,
        state: &mut PersistentState,
        filename: &str,
        sink: &dyn ProgressSink,
    ) -> PackageOutcome {
        let Some(pkg) = state.download.packages.get(filename).cloned() else {
            return PackageOutcome::AlreadyDone;
        };
        let path = self.store.package_path(filename);

        // A verified file already on disk short-circuits all network I/O.
        if pkg.verified && path.as_std_path().exists() {
            return PackageOutcome::AlreadyDone;
        }

        // A leftover file from an earlier run may already be complete.
        if path.as_std_path().exists() {
            if verify_gzip(path.as_std_path()).is_ok() {
                let size = self.store.package_size(filename).unwrap_or(0);
                if let Some(entry) = state.download.packages.get_mut(filename) {
                    entry.downloaded = true;
                    entry.verified = true;
                    entry.size_bytes = size;
                    if entry.download_date.is_none() {
                        entry.download_date = Some(now_rfc3339());
                    }
                }
                info!("{filename} already on disk, verified without download");
                return PackageOutcome::Verified { used_network: false };
            }
            // Partial or corrupt leftover; redownload from scratch.
            let _ = self.store.remove_package(filename);
        }

        let fetched = self
            .retry
            .run(|_attempt| self.fetcher.fetch_to_file(&pkg.url, path.as_std_path()));
        let size = match fetched {
            Ok(size) => size,
            Err(err) => {
                warn!("download failed for {filename}: {err}");
                state
                    .download
                    .progress
                    .push_error(format!("{filename}: {err}"));
                return PackageOutcome::Failed { used_network: true };
            }
        };

        if let Some(entry) = state.download.packages.get_mut(filename) {
            entry.downloaded = true;
            entry.size_bytes = size;
            entry.download_date = Some(now_rfc3339());
        }

        sink.event(ProgressEvent {
            message: format!("verifying {filename}"),
        });
        match verify_gzip(path.as_std_path()) {
            Ok(()) => {
                if let Some(entry) = state.download.packages.get_mut(filename) {
                    entry.verified = true;
                }
                info!("downloaded and verified {filename} ({size} bytes)");
                PackageOutcome::Verified { used_network: true }
            }
            Err(err) => {
                warn!("verification failed for {filename}, deleting: {err}");
                if let Err(remove_err) = self.store.remove_package(filename) {
                    warn!("could not delete corrupt {filename}: {remove_err}");
                }
                if let Some(entry) = state.download.packages.get_mut(filename) {
                    entry.downloaded = false;
                    entry.verified = false;
                    entry.download_date = None;
                }
                state
                    .download
                    .progress
                    .push_error(format!("{filename}: {err}"));
                PackageOutcome::Failed { used_network: true }
            }
        }
    }

    /// Re-verifies every package marked downloaded. Bad files are deleted and
    /// flipped back to pending.
    pub fn verify_all_downloads(
        &self,
        state: &mut PersistentState,
    ) -> Result<VerifyResult, HarvestError> {
        let filenames: Vec<String> = state
            .download
            .packages
            .values()
            .filter(|pkg| pkg.downloaded)
            .map(|pkg| pkg.filename.clone())
            .collect();

        let mut result = VerifyResult {
            verified: 0,
            failed: 0,
        };
        for filename in filenames {
            let path = self.store.package_path(&filename);
            let ok = path.as_std_path().exists() && verify_gzip(path.as_std_path()).is_ok();
            let Some(entry) = state.download.packages.get_mut(&filename) else {
                continue;
            };
            if ok {
                entry.verified = true;
                result.verified += 1;
            } else {
                warn!("verification failed for {filename}, deleting");
                entry.downloaded = false;
                entry.verified = false;
                entry.download_date = None;
                if let Err(remove_err) = self.store.remove_package(&filename) {
                    warn!("could not delete corrupt {filename}: {remove_err}");
                }
                result.failed += 1;
            }
            state.recompute_download_progress();
            state.save_download()?;
        }
        Ok(result)
    }
}

enum PackageOutcome {
    Verified { used_network: bool },
    Failed { used_network: bool },
    AlreadyDone,
}

pub fn download_status(state: &PersistentState) -> DownloadStatus {
    let progress = &state.download.progress;
    let percent = if progress.total_packages == 0 {
        0.0
    } else {
        progress.verified_packages as f64 * 100.0 / progress.total_packages as f64
    };
    DownloadStatus {
        total_packages: progress.total_packages,
        downloaded_packages: progress.downloaded_packages,
        verified_packages: progress.verified_packages,
        total_bytes: progress.total_bytes,
        downloaded_bytes: progress.downloaded_bytes,
        percent_complete: percent,
        recent_errors: progress.errors.clone(),
        started_at: progress.started_at.clone(),
        updated_at: progress.updated_at.clone(),
    }
}

/// Rough remaining-time estimate from observed throughput, falling back to a
/// nominal rate when no transfer has been timed yet.
pub fn estimate_download_time(
    state: &PersistentState,
    download_delay: Duration,
) -> DownloadEstimate {
    let progress = &state.download.progress;
    let pending: Vec<_> = state
        .download
        .packages
        .values()
        .filter(|pkg| !(pkg.downloaded && pkg.verified))
        .collect();
    let pending_packages = pending.len();
    let known_sizes: Vec<u64> = pending
        .iter()
        .map(|pkg| pkg.size_bytes)
        .filter(|size| *size > 0)
        .collect();
    let average = if known_sizes.is_empty() {
        // Bulk OA packages average a few hundred megabytes.
        256 * 1024 * 1024
    } else {
        known_sizes.iter().sum::<u64>() / known_sizes.len() as u64
    };
    let pending_bytes: u64 = pending
        .iter()
        .map(|pkg| if pkg.size_bytes > 0 { pkg.size_bytes } else { average })
        .sum();

    let bytes_per_sec = observed_rate(progress).unwrap_or(FALLBACK_BYTES_PER_SEC);
    let transfer_secs = pending_bytes / bytes_per_sec.max(1);
    let delay_secs = download_delay.as_secs() * pending_packages.saturating_sub(1) as u64;
    DownloadEstimate {
        pending_packages,
        pending_bytes,
        bytes_per_sec,
        estimated_secs: transfer_secs + delay_secs,
    }
}

fn observed_rate(progress: &crate::state::DownloadProgress) -> Option<u64> {
    let started = chrono::DateTime::parse_from_rfc3339(progress.started_at.as_deref()?).ok()?;
    let updated = chrono::DateTime::parse_from_rfc3339(progress.updated_at.as_deref()?).ok()?;
    let elapsed = (updated - started).num_seconds();
    if elapsed <= 0 || progress.downloaded_bytes == 0 {
        return None;
    }
    Some(progress.downloaded_bytes / elapsed as u64)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn retry_policy_linear_backoff_schedule() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(300));
    }

    #[test]
    fn retry_policy_stops_after_max_attempts() {
        let attempts = Mutex::new(0usize);
        let policy = RetryPolicy::with_sleep(3, Duration::from_millis(1), Box::new(|_| {}));
        let result: Result<(), _> = policy.run(|_| {
            *attempts.lock().unwrap() += 1;
            Err(HarvestError::Download {
                filename: "x".to_string(),
                message: "refused".to_string(),
            })
        });
        assert!(result.is_err());
        assert_eq!(*attempts.lock().unwrap(), 3);
    }

    #[test]
    fn retry_policy_returns_first_success() {
        let attempts = Mutex::new(0usize);
        let policy = RetryPolicy::with_sleep(5, Duration::from_millis(1), Box::new(|_| {}));
        let result = policy.run(|attempt| {
            *attempts.lock().unwrap() += 1;
            if attempt < 3 {
                Err(HarvestError::Download {
                    filename: "x".to_string(),
                    message: "refused".to_string(),
                })
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(*attempts.lock().unwrap(), 3);
    }
}
