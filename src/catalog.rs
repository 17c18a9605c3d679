use std::time::Duration;

use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::info;

use crate::error::HarvestError;
use crate::state::{PackageInfo, PersistentState};

pub trait ListingClient: Send + Sync {
    fn fetch_listing(&self, url: &str) -> Result<String, HarvestError>;
}

#[derive(Clone)]
pub struct HttpListingClient {
    client: Client,
}

impl HttpListingClient {
    pub fn new() -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("pmc-harvester/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::CatalogHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| HarvestError::CatalogHttp(err.to_string()))?;
        Ok(Self { client })
    }
}

impl ListingClient for HttpListingClient {
    fn fetch_listing(&self, url: &str) -> Result<String, HarvestError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| HarvestError::CatalogHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "listing request failed".to_string());
            return Err(HarvestError::CatalogStatus { status, message });
        }
        response
            .text()
            .map_err(|err| HarvestError::CatalogHttp(err.to_string()))
    }
}

/// Discovers remote package files and merges them with prior local knowledge.
/// A refresh never regresses downloaded/verified flags already recorded.
pub struct PackageCatalog<'a, L: ListingClient> {
    listing: &'a L,
    base_url: String,
    pmcid_min: Option<u64>,
    pmcid_max: Option<u64>,
}

impl<'a, L: ListingClient> PackageCatalog<'a, L> {
    pub fn new(
        listing: &'a L,
        base_url: String,
        pmcid_min: Option<u64>,
        pmcid_max: Option<u64>,
    ) -> Self {
        Self {
            listing,
            base_url,
            pmcid_min,
            pmcid_max,
        }
    }

    /// Returns the known packages sorted by pmcid_start. With `refresh`,
    /// fetches the remote listing first; a fetch or parse failure propagates
    /// and leaves the prior catalog authoritative.
    pub fn list_available_packages(
        &self,
        refresh: bool,
        state: &mut PersistentState,
    ) -> Result<Vec<PackageInfo>, HarvestError> {
        if refresh {
            let html = self.listing.fetch_listing(&self.base_url)?;
            let discovered = self.parse_listing(&html)?;
            info!("catalog refresh found {} packages", discovered.len());
            for pkg in discovered {
                state
                    .download
                    .packages
                    .entry(pkg.filename.clone())
                    .and_modify(|known| {
                        known.url = pkg.url.clone();
                        if pkg.size_bytes > 0 {
                            known.size_bytes = pkg.size_bytes;
                        }
                    })
                    .or_insert(pkg);
            }
            state.recompute_download_progress();
            state.save_download()?;
        }

        let mut packages: Vec<PackageInfo> =
            state.download.packages.values().cloned().collect();
        packages.sort_by_key(|pkg| pkg.pmcid_start);
        Ok(packages)
    }

    fn parse_listing(&self, html: &str) -> Result<Vec<PackageInfo>, HarvestError> {
        // Anchor filenames in the HTML index, e.g. PMC1000000_PMC1099999.xml.gz.
        let pattern = Regex::new(r"PMC(\d+)_PMC(\d+)\.xml\.gz")
            .map_err(|err| HarvestError::CatalogHttp(err.to_string()))?;
        let mut packages = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        for caps in pattern.captures_iter(html) {
            let filename = caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default();
            if !seen.insert(filename.clone()) {
                continue;
            }
            let start: u64 = caps[1].parse().unwrap_or(0);
            let end: u64 = caps[2].parse().unwrap_or(0);
            if start > end {
                continue;
            }
            if !self.range_selected(start, end) {
                continue;
            }
            packages.push(PackageInfo {
                url: format!("{}{}", self.base_url, filename),
                filename,
                pmcid_start: start,
                pmcid_end: end,
                size_bytes: 0,
                downloaded: false,
                verified: false,
                download_date: None,
            });
        }
        if packages.is_empty() {
            return Err(HarvestError::CatalogEmpty(self.base_url.clone()));
        }
        packages.sort_by_key(|pkg| pkg.pmcid_start);
        Ok(packages)
    }

    /// Half-open overlap: keep a package when [start, end] intersects
    /// [pmcid_min, pmcid_max).
    fn range_selected(&self, start: u64, end: u64) -> bool {
        if let Some(min) = self.pmcid_min {
            if end < min {
                return false;
            }
        }
        if let Some(max) = self.pmcid_max {
            if start >= max {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::store::Store;

    struct FixedListing(String);

    impl ListingClient for FixedListing {
        fn fetch_listing(&self, _url: &str) -> Result<String, HarvestError> {
            Ok(self.0.clone())
        }
    }

    struct FailingListing;

    impl ListingClient for FailingListing {
        fn fetch_listing(&self, _url: &str) -> Result<String, HarvestError> {
            Err(HarvestError::CatalogHttp("connection refused".to_string()))
        }
    }

    fn temp_state(temp: &tempfile::TempDir) -> PersistentState {
        let store =
            Store::new(Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap());
        PersistentState::load(store)
    }

    const LISTING: &str = r#"
        <html><body>
        <a href="PMC1000000_PMC1099999.xml.gz">PMC1000000_PMC1099999.xml.gz</a>
        <a href="PMC1100000_PMC1199999.xml.gz">PMC1100000_PMC1199999.xml.gz</a>
        <a href="PMC1000000_PMC1099999.xml.gz">dup</a>
        <a href="readme.txt">readme</a>
        </body></html>"#;

    #[test]
    fn refresh_extracts_and_sorts_packages() {
        let temp = tempfile::tempdir().unwrap();
        let mut state = temp_state(&temp);
        let listing = FixedListing(LISTING.to_string());
        let catalog = PackageCatalog::new(&listing, "https://x/".to_string(), None, None);
        let packages = catalog.list_available_packages(true, &mut state).unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].pmcid_start, 1_000_000);
        assert_eq!(packages[0].url, "https://x/PMC1000000_PMC1099999.xml.gz");
        assert_eq!(state.download.progress.total_packages, 2);
    }

    #[test]
    fn refresh_preserves_local_flags() {
        let temp = tempfile::tempdir().unwrap();
        let mut state = temp_state(&temp);
        let listing = FixedListing(LISTING.to_string());
        let catalog = PackageCatalog::new(&listing, "https://x/".to_string(), None, None);
        catalog.list_available_packages(true, &mut state).unwrap();

        let pkg = state
            .download
            .packages
            .get_mut("PMC1000000_PMC1099999.xml.gz")
            .unwrap();
        pkg.downloaded = true;
        pkg.verified = true;
        pkg.size_bytes = 77;

        let packages = catalog.list_available_packages(true, &mut state).unwrap();
        let refreshed = packages
            .iter()
            .find(|p| p.filename == "PMC1000000_PMC1099999.xml.gz")
            .unwrap();
        assert!(refreshed.downloaded);
        assert!(refreshed.verified);
        assert_eq!(refreshed.size_bytes, 77);
    }

    #[test]
    fn refresh_failure_keeps_prior_catalog() {
        let temp = tempfile::tempdir().unwrap();
        let mut state = temp_state(&temp);
        {
            let listing = FixedListing(LISTING.to_string());
            let catalog = PackageCatalog::new(&listing, "https://x/".to_string(), None, None);
            catalog.list_available_packages(true, &mut state).unwrap();
        }
        let catalog = PackageCatalog::new(&FailingListing, "https://x/".to_string(), None, None);
        let err = catalog
            .list_available_packages(true, &mut state)
            .unwrap_err();
        assert_matches!(err, HarvestError::CatalogHttp(_));
        assert_eq!(state.download.packages.len(), 2);
    }

    #[test]
    fn range_filter_half_open_overlap() {
        let temp = tempfile::tempdir().unwrap();
        let mut state = temp_state(&temp);
        let listing = FixedListing(LISTING.to_string());
        let catalog = PackageCatalog::new(
            &listing,
            "https://x/".to_string(),
            Some(1_100_000),
            Some(1_200_000),
        );
        let packages = catalog.list_available_packages(true, &mut state).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].pmcid_start, 1_100_000);
    }

    #[test]
    fn empty_listing_is_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let mut state = temp_state(&temp);
        let listing = FixedListing("<html>no packages here</html>".to_string());
        let catalog = PackageCatalog::new(&listing, "https://x/".to_string(), None, None);
        let err = catalog
            .list_available_packages(true, &mut state)
            .unwrap_err();
        assert_matches!(err, HarvestError::CatalogEmpty(_));
    }
}
