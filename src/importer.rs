use std::fs::File;
use std::io::BufReader;

use flate2::read::MultiGzDecoder;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::db::{
    DocumentStore, backfill_full_text, find_by_doi_other_source, find_by_external_id,
    insert_document, update_document,
};
use crate::domain::{ArticleMetadata, parse_package_range};
use crate::error::HarvestError;
use crate::jats::ArticleStream;
use crate::output::{ProgressEvent, ProgressSink};
use crate::state::{PersistentState, now_rfc3339};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportStatus {
    pub processed_articles: usize,
    pub imported_articles: usize,
    pub updated_articles: usize,
    pub skipped_articles: usize,
    pub failed_articles: usize,
    pub recent_errors: Vec<String>,
    pub started_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageFileInfo {
    pub filename: String,
    pub pmcid_start: u64,
    pub pmcid_end: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArticleSample {
    pub pmcid: String,
    pub title: String,
    pub has_full_text: bool,
}

/// Parse-only diagnostic for one downloaded package.
#[derive(Debug, Clone, Serialize)]
pub struct PackageReport {
    pub filename: String,
    pub valid: bool,
    pub article_count: usize,
    pub parse_failures: usize,
    pub sample: Vec<ArticleSample>,
}

/// Consumes parsed articles in bounded batches and performs idempotent
/// upserts into the document store.
pub struct BatchImporter<'a> {
    db: &'a mut DocumentStore,
    store: Store,
    batch_size: usize,
    allow_updates: bool,
    source_name: String,
}

impl<'a> BatchImporter<'a> {
    pub fn new(
        db: &'a mut DocumentStore,
        store: Store,
        batch_size: usize,
        allow_updates: bool,
        source_name: String,
    ) -> Self {
        Self {
            db,
            store,
            batch_size: batch_size.max(1),
            allow_updates,
            source_name,
        }
    }

    /// Downloaded package files on disk, ascending by PMCID range.
    pub fn list_packages(&self) -> Result<Vec<PackageFileInfo>, HarvestError> {
        let mut infos = Vec::new();
        for filename in self.store.list_package_files()? {
            let (start, end) = parse_package_range(&filename)?;
            infos.push(PackageFileInfo {
                size_bytes: self.store.package_size(&filename).unwrap_or(0),
                filename,
                pmcid_start: start,
                pmcid_end: end,
            });
        }
        Ok(infos)
    }

    /// Imports every downloaded package in ascending-PMCID order. Counters
    /// are reset at the start of the run and checkpointed after every batch
    /// and package, so a crash loses at most the in-flight batch and a rerun
    /// reaches the same final counters.
    pub fn import_all_packages(
        &mut self,
        state: &mut PersistentState,
        limit: Option<usize>,
        sink: &dyn ProgressSink,
    ) -> Result<ImportStatus, HarvestError> {
        let source_id = self.db.lookup_or_create_source(&self.source_name)?;
        let mut files = self.store.list_package_files()?;
        if let Some(limit) = limit {
            files.truncate(limit);
        }

        state.import.import_progress = Default::default();
        state.import.import_progress.started_at = Some(now_rfc3339());
        state.save_import()?;

        let total = files.len();
        for (index, filename) in files.iter().enumerate() {
            sink.event(ProgressEvent {
                message: format!("importing package {}/{}: {filename}", index + 1, total),
            });
            if let Err(err) = self.import_one_package(state, source_id, filename) {
                // A package that cannot be opened at all is recorded and the
                // run moves on to the next one.
                warn!("package {filename} failed: {err}");
                state
                    .import
                    .import_progress
                    .push_error(format!("{filename}: {err}"));
            }
            state.save_import()?;
        }
        Ok(import_status(state))
    }

    fn import_one_package(
        &mut self,
        state: &mut PersistentState,
        source_id: i64,
        filename: &str,
    ) -> Result<(), HarvestError> {
        let path = self.store.package_path(filename);
        let file = File::open(path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        let stream = ArticleStream::new(BufReader::new(MultiGzDecoder::new(BufReader::new(file))));

        let mut batch: Vec<ArticleMetadata> = Vec::with_capacity(self.batch_size);
        for item in stream {
            match item {
                Ok(article) => {
                    state.import.import_progress.processed_articles += 1;
                    batch.push(article);
                    if batch.len() >= self.batch_size {
                        self.flush_batch(state, source_id, &mut batch)?;
                        state.save_import()?;
                    }
                }
                Err(err) => {
                    state.import.import_progress.failed_articles += 1;
                    state
                        .import
                        .import_progress
                        .push_error(format!("{filename}: {err}"));
                }
            }
        }
        if !batch.is_empty() {
            self.flush_batch(state, source_id, &mut batch)?;
        }
        info!(
            "finished {filename}: {} processed so far",
            state.import.import_progress.processed_articles
        );
        Ok(())
    }

    /// One transactional pass over the buffered batch. Each article's upsert
    /// is isolated: a failing row is counted and the rest of the batch still
    /// commits.
    fn flush_batch(
        &mut self,
        state: &mut PersistentState,
        source_id: i64,
        batch: &mut Vec<ArticleMetadata>,
    ) -> Result<(), HarvestError> {
        let allow_updates = self.allow_updates;
        let tx = self.db.transaction()?;
        for article in batch.drain(..) {
            match upsert_article(&tx, source_id, &article, allow_updates) {
                Ok(UpsertOutcome::Inserted) => {
                    state.import.import_progress.imported_articles += 1;
                }
                Ok(UpsertOutcome::Updated) => {
                    state.import.import_progress.updated_articles += 1;
                }
                Ok(UpsertOutcome::Skipped) => {
                    state.import.import_progress.skipped_articles += 1;
                }
                Err(err) => {
                    warn!("upsert failed for {}: {err}", article.pmcid);
                    state.import.import_progress.failed_articles += 1;
                    state
                        .import
                        .import_progress
                        .push_error(format!("{}: {err}", article.pmcid));
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Parse-only diagnostic: decodes and parses the package without
    /// touching the database.
    pub fn verify_package(&self, filename: &str) -> Result<PackageReport, HarvestError> {
        let path = self.store.package_path(filename);
        let file = File::open(path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        let stream = ArticleStream::new(BufReader::new(MultiGzDecoder::new(BufReader::new(file))));

        let mut report = PackageReport {
            filename: filename.to_string(),
            valid: true,
            article_count: 0,
            parse_failures: 0,
            sample: Vec::new(),
        };
        for item in stream {
            match item {
                Ok(article) => {
                    report.article_count += 1;
                    if report.sample.len() < 3 {
                        report.sample.push(ArticleSample {
                            pmcid: article.pmcid.clone(),
                            title: article.title.clone(),
                            has_full_text: !article.full_text.is_empty(),
                        });
                    }
                }
                Err(_) => report.parse_failures += 1,
            }
        }
        report.valid = report.article_count > 0 && report.parse_failures == 0;
        Ok(report)
    }
}

/// Upsert policy, first matching rule wins:
/// 1. existing (source, pmcid) document — update only when updates are
///    enabled and the incoming full_text is strictly longer;
/// 2. DOI held by a different source — backfill full_text when the stored
///    text is empty, otherwise skip;
/// 3. insert a new document under this source.
pub fn upsert_article(
    conn: &Connection,
    source_id: i64,
    article: &ArticleMetadata,
    allow_updates: bool,
) -> Result<UpsertOutcome, HarvestError> {
    if let Some(existing) = find_by_external_id(conn, source_id, &article.pmcid)? {
        if allow_updates && article.full_text.len() > existing.full_text_len {
            update_document(conn, existing.id, article)?;
            return Ok(UpsertOutcome::Updated);
        }
        return Ok(UpsertOutcome::Skipped);
    }

    if let Some(doi) = article.doi.as_deref().filter(|doi| !doi.is_empty()) {
        if let Some(other) = find_by_doi_other_source(conn, doi, source_id)? {
            if other.full_text_len == 0 && !article.full_text.is_empty() {
                backfill_full_text(conn, other.id, &article.full_text)?;
                return Ok(UpsertOutcome::Updated);
            }
            return Ok(UpsertOutcome::Skipped);
        }
    }

    insert_document(conn, source_id, article)?;
    Ok(UpsertOutcome::Inserted)
}

pub fn import_status(state: &PersistentState) -> ImportStatus {
    let progress = &state.import.import_progress;
    ImportStatus {
        processed_articles: progress.processed_articles,
        imported_articles: progress.imported_articles,
        updated_articles: progress.updated_articles,
        skipped_articles: progress.skipped_articles,
        failed_articles: progress.failed_articles,
        recent_errors: progress.errors.clone(),
        started_at: progress.started_at.clone(),
        updated_at: progress.updated_at.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article(pmcid: &str, doi: Option<&str>, full_text: &str) -> ArticleMetadata {
        ArticleMetadata {
            pmcid: pmcid.to_string(),
            doi: doi.map(str::to_string),
            title: format!("Article {pmcid}"),
            full_text: full_text.to_string(),
            ..ArticleMetadata::default()
        }
    }

    #[test]
    fn upsert_inserts_then_skips_same_content() {
        let store = DocumentStore::in_memory().unwrap();
        let source = store.lookup_or_create_source("pmc").unwrap();
        let a = article("PMC1", None, "text");

        let outcome = upsert_article(store.connection(), source, &a, true).unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let outcome = upsert_article(store.connection(), source, &a, true).unwrap();
        assert_eq!(outcome, UpsertOutcome::Skipped);
    }

    #[test]
    fn upsert_updates_only_on_strictly_longer_text() {
        let store = DocumentStore::in_memory().unwrap();
        let source = store.lookup_or_create_source("pmc").unwrap();
        upsert_article(store.connection(), source, &article("PMC1", None, "12345"), true)
            .unwrap();

        // Equal length never mutates.
        let outcome =
            upsert_article(store.connection(), source, &article("PMC1", None, "abcde"), true)
                .unwrap();
        assert_eq!(outcome, UpsertOutcome::Skipped);
        assert_eq!(
            store.full_text(source, "PMC1").unwrap().as_deref(),
            Some("12345")
        );

        let outcome =
            upsert_article(store.connection(), source, &article("PMC1", None, "123456"), true)
                .unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(
            store.full_text(source, "PMC1").unwrap().as_deref(),
            Some("123456")
        );
    }

    #[test]
    fn upsert_respects_updates_disabled() {
        let store = DocumentStore::in_memory().unwrap();
        let source = store.lookup_or_create_source("pmc").unwrap();
        upsert_article(store.connection(), source, &article("PMC1", None, "short"), false)
            .unwrap();
        let outcome = upsert_article(
            store.connection(),
            source,
            &article("PMC1", None, "much longer text"),
            false,
        )
        .unwrap();
        assert_eq!(outcome, UpsertOutcome::Skipped);
    }

    #[test]
    fn upsert_backfills_cross_source_doi() {
        let store = DocumentStore::in_memory().unwrap();
        let pmc = store.lookup_or_create_source("pmc").unwrap();
        let other = store.lookup_or_create_source("crossref").unwrap();

        let stub = article("EXT9", Some("10.1/shared"), "");
        crate::db::insert_document(store.connection(), other, &stub).unwrap();

        let incoming = article("PMC9", Some("10.1/shared"), "full body");
        let outcome = upsert_article(store.connection(), pmc, &incoming, true).unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(
            store.full_text(other, "EXT9").unwrap().as_deref(),
            Some("full body")
        );
        // No new row was created for the pmc source.
        assert_eq!(store.document_count().unwrap(), 1);
    }

    #[test]
    fn upsert_skips_when_doi_holder_already_has_text() {
        let store = DocumentStore::in_memory().unwrap();
        let pmc = store.lookup_or_create_source("pmc").unwrap();
        let other = store.lookup_or_create_source("crossref").unwrap();

        let stub = article("EXT9", Some("10.1/shared"), "existing text");
        crate::db::insert_document(store.connection(), other, &stub).unwrap();

        let incoming = article("PMC9", Some("10.1/shared"), "new");
        let outcome = upsert_article(store.connection(), pmc, &incoming, true).unwrap();
        assert_eq!(outcome, UpsertOutcome::Skipped);
        assert_eq!(store.document_count().unwrap(), 1);
    }
}
