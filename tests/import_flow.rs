use std::io::Write;

use camino::Utf8PathBuf;
use flate2::Compression;
use flate2::write::GzEncoder;

use pmc_harvester::db::{DocumentStore, insert_document};
use pmc_harvester::domain::ArticleMetadata;
use pmc_harvester::importer::BatchImporter;
use pmc_harvester::output::NullSink;
use pmc_harvester::state::PersistentState;
use pmc_harvester::store::Store;

fn article_xml(pmcid: &str, doi: Option<&str>, body: &str) -> String {
    let doi_tag = doi
        .map(|doi| format!(r#"<article-id pub-id-type="doi">{doi}</article-id>"#))
        .unwrap_or_default();
    format!(
        r#"<article>
<front><article-meta>
<article-id pub-id-type="pmc">{pmcid}</article-id>
{doi_tag}
<title-group><article-title>Title {pmcid}</article-title></title-group>
</article-meta></front>
<body><sec><title>Results</title><p>{body}</p></sec></body>
</article>"#
    )
}

fn write_package(store: &Store, filename: &str, articles: &[String]) {
    store.ensure_layout().unwrap();
    let xml = format!("<articles>{}</articles>", articles.join("\n"));
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(xml.as_bytes()).unwrap();
    std::fs::write(
        store.package_path(filename).as_std_path(),
        encoder.finish().unwrap(),
    )
    .unwrap();
}

fn setup(temp: &tempfile::TempDir) -> (Store, PersistentState) {
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    let store = Store::new(root);
    let state = PersistentState::load(store.clone());
    (store, state)
}

#[test]
fn end_to_end_import_counts_and_stores_articles() {
    let temp = tempfile::tempdir().unwrap();
    let (store, mut state) = setup(&temp);
    write_package(
        &store,
        "PMC1_PMC100.xml.gz",
        &[
            article_xml("1", Some("10.1/a"), "First body."),
            // No PMCID: skipped silently, neither imported nor failed.
            "<article><front><article-meta><title-group>\
             <article-title>Anonymous</article-title></title-group>\
             </article-meta></front></article>"
                .to_string(),
        ],
    );

    let mut db = DocumentStore::in_memory().unwrap();
    let mut importer = BatchImporter::new(&mut db, store, 100, true, "pmc".to_string());
    let status = importer
        .import_all_packages(&mut state, None, &NullSink)
        .unwrap();

    assert_eq!(status.processed_articles, 1);
    assert_eq!(status.imported_articles, 1);
    assert_eq!(status.failed_articles, 0);
    assert_eq!(db.document_count().unwrap(), 1);

    let source = db.lookup_or_create_source("pmc").unwrap();
    let text = db.full_text(source, "PMC1").unwrap().unwrap();
    assert!(text.contains("# Results"));
    assert!(text.contains("First body."));
}

#[test]
fn reimport_is_idempotent() {
    let temp = tempfile::tempdir().unwrap();
    let (store, mut state) = setup(&temp);
    write_package(
        &store,
        "PMC1_PMC100.xml.gz",
        &[
            article_xml("1", None, "Body one."),
            article_xml("2", None, "Body two."),
        ],
    );

    let mut db = DocumentStore::in_memory().unwrap();
    let mut importer = BatchImporter::new(&mut db, store, 100, true, "pmc".to_string());
    let first = importer
        .import_all_packages(&mut state, None, &NullSink)
        .unwrap();
    assert_eq!(first.imported_articles, 2);

    let second = importer
        .import_all_packages(&mut state, None, &NullSink)
        .unwrap();
    assert_eq!(second.imported_articles, 0);
    assert_eq!(second.updated_articles, 0);
    assert_eq!(second.skipped_articles, 2);
    assert_eq!(db.document_count().unwrap(), 2);
}

#[test]
fn shorter_or_equal_text_never_overwrites() {
    let temp = tempfile::tempdir().unwrap();
    let (store, mut state) = setup(&temp);
    write_package(
        &store,
        "PMC1_PMC100.xml.gz",
        &[article_xml("1", None, "tiny")],
    );

    let mut db = DocumentStore::in_memory().unwrap();
    let source = db.lookup_or_create_source("pmc").unwrap();
    let stored = ArticleMetadata {
        pmcid: "PMC1".to_string(),
        title: "Existing".to_string(),
        full_text: "a much longer full text already stored".to_string(),
        ..ArticleMetadata::default()
    };
    insert_document(db.connection(), source, &stored).unwrap();

    let mut importer = BatchImporter::new(&mut db, store, 100, true, "pmc".to_string());
    let status = importer
        .import_all_packages(&mut state, None, &NullSink)
        .unwrap();
    assert_eq!(status.skipped_articles, 1);
    assert_eq!(status.updated_articles, 0);
    assert_eq!(
        db.full_text(source, "PMC1").unwrap().unwrap(),
        "a much longer full text already stored"
    );
}

#[test]
fn cross_source_doi_backfill_counts_as_updated() {
    let temp = tempfile::tempdir().unwrap();
    let (store, mut state) = setup(&temp);
    write_package(
        &store,
        "PMC1_PMC100.xml.gz",
        &[article_xml("1", Some("10.1/shared"), "Recovered text.")],
    );

    let mut db = DocumentStore::in_memory().unwrap();
    let other = db.lookup_or_create_source("crossref").unwrap();
    let stub = ArticleMetadata {
        pmcid: "EXT1".to_string(),
        doi: Some("10.1/shared".to_string()),
        title: "Stub".to_string(),
        full_text: String::new(),
        ..ArticleMetadata::default()
    };
    insert_document(db.connection(), other, &stub).unwrap();

    let mut importer = BatchImporter::new(&mut db, store, 100, true, "pmc".to_string());
    let status = importer
        .import_all_packages(&mut state, None, &NullSink)
        .unwrap();
    assert_eq!(status.updated_articles, 1);
    assert_eq!(status.imported_articles, 0);
    assert_eq!(db.document_count().unwrap(), 1);
    let text = db.full_text(other, "EXT1").unwrap().unwrap();
    assert!(text.contains("Recovered text."));
}

#[test]
fn rerun_after_interrupt_reaches_same_counters() {
    let temp = tempfile::tempdir().unwrap();
    let (store, mut state) = setup(&temp);
    write_package(
        &store,
        "PMC1_PMC100.xml.gz",
        &[article_xml("1", None, "One.")],
    );
    write_package(
        &store,
        "PMC101_PMC200.xml.gz",
        &[article_xml("101", None, "Two.")],
    );

    let mut db = DocumentStore::in_memory().unwrap();
    // Simulates a run that died after the first package.
    {
        let mut importer =
            BatchImporter::new(&mut db, store.clone(), 100, true, "pmc".to_string());
        importer
            .import_all_packages(&mut state, Some(1), &NullSink)
            .unwrap();
    }
    assert_eq!(db.document_count().unwrap(), 1);

    // A full rerun starts its counters over and ends with the same totals a
    // single uninterrupted run would have produced.
    let mut importer = BatchImporter::new(&mut db, store, 100, true, "pmc".to_string());
    let status = importer
        .import_all_packages(&mut state, None, &NullSink)
        .unwrap();
    assert_eq!(status.processed_articles, 2);
    assert_eq!(status.imported_articles, 1);
    assert_eq!(status.skipped_articles, 1);
    assert_eq!(db.document_count().unwrap(), 2);
}

#[test]
fn packages_import_in_ascending_pmcid_order() {
    let temp = tempfile::tempdir().unwrap();
    let (store, _state) = setup(&temp);
    write_package(&store, "PMC900_PMC999.xml.gz", &[]);
    write_package(&store, "PMC1_PMC100.xml.gz", &[]);

    let mut db = DocumentStore::in_memory().unwrap();
    let importer = BatchImporter::new(&mut db, store, 100, true, "pmc".to_string());
    let packages = importer.list_packages().unwrap();
    let names: Vec<_> = packages.iter().map(|pkg| pkg.filename.as_str()).collect();
    assert_eq!(names, vec!["PMC1_PMC100.xml.gz", "PMC900_PMC999.xml.gz"]);
}

#[test]
fn verify_package_reports_counts_and_samples() {
    let temp = tempfile::tempdir().unwrap();
    let (store, _state) = setup(&temp);
    let articles: Vec<String> = (1..=5)
        .map(|n| article_xml(&n.to_string(), None, "Body."))
        .collect();
    write_package(&store, "PMC1_PMC100.xml.gz", &articles);

    let mut db = DocumentStore::in_memory().unwrap();
    let importer = BatchImporter::new(&mut db, store, 100, true, "pmc".to_string());
    let report = importer.verify_package("PMC1_PMC100.xml.gz").unwrap();
    assert!(report.valid);
    assert_eq!(report.article_count, 5);
    assert_eq!(report.parse_failures, 0);
    assert_eq!(report.sample.len(), 3);
    assert_eq!(report.sample[0].pmcid, "PMC1");
    assert!(report.sample[0].has_full_text);
}

#[test]
fn import_state_checkpoint_survives_reload() {
    let temp = tempfile::tempdir().unwrap();
    let (store, mut state) = setup(&temp);
    write_package(
        &store,
        "PMC1_PMC100.xml.gz",
        &[article_xml("1", None, "One.")],
    );

    let mut db = DocumentStore::in_memory().unwrap();
    let mut importer = BatchImporter::new(&mut db, store.clone(), 100, true, "pmc".to_string());
    importer
        .import_all_packages(&mut state, None, &NullSink)
        .unwrap();

    let reloaded = PersistentState::load(store);
    assert_eq!(reloaded.import.import_progress.imported_articles, 1);
    assert!(reloaded.import.import_progress.started_at.is_some());
}
