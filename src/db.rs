use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};

use crate::domain::ArticleMetadata;
use crate::error::HarvestError;
use crate::state::now_rfc3339;

/// Relational document store shared with downstream consumers. Documents are
/// addressable by `(source_id, external_id)` and by DOI; sources are a
/// lookup-or-create table keyed by lowercase name.
pub struct DocumentStore {
    conn: Connection,
}

impl DocumentStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, HarvestError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, HarvestError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), HarvestError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sources (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY,
                source_id INTEGER NOT NULL REFERENCES sources(id),
                external_id TEXT NOT NULL,
                doi TEXT,
                title TEXT,
                abstract TEXT,
                authors TEXT NOT NULL DEFAULT '[]',
                publication TEXT,
                publication_date TEXT,
                year INTEGER,
                full_text TEXT,
                license_url TEXT,
                keywords TEXT NOT NULL DEFAULT '[]',
                mesh_terms TEXT NOT NULL DEFAULT '[]',
                url TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(source_id, external_id)
            );

            CREATE INDEX IF NOT EXISTS idx_documents_doi ON documents(doi);
            ",
        )?;
        Ok(())
    }

    pub fn lookup_or_create_source(&self, name: &str) -> Result<i64, HarvestError> {
        let name = name.to_lowercase();
        self.conn.execute(
            "INSERT OR IGNORE INTO sources (name) VALUES (?1)",
            params![name],
        )?;
        let id = self.conn.query_row(
            "SELECT id FROM sources WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn transaction(&mut self) -> Result<rusqlite::Transaction<'_>, HarvestError> {
        Ok(self.conn.transaction()?)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn document_count(&self) -> Result<i64, HarvestError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn full_text(
        &self,
        source_id: i64,
        external_id: &str,
    ) -> Result<Option<String>, HarvestError> {
        let text = self
            .conn
            .query_row(
                "SELECT full_text FROM documents WHERE source_id = ?1 AND external_id = ?2",
                params![source_id, external_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(text.flatten())
    }
}

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub id: i64,
    pub full_text_len: usize,
}

pub fn find_by_external_id(
    conn: &Connection,
    source_id: i64,
    external_id: &str,
) -> Result<Option<StoredDocument>, HarvestError> {
    let row = conn
        .query_row(
            "SELECT id, length(coalesce(full_text, ''))
             FROM documents WHERE source_id = ?1 AND external_id = ?2",
            params![source_id, external_id],
            |row| {
                Ok(StoredDocument {
                    id: row.get(0)?,
                    full_text_len: row.get::<_, i64>(1)? as usize,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// A document from a different source with a matching DOI. The caller
/// backfills full_text only when the stored text is empty.
pub fn find_by_doi_other_source(
    conn: &Connection,
    doi: &str,
    source_id: i64,
) -> Result<Option<StoredDocument>, HarvestError> {
    let row = conn
        .query_row(
            "SELECT id, length(coalesce(full_text, ''))
             FROM documents
             WHERE doi = ?1 AND source_id != ?2
             LIMIT 1",
            params![doi, source_id],
            |row| {
                Ok(StoredDocument {
                    id: row.get(0)?,
                    full_text_len: row.get::<_, i64>(1)? as usize,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn insert_document(
    conn: &Connection,
    source_id: i64,
    article: &ArticleMetadata,
) -> Result<(), HarvestError> {
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO documents (
            source_id, external_id, doi, title, abstract, authors,
            publication, publication_date, year, full_text, license_url,
            keywords, mesh_terms, url, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            source_id,
            article.pmcid,
            article.doi,
            article.title,
            article.abstract_text,
            to_json(&article.authors)?,
            article.journal,
            article.publication_date,
            article.year,
            article.full_text,
            article.license_url,
            to_json(&article.keywords)?,
            to_json(&article.mesh_terms)?,
            article.article_url(),
            now,
            now,
        ],
    )?;
    Ok(())
}

/// Rewrites a document with richer incoming data. Callers gate this on the
/// incoming full_text being strictly longer than the stored one.
pub fn update_document(
    conn: &Connection,
    document_id: i64,
    article: &ArticleMetadata,
) -> Result<(), HarvestError> {
    conn.execute(
        "UPDATE documents SET
            doi = ?2, title = ?3, abstract = ?4, authors = ?5,
            publication = ?6, publication_date = ?7, year = ?8,
            full_text = ?9, license_url = ?10, keywords = ?11,
            mesh_terms = ?12, updated_at = ?13
         WHERE id = ?1",
        params![
            document_id,
            article.doi,
            article.title,
            article.abstract_text,
            to_json(&article.authors)?,
            article.journal,
            article.publication_date,
            article.year,
            article.full_text,
            article.license_url,
            to_json(&article.keywords)?,
            to_json(&article.mesh_terms)?,
            now_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Cross-source dedup: only the full_text column is touched.
pub fn backfill_full_text(
    conn: &Connection,
    document_id: i64,
    full_text: &str,
) -> Result<(), HarvestError> {
    conn.execute(
        "UPDATE documents SET full_text = ?2, updated_at = ?3 WHERE id = ?1",
        params![document_id, full_text, now_rfc3339()],
    )?;
    Ok(())
}

fn to_json(values: &[String]) -> Result<String, HarvestError> {
    serde_json::to_string(values).map_err(|err| HarvestError::Database(err.to_string()))
}
