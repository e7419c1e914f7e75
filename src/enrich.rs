//! Catalog enrichment.
//!
//! Looks each imported book up in an external bibliographic catalog and
//! stores a cleaned description, subject list, genre list, and language.
//! The lookup sits behind the [`Catalog`] trait; [`OpenLibraryCatalog`] is
//! the production implementation.
//!
//! # Retry Strategy
//!
//! Same policy as the embedding and LLM clients:
//! - HTTP 429 and 5xx → retry with exponential backoff (1s, 2s, 4s, ...)
//! - other 4xx → fail immediately
//! - network errors → retry
//!
//! A book whose lookup ultimately fails is counted in `errors` and left
//! pending so the next run picks it up again.

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::books::{row_to_book, BOOK_COLUMNS, BOOK_ORDER};
use crate::config::{Config, EnrichmentConfig};
use crate::db;
use crate::http;
use crate::models::Book;

const MAX_DESCRIPTION_CHARS: usize = 1000;
const MAX_SUBJECTS: usize = 10;
const MAX_GENRES: usize = 5;

/// Subjects containing any of these are too generic or administrative to keep.
const SUBJECT_SKIP: &[&str] = &["fiction", "juvenile", "access", "protected"];

const GENRE_KEYWORDS: &[&str] = &[
    "fiction",
    "romance",
    "mystery",
    "thriller",
    "fantasy",
    "science fiction",
    "horror",
    "historical",
    "biography",
    "autobiography",
    "memoir",
    "poetry",
    "drama",
    "comedy",
    "adventure",
    "western",
    "war",
    "crime",
    "detective",
    "supernatural",
    "paranormal",
    "dystopian",
    "utopian",
    "satire",
    "humor",
];

/// Cleaned catalog data for one book.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogRecord {
    pub description: Option<String>,
    pub subjects: Vec<String>,
    pub genres: Vec<String>,
    pub language: Option<String>,
}

/// An external bibliographic catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Short identifier used in logs and errors.
    fn name(&self) -> &str;

    /// Find the best match for a title/author pair. `Ok(None)` means the
    /// catalog answered but had nothing.
    async fn lookup(&self, title: &str, author: &str) -> Result<Option<CatalogRecord>>;
}

/// Open Library search + works API.
pub struct OpenLibraryCatalog {
    client: reqwest::Client,
    base_url: String,
    max_retries: u32,
}

impl OpenLibraryCatalog {
    pub fn new(config: &EnrichmentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
        })
    }

    async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value> {
        http::get_json(&self.client, "openlibrary", url, query, self.max_retries).await
    }
}

#[async_trait]
impl Catalog for OpenLibraryCatalog {
    fn name(&self) -> &str {
        "openlibrary"
    }

    async fn lookup(&self, title: &str, author: &str) -> Result<Option<CatalogRecord>> {
        let q = if author.is_empty() {
            title.to_string()
        } else {
            format!("{} {}", title, author)
        };

        let search = self
            .get_json(
                &format!("{}/search.json", self.base_url),
                &[
                    ("q", q.as_str()),
                    ("limit", "5"),
                    (
                        "fields",
                        "key,title,author_name,first_sentence,subject,language,number_of_pages_median",
                    ),
                ],
            )
            .await?;

        let Some(doc) = search
            .get("docs")
            .and_then(Value::as_array)
            .and_then(|docs| docs.first())
        else {
            return Ok(None);
        };

        let Some(key) = doc.get("key").and_then(Value::as_str) else {
            return Ok(None);
        };

        let details = self
            .get_json(&format!("{}{}.json", self.base_url, key), &[])
            .await?;

        Ok(Some(record_from_work(doc, &details)))
    }
}

/// Turn a search hit plus its work document into a [`CatalogRecord`].
pub fn record_from_work(search_doc: &Value, work: &Value) -> CatalogRecord {
    let description = match work.get("description") {
        Some(Value::String(s)) => Some(s.as_str()),
        Some(Value::Object(o)) => o.get("value").and_then(Value::as_str),
        _ => None,
    }
    .map(clean_description)
    .filter(|d| !d.is_empty());

    let subjects: Vec<String> = work
        .get("subjects")
        .or_else(|| search_doc.get("subject"))
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    // Work documents use {"key": "/languages/eng"}; search docs use "eng".
    let language = work
        .get("languages")
        .and_then(Value::as_array)
        .and_then(|langs| langs.first())
        .and_then(|l| l.get("key"))
        .and_then(Value::as_str)
        .and_then(|k| k.rsplit('/').next())
        .or_else(|| {
            search_doc
                .get("language")
                .and_then(Value::as_array)
                .and_then(|langs| langs.first())
                .and_then(Value::as_str)
        })
        .filter(|l| !l.is_empty())
        .map(str::to_string);

    CatalogRecord {
        description,
        subjects: extract_subjects(&subjects),
        genres: extract_genres(&subjects),
        language,
    }
}

pub fn extract_subjects(subjects: &[String]) -> Vec<String> {
    subjects
        .iter()
        .filter(|s| {
            let lower = s.to_lowercase();
            !SUBJECT_SKIP.iter().any(|skip| lower.contains(skip))
        })
        .take(MAX_SUBJECTS)
        .cloned()
        .collect()
}

pub fn extract_genres(subjects: &[String]) -> Vec<String> {
    subjects
        .iter()
        .filter(|s| {
            let lower = s.to_lowercase();
            GENRE_KEYWORDS.iter().any(|kw| lower.contains(kw))
        })
        .take(MAX_GENRES)
        .cloned()
        .collect()
}

fn html_tag() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"<[^>]+>").expect("static regex"))
}

/// Strip HTML tags, collapse whitespace, and cap the length.
pub fn clean_description(raw: &str) -> String {
    let stripped = html_tag().replace_all(raw, "");
    let cleaned = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    if cleaned.chars().count() > MAX_DESCRIPTION_CHARS {
        let truncated: String = cleaned.chars().take(MAX_DESCRIPTION_CHARS - 3).collect();
        format!("{}...", truncated)
    } else {
        cleaned
    }
}

/// Outcome of one enrichment run.
#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct EnrichReport {
    pub total: u64,
    pub enriched: u64,
    pub not_found: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Outcome {
    Enriched,
    NotFound,
    Failed,
}

/// Books that have not been looked up successfully yet.
async fn pending_books(pool: &SqlitePool, limit: Option<usize>) -> Result<Vec<Book>> {
    let limit_val = limit.map(|l| l as i64).unwrap_or(-1);
    let rows = sqlx::query(&format!(
        "SELECT {} FROM books WHERE enriched_at IS NULL ORDER BY {} LIMIT ?",
        BOOK_COLUMNS, BOOK_ORDER
    ))
    .bind(limit_val)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(row_to_book).collect())
}

async fn store_record(pool: &SqlitePool, book_id: &str, record: &CatalogRecord) -> Result<()> {
    let join = |v: &[String]| {
        if v.is_empty() {
            None
        } else {
            Some(v.join(", "))
        }
    };
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        UPDATE books SET
            description = ?,
            subjects = ?,
            genres = ?,
            language = ?,
            enriched_at = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&record.description)
    .bind(join(&record.subjects))
    .bind(join(&record.genres))
    .bind(&record.language)
    .bind(now)
    .bind(now)
    .bind(book_id)
    .execute(pool)
    .await?;

    Ok(())
}

async fn enrich_one(
    pool: &SqlitePool,
    catalog: &dyn Catalog,
    book: &Book,
    delay: Duration,
) -> Outcome {
    let result = catalog.lookup(&book.title, &book.author).await;

    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    match result {
        Ok(Some(record)) => match store_record(pool, &book.id, &record).await {
            Ok(()) => {
                tracing::debug!(title = %book.title, "enriched");
                Outcome::Enriched
            }
            Err(e) => {
                tracing::warn!(title = %book.title, error = %e, "failed to store enrichment");
                Outcome::Failed
            }
        },
        Ok(None) => {
            tracing::debug!(title = %book.title, catalog = catalog.name(), "no catalog match");
            Outcome::NotFound
        }
        Err(e) => {
            tracing::warn!(title = %book.title, catalog = catalog.name(), error = %e, "catalog lookup failed");
            Outcome::Failed
        }
    }
}

/// Enrich pending books with bounded concurrency.
pub async fn enrich_books(
    pool: &SqlitePool,
    catalog: Arc<dyn Catalog>,
    config: &EnrichmentConfig,
    limit: Option<usize>,
) -> Result<EnrichReport> {
    let books = pending_books(pool, limit).await?;
    let delay = Duration::from_millis(config.rate_limit_ms);

    tracing::info!(
        books = books.len(),
        workers = config.max_workers,
        catalog = catalog.name(),
        "starting enrichment"
    );

    let mut report = EnrichReport {
        total: books.len() as u64,
        ..EnrichReport::default()
    };

    let outcomes: Vec<Outcome> = stream::iter(books)
        .map(|book| {
            let pool = pool.clone();
            let catalog = catalog.clone();
            async move { enrich_one(&pool, catalog.as_ref(), &book, delay).await }
        })
        .buffer_unordered(config.max_workers.max(1))
        .collect()
        .await;

    for outcome in outcomes {
        match outcome {
            Outcome::Enriched => report.enriched += 1,
            Outcome::NotFound => report.not_found += 1,
            Outcome::Failed => report.errors += 1,
        }
    }

    tracing::info!(
        enriched = report.enriched,
        not_found = report.not_found,
        errors = report.errors,
        "enrichment complete"
    );

    Ok(report)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EnrichmentStats {
    pub total_books: i64,
    pub enriched_books: i64,
    pub enrichment_rate: f64,
}

pub async fn enrichment_stats(pool: &SqlitePool) -> Result<EnrichmentStats> {
    let total_books: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM books")
        .fetch_one(pool)
        .await?;
    let enriched_books: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM books WHERE enriched_at IS NOT NULL",
    )
    .fetch_one(pool)
    .await?;

    Ok(EnrichmentStats {
        total_books,
        enriched_books,
        enrichment_rate: percent(enriched_books, total_books),
    })
}

/// `part / whole` as a percentage rounded to two decimals.
pub fn percent(part: i64, whole: i64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 10000.0).round() / 100.0
}

pub async fn run_enrich(config: &Config, limit: Option<usize>) -> Result<()> {
    let catalog: Arc<dyn Catalog> = Arc::new(OpenLibraryCatalog::new(&config.enrichment)?);
    let pool = db::connect(config).await?;

    let report = enrich_books(&pool, catalog, &config.enrichment, limit).await?;

    println!("enrich");
    println!("  pending: {}", report.total);
    println!("  enriched: {}", report.enriched);
    println!("  no match: {}", report.not_found);
    println!("  errors: {}", report.errors);

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn subjects_skip_generic_entries() {
        let subjects = strings(&[
            "Science Fiction",
            "Deserts",
            "Juvenile literature",
            "Protected DAISY",
            "Ecology",
        ]);
        assert_eq!(extract_subjects(&subjects), strings(&["Deserts", "Ecology"]));
    }

    #[test]
    fn genres_match_keywords_and_cap_at_five() {
        let subjects = strings(&[
            "Science fiction",
            "Deserts",
            "Fantasy fiction",
            "Horror tales",
            "Romance",
            "Crime",
            "Satire",
        ]);
        assert_eq!(
            extract_genres(&subjects),
            strings(&["Science fiction", "Fantasy fiction", "Horror tales", "Romance", "Crime"])
        );
    }

    #[test]
    fn description_is_stripped_and_truncated() {
        assert_eq!(
            clean_description("<p>A  <b>desert</b>\n planet.</p>"),
            "A desert planet."
        );
        let long = "x".repeat(1500);
        let cleaned = clean_description(&long);
        assert_eq!(cleaned.chars().count(), 1000);
        assert!(cleaned.ends_with("..."));
    }

    #[test]
    fn work_document_is_parsed() {
        let doc = json!({"key": "/works/OL893415W", "language": ["eng"]});
        let work = json!({
            "description": {"type": "/type/text", "value": "Set on the desert planet Arrakis."},
            "subjects": ["Science fiction", "Dune (Imaginary place)", "Fiction"],
            "languages": [{"key": "/languages/fre"}]
        });
        let rec = record_from_work(&doc, &work);
        assert_eq!(
            rec.description.as_deref(),
            Some("Set on the desert planet Arrakis.")
        );
        assert_eq!(rec.subjects, strings(&["Dune (Imaginary place)"]));
        assert_eq!(rec.genres, strings(&["Science fiction", "Fiction"]));
        assert_eq!(rec.language.as_deref(), Some("fre"));
    }

    #[test]
    fn language_falls_back_to_search_doc() {
        let doc = json!({"language": ["eng", "spa"]});
        let work = json!({"description": "Plain string."});
        let rec = record_from_work(&doc, &work);
        assert_eq!(rec.description.as_deref(), Some("Plain string."));
        assert_eq!(rec.language.as_deref(), Some("eng"));
        assert!(rec.subjects.is_empty());
    }

    #[test]
    fn percent_rounds_to_two_decimals() {
        assert_eq!(percent(1, 3), 33.33);
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(5, 5), 100.0);
    }
}
