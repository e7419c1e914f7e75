//! CSV import pipeline.
//!
//! Parses a reading-history export (Goodreads layout), normalizes each row
//! into a [`BookRecord`], and upserts it keyed on a deduplication hash of
//! title, author, and read date. Importing the same file twice leaves one
//! stored row per book and keeps anything later stages wrote to it.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use uuid::Uuid;

use crate::config::{Config, ImportConfig};
use crate::db;
use crate::error::ShelfError;
use crate::models::BookRecord;

/// Columns the importer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Field {
    BookId,
    Title,
    Author,
    Isbn,
    Isbn13,
    MyRating,
    AverageRating,
    Publisher,
    Pages,
    YearPublished,
    OriginalPublicationYear,
    DateRead,
    DateAdded,
    Bookshelves,
    MyReview,
}

/// Header spellings seen in real exports, compared case-insensitively.
const HEADER_ALIASES: &[(Field, &[&str])] = &[
    (Field::BookId, &["book id", "id"]),
    (Field::Title, &["title"]),
    (Field::Author, &["author", "author l-f"]),
    (Field::Isbn, &["isbn"]),
    (Field::Isbn13, &["isbn13"]),
    (Field::MyRating, &["my rating", "rating"]),
    (Field::AverageRating, &["average rating"]),
    (Field::Publisher, &["publisher"]),
    (Field::Pages, &["number of pages", "pages"]),
    (Field::YearPublished, &["year published"]),
    (
        Field::OriginalPublicationYear,
        &["original publication year"],
    ),
    (Field::DateRead, &["date read", "date read (yyyy/mm/dd)"]),
    (Field::DateAdded, &["date added", "date added (yyyy/mm/dd)"]),
    (Field::Bookshelves, &["bookshelves", "shelves", "tags"]),
    (Field::MyReview, &["my review", "review"]),
];

const DATE_FORMATS: &[&str] = &["%Y/%m/%d", "%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y"];

struct HeaderMap {
    index: HashMap<Field, usize>,
}

impl HeaderMap {
    fn new(headers: &csv::StringRecord) -> Self {
        let mut index = HashMap::new();
        for (i, raw) in headers.iter().enumerate() {
            let name = raw.trim_start_matches('\u{feff}').trim().to_lowercase();
            for (field, aliases) in HEADER_ALIASES {
                // First matching column wins ("Author" before "Author l-f")
                if aliases.contains(&name.as_str()) && !index.contains_key(field) {
                    index.insert(*field, i);
                }
            }
        }
        Self { index }
    }

    fn get<'r>(&self, record: &'r csv::StringRecord, field: Field) -> Option<&'r str> {
        self.index.get(&field).and_then(|&i| record.get(i))
    }
}

/// Result of parsing an export, before anything is written.
#[derive(Debug, Default)]
pub struct ParsedExport {
    pub records: Vec<BookRecord>,
    pub total_rows: u64,
    pub skipped: u64,
    pub errors: Vec<String>,
}

/// Summary returned by an import.
#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct ImportReport {
    pub total_rows: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: Vec<String>,
}

/// Parse an export into normalized records.
///
/// Rows without a title (or without an author when `require_author` is
/// set) are counted as skipped. Rows the CSV reader cannot decode are
/// skipped and described in `errors`. Only a missing `Title` column is
/// fatal.
pub fn parse_export<R: Read>(reader: R, config: &ImportConfig) -> Result<ParsedExport> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::None)
        .from_reader(reader);

    let headers = rdr
        .headers()
        .map_err(|e| ShelfError::validation(format!("unreadable CSV header: {}", e)))?
        .clone();
    let header_map = HeaderMap::new(&headers);

    if !header_map.index.contains_key(&Field::Title) {
        return Err(ShelfError::validation("export has no 'Title' column").into());
    }

    let mut parsed = ParsedExport::default();

    for result in rdr.records() {
        parsed.total_rows += 1;

        let record = match result {
            Ok(r) => r,
            Err(e) => {
                let line = e
                    .position()
                    .map(|p| p.line())
                    .unwrap_or(parsed.total_rows + 1);
                tracing::warn!(line, error = %e, "skipping undecodable row");
                push_error(&mut parsed.errors, config, format!("line {}: {}", line, e));
                parsed.skipped += 1;
                continue;
            }
        };
        let line = record
            .position()
            .map(|p| p.line())
            .unwrap_or(parsed.total_rows + 1);

        match normalize_row(&header_map, &record) {
            Some(book) if config.require_author && book.author.is_none() => {
                tracing::debug!(line, title = %book.title, "skipping row without author");
                parsed.skipped += 1;
            }
            Some(book) => parsed.records.push(book),
            None => {
                tracing::debug!(line, "skipping row without title");
                parsed.skipped += 1;
            }
        }
    }

    Ok(parsed)
}

fn push_error(errors: &mut Vec<String>, config: &ImportConfig, message: String) {
    if errors.len() < config.max_errors_reported {
        errors.push(message);
    }
}

/// Build a record from one row; `None` when the title is missing.
fn normalize_row(headers: &HeaderMap, row: &csv::StringRecord) -> Option<BookRecord> {
    let field = |f: Field| headers.get(row, f);

    let title = clean_text(field(Field::Title))?;

    Some(BookRecord {
        source_id: clean_text(field(Field::BookId)),
        title,
        author: clean_text(field(Field::Author)),
        isbn: clean_isbn(field(Field::Isbn)),
        isbn13: clean_isbn(field(Field::Isbn13)),
        my_rating: parse_rating(field(Field::MyRating)),
        average_rating: parse_average_rating(field(Field::AverageRating)),
        publisher: clean_text(field(Field::Publisher)),
        pages: parse_pages(field(Field::Pages)),
        year_published: parse_year(field(Field::YearPublished)),
        original_publication_year: parse_year(field(Field::OriginalPublicationYear)),
        date_read: parse_date(field(Field::DateRead)),
        date_added: parse_date(field(Field::DateAdded)),
        bookshelves: clean_text(field(Field::Bookshelves)),
        my_review: clean_text(field(Field::MyReview)),
    })
}

/// Trim and collapse internal whitespace; empty becomes `None`.
pub fn clean_text(value: Option<&str>) -> Option<String> {
    let cleaned = value?.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Goodreads wraps ISBNs as `="0441172717"` to stop spreadsheets mangling them.
pub fn clean_isbn(value: Option<&str>) -> Option<String> {
    let raw = clean_text(value)?;
    let stripped = raw.trim_start_matches('=').trim_matches('"').trim();
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

/// Ratings are whole stars; `0` means "not rated".
pub fn parse_rating(value: Option<&str>) -> Option<i64> {
    let rating: f64 = value?.trim().parse().ok()?;
    if rating > 0.0 && rating.is_finite() {
        Some(rating.trunc() as i64).filter(|r| *r > 0)
    } else {
        None
    }
}

pub fn parse_average_rating(value: Option<&str>) -> Option<f64> {
    let rating: f64 = value?.trim().parse().ok()?;
    if rating > 0.0 && rating.is_finite() {
        Some(rating)
    } else {
        None
    }
}

pub fn parse_year(value: Option<&str>) -> Option<i64> {
    let year: i64 = value?.trim().parse().ok()?;
    if (1500..=2030).contains(&year) {
        Some(year)
    } else {
        None
    }
}

pub fn parse_pages(value: Option<&str>) -> Option<i64> {
    let pages: i64 = value?.trim().parse().ok()?;
    if pages > 0 {
        Some(pages)
    } else {
        None
    }
}

/// Try each supported export date format in order.
pub fn parse_date(value: Option<&str>) -> Option<NaiveDate> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

/// Identity of a reading event: same title, author, and read date map to
/// the same stored record regardless of casing.
pub fn dedup_key(record: &BookRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.title.to_lowercase().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(
        record
            .author
            .as_deref()
            .unwrap_or("")
            .to_lowercase()
            .as_bytes(),
    );
    hasher.update(b"\x1f");
    if let Some(date) = record.date_read {
        hasher.update(date.format("%Y-%m-%d").to_string().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Upsert records in one transaction. Returns `(inserted, updated)`.
pub async fn import_records(pool: &SqlitePool, records: &[BookRecord]) -> Result<(u64, u64)> {
    let mut tx = pool.begin().await?;
    let now = chrono::Utc::now().timestamp();
    let mut inserted = 0u64;
    let mut updated = 0u64;

    for record in records {
        let key = dedup_key(record);

        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM books WHERE dedup_key = ?")
                .bind(&key)
                .fetch_optional(&mut *tx)
                .await?;

        if existing.is_some() {
            updated += 1;
        } else {
            inserted += 1;
        }
        let id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());

        sqlx::query(
            r#"
            INSERT INTO books (id, dedup_key, source_id, title, author, isbn, isbn13, my_rating,
                average_rating, publisher, pages, year_published, original_publication_year,
                date_read, date_added, bookshelves, my_review, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(dedup_key) DO UPDATE SET
                source_id = excluded.source_id,
                isbn = excluded.isbn,
                isbn13 = excluded.isbn13,
                my_rating = excluded.my_rating,
                average_rating = excluded.average_rating,
                publisher = excluded.publisher,
                pages = excluded.pages,
                year_published = excluded.year_published,
                original_publication_year = excluded.original_publication_year,
                date_added = excluded.date_added,
                bookshelves = excluded.bookshelves,
                my_review = excluded.my_review,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&id)
        .bind(&key)
        .bind(&record.source_id)
        .bind(&record.title)
        .bind(record.author.as_deref().unwrap_or(""))
        .bind(&record.isbn)
        .bind(&record.isbn13)
        .bind(record.my_rating)
        .bind(record.average_rating)
        .bind(&record.publisher)
        .bind(record.pages)
        .bind(record.year_published)
        .bind(record.original_publication_year)
        .bind(record.date_read.map(|d| d.format("%Y-%m-%d").to_string()))
        .bind(record.date_added.map(|d| d.format("%Y-%m-%d").to_string()))
        .bind(&record.bookshelves)
        .bind(&record.my_review)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok((inserted, updated))
}

/// Parse and store an export held in memory (the upload path).
pub async fn import_csv_bytes(
    pool: &SqlitePool,
    bytes: &[u8],
    config: &ImportConfig,
) -> Result<ImportReport> {
    let parsed = parse_export(bytes, config)?;
    let (inserted, updated) = import_records(pool, &parsed.records).await?;

    let report = ImportReport {
        total_rows: parsed.total_rows,
        inserted,
        updated,
        skipped: parsed.skipped,
        errors: parsed.errors,
    };

    tracing::info!(
        total_rows = report.total_rows,
        inserted = report.inserted,
        updated = report.updated,
        skipped = report.skipped,
        errors = report.errors.len(),
        "import complete"
    );

    Ok(report)
}

pub async fn run_import(config: &Config, path: &Path) -> Result<()> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read export file: {}", path.display()))?;

    let pool = db::connect(config).await?;
    let report = import_csv_bytes(&pool, &bytes, &config.import).await?;

    println!("import {}", path.display());
    println!("  rows: {}", report.total_rows);
    println!("  inserted: {}", report.inserted);
    println!("  updated: {}", report.updated);
    println!("  skipped: {}", report.skipped);
    for err in &report.errors {
        println!("  error: {}", err);
    }
    println!("ok");

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "Book Id,Title,Author,ISBN,My Rating,Average Rating,Number of Pages,\
Year Published,Date Read,Date Added,Bookshelves,My Review\n";

    fn parse(body: &str) -> ParsedExport {
        let csv = format!("{}{}", HEADER, body);
        parse_export(csv.as_bytes(), &ImportConfig::default()).unwrap()
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2023, 1, 15);
        assert_eq!(parse_date(Some("2023/01/15")), expected);
        assert_eq!(parse_date(Some("2023-01-15")), expected);
        assert_eq!(parse_date(Some("01/15/2023")), expected);
        assert_eq!(parse_date(Some("")), None);
        assert_eq!(parse_date(Some("invalid")), None);
        assert_eq!(parse_date(None), None);
    }

    #[test]
    fn test_parse_rating() {
        assert_eq!(parse_rating(Some("4")), Some(4));
        assert_eq!(parse_rating(Some("4.7")), Some(4));
        assert_eq!(parse_rating(Some("0")), None);
        assert_eq!(parse_rating(Some("")), None);
        assert_eq!(parse_rating(Some("invalid")), None);
    }

    #[test]
    fn test_parse_year_bounds() {
        assert_eq!(parse_year(Some("1965")), Some(1965));
        assert_eq!(parse_year(Some("2030")), Some(2030));
        assert_eq!(parse_year(Some("1499")), None);
        assert_eq!(parse_year(Some("2031")), None);
        assert_eq!(parse_year(Some("soon")), None);
    }

    #[test]
    fn test_parse_pages() {
        assert_eq!(parse_pages(Some(" 688 ")), Some(688));
        assert_eq!(parse_pages(Some("0")), None);
        assert_eq!(parse_pages(Some("-3")), None);
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(
            clean_text(Some("  hello   world ")),
            Some("hello world".to_string())
        );
        assert_eq!(clean_text(Some("   ")), None);
        assert_eq!(clean_text(None), None);
    }

    #[test]
    fn test_clean_isbn_strips_spreadsheet_guard() {
        assert_eq!(
            clean_isbn(Some("=\"0441172717\"")),
            Some("0441172717".to_string())
        );
        assert_eq!(clean_isbn(Some("=\"\"")), None);
    }

    #[test]
    fn rows_without_title_are_excluded() {
        let parsed = parse(
            "1,Dune,Frank Herbert,,5,4.25,688,1990,2023/03/20,2023/01/10,sci-fi,Epic\n\
             2,,Nobody,,3,,,,,,,\n\
             3,   ,Also Nobody,,3,,,,,,,\n",
        );
        assert_eq!(parsed.total_rows, 3);
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.skipped, 2);
        assert_eq!(parsed.records[0].title, "Dune");
        assert_eq!(parsed.records[0].my_rating, Some(5));
        assert_eq!(parsed.records[0].pages, Some(688));
        assert_eq!(
            parsed.records[0].date_read,
            NaiveDate::from_ymd_opt(2023, 3, 20)
        );
    }

    #[test]
    fn require_author_drops_anonymous_rows() {
        let csv = format!("{}1,Beowulf,,,4,,,,,,,\n", HEADER);
        let cfg = ImportConfig {
            require_author: true,
            ..ImportConfig::default()
        };
        let parsed = parse_export(csv.as_bytes(), &cfg).unwrap();
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.skipped, 1);

        let lenient = parse_export(csv.as_bytes(), &ImportConfig::default()).unwrap();
        assert_eq!(lenient.records.len(), 1);
        assert_eq!(lenient.records[0].author, None);
    }

    #[test]
    fn header_aliases_and_bom_are_accepted() {
        let csv = "\u{feff}TITLE,author,Date Read (yyyy/mm/dd),Shelves\n\
                   The Great Gatsby,F. Scott Fitzgerald,2023/01/15,\"classics, fiction\"\n";
        let parsed = parse_export(csv.as_bytes(), &ImportConfig::default()).unwrap();
        assert_eq!(parsed.records.len(), 1);
        let rec = &parsed.records[0];
        assert_eq!(rec.author.as_deref(), Some("F. Scott Fitzgerald"));
        assert_eq!(rec.date_read, NaiveDate::from_ymd_opt(2023, 1, 15));
        assert_eq!(rec.bookshelves.as_deref(), Some("classics, fiction"));
    }

    #[test]
    fn missing_title_column_is_a_validation_error() {
        let err = parse_export("Author,Rating\nX,3\n".as_bytes(), &ImportConfig::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ShelfError>(),
            Some(ShelfError::Validation(_))
        ));
    }

    #[test]
    fn dedup_key_ignores_case_but_not_date() {
        let a = BookRecord {
            title: "Dune".into(),
            author: Some("Frank Herbert".into()),
            date_read: NaiveDate::from_ymd_opt(2023, 3, 20),
            ..BookRecord::default()
        };
        let mut b = a.clone();
        b.title = "DUNE".into();
        b.my_rating = Some(2);
        assert_eq!(dedup_key(&a), dedup_key(&b));

        let mut reread = a.clone();
        reread.date_read = NaiveDate::from_ymd_opt(2024, 7, 1);
        assert_ne!(dedup_key(&a), dedup_key(&reread));
    }

    #[tokio::test]
    async fn reimport_maps_to_same_records() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = Config::with_db_path(tmp.path().join("shelf.sqlite"));
        let pool = db::connect(&cfg).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();

        let csv = format!(
            "{}1,Dune,Frank Herbert,,5,,,,2023/03/20,,sci-fi,\n\
             2,Emma,Jane Austen,,4,,,,2022/05/01,,classics,\n",
            HEADER
        );

        let first = import_csv_bytes(&pool, csv.as_bytes(), &cfg.import)
            .await
            .unwrap();
        assert_eq!((first.inserted, first.updated), (2, 0));
        let ids_before: Vec<String> = sqlx::query_scalar("SELECT id FROM books ORDER BY title")
            .fetch_all(&pool)
            .await
            .unwrap();

        let second = import_csv_bytes(&pool, csv.as_bytes(), &cfg.import)
            .await
            .unwrap();
        assert_eq!((second.inserted, second.updated), (0, 2));
        let ids_after: Vec<String> = sqlx::query_scalar("SELECT id FROM books ORDER BY title")
            .fetch_all(&pool)
            .await
            .unwrap();

        assert_eq!(ids_before, ids_after);
    }
}
