//! Book retrieval.
//!
//! Read-side queries shared by the CLI, the HTTP server, and the later
//! pipeline stages. Writes live with the stage that owns the columns
//! (importer, enricher, clusterer).

use anyhow::Result;
use chrono::NaiveDate;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::ShelfError;
use crate::models::Book;

/// Column list matching [`row_to_book`].
pub const BOOK_COLUMNS: &str = "id, source_id, title, author, isbn, isbn13, my_rating, \
    average_rating, publisher, pages, year_published, original_publication_year, date_read, \
    date_added, bookshelves, my_review, description, subjects, genres, language, enriched_at, \
    cluster_id, centroid_distance, proj_x, proj_y";

/// Stable ordering used everywhere books are listed.
pub const BOOK_ORDER: &str = "title COLLATE NOCASE, author COLLATE NOCASE, date_read, id";

pub fn row_to_book(row: &SqliteRow) -> Book {
    Book {
        id: row.get("id"),
        source_id: row.get("source_id"),
        title: row.get("title"),
        author: row.get("author"),
        isbn: row.get("isbn"),
        isbn13: row.get("isbn13"),
        my_rating: row.get("my_rating"),
        average_rating: row.get("average_rating"),
        publisher: row.get("publisher"),
        pages: row.get("pages"),
        year_published: row.get("year_published"),
        original_publication_year: row.get("original_publication_year"),
        date_read: parse_stored_date(row.get("date_read")),
        date_added: parse_stored_date(row.get("date_added")),
        bookshelves: row.get("bookshelves"),
        my_review: row.get("my_review"),
        description: row.get("description"),
        subjects: row.get("subjects"),
        genres: row.get("genres"),
        language: row.get("language"),
        enriched_at: row.get("enriched_at"),
        cluster_id: row.get("cluster_id"),
        centroid_distance: row.get("centroid_distance"),
        proj_x: row.get("proj_x"),
        proj_y: row.get("proj_y"),
    }
}

fn parse_stored_date(value: Option<String>) -> Option<NaiveDate> {
    value.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
}

pub async fn list_books(pool: &SqlitePool) -> Result<Vec<Book>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM books ORDER BY {}",
        BOOK_COLUMNS, BOOK_ORDER
    ))
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(row_to_book).collect())
}

pub async fn get_book(pool: &SqlitePool, id: &str) -> Result<Book> {
    let row = sqlx::query(&format!("SELECT {} FROM books WHERE id = ?", BOOK_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Ok(row_to_book(&row)),
        None => Err(ShelfError::not_found(format!("book {}", id)).into()),
    }
}

pub async fn books_in_cluster(pool: &SqlitePool, cluster_id: i64) -> Result<Vec<Book>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM books WHERE cluster_id = ? ORDER BY centroid_distance, {}",
        BOOK_COLUMNS, BOOK_ORDER
    ))
    .bind(cluster_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(row_to_book).collect())
}
