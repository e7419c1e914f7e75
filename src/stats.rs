//! Aggregate reading statistics.
//!
//! [`aggregate`] is a pure function over the stored books; it feeds both
//! `shelf stats` and the prompt variables, so its output ordering must be
//! fully deterministic (ordered maps, ties broken by name).

use anyhow::Result;
use chrono::Datelike;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};

use crate::books::list_books;
use crate::config::Config;
use crate::db;
use crate::enrich::percent;
use crate::models::Book;

const TOP_N: usize = 10;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NamedCount {
    pub name: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ReadingTimeline {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub total_days: i64,
    pub books_per_month: f64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ReadingStats {
    pub total_books: i64,
    pub rated_books: i64,
    pub average_rating: f64,
    pub rating_distribution: BTreeMap<i64, i64>,
    /// Most common shelf tags.
    pub top_genres: Vec<NamedCount>,
    pub top_authors: Vec<NamedCount>,
    /// Books finished per calendar year.
    pub year_distribution: BTreeMap<i32, i64>,
    pub reading_timeline: ReadingTimeline,
    pub enrichment_rate: f64,
    pub embedded_books: i64,
    pub clustered_books: i64,
}

/// Count descending, then name ascending, first `TOP_N`.
fn top_counts(counts: HashMap<&str, i64>) -> Vec<NamedCount> {
    let mut v: Vec<(&str, i64)> = counts.into_iter().collect();
    v.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    v.into_iter()
        .take(TOP_N)
        .map(|(name, count)| NamedCount {
            name: name.to_string(),
            count,
        })
        .collect()
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn timeline(books: &[Book]) -> ReadingTimeline {
    let dates: Vec<_> = books.iter().filter_map(|b| b.date_read).collect();
    let (Some(start), Some(end)) = (dates.iter().min(), dates.iter().max()) else {
        return ReadingTimeline::default();
    };

    let total_days = (*end - *start).num_days();
    let n = dates.len() as f64;
    let books_per_month = if total_days == 0 {
        n
    } else {
        n / (total_days as f64 / 30.0).max(1.0)
    };

    ReadingTimeline {
        start_date: Some(start.format("%Y-%m-%d").to_string()),
        end_date: Some(end.format("%Y-%m-%d").to_string()),
        total_days,
        books_per_month: round2(books_per_month),
    }
}

/// Compute statistics for `books`. `embedded_books` is left at zero;
/// [`reading_stats`] fills it from the database.
pub fn aggregate(books: &[Book]) -> ReadingStats {
    let ratings: Vec<i64> = books.iter().filter_map(|b| b.my_rating).collect();
    let average_rating = if ratings.is_empty() {
        0.0
    } else {
        round2(ratings.iter().sum::<i64>() as f64 / ratings.len() as f64)
    };

    let mut rating_distribution = BTreeMap::new();
    for r in &ratings {
        *rating_distribution.entry(*r).or_insert(0) += 1;
    }

    let mut genres: HashMap<&str, i64> = HashMap::new();
    let mut authors: HashMap<&str, i64> = HashMap::new();
    let mut year_distribution = BTreeMap::new();
    for book in books {
        for tag in book.shelf_tags() {
            *genres.entry(tag).or_insert(0) += 1;
        }
        if !book.author.is_empty() {
            *authors.entry(book.author.as_str()).or_insert(0) += 1;
        }
        if let Some(d) = book.date_read {
            *year_distribution.entry(d.year()).or_insert(0) += 1;
        }
    }

    let enriched = books.iter().filter(|b| b.is_enriched()).count() as i64;

    ReadingStats {
        total_books: books.len() as i64,
        rated_books: ratings.len() as i64,
        average_rating,
        rating_distribution,
        top_genres: top_counts(genres),
        top_authors: top_counts(authors),
        year_distribution,
        reading_timeline: timeline(books),
        enrichment_rate: percent(enriched, books.len() as i64),
        embedded_books: 0,
        clustered_books: books.iter().filter(|b| b.cluster_id.is_some()).count() as i64,
    }
}

pub async fn reading_stats(pool: &SqlitePool) -> Result<ReadingStats> {
    let books = list_books(pool).await?;
    let mut stats = aggregate(&books);
    stats.embedded_books = sqlx::query_scalar("SELECT COUNT(*) FROM book_embeddings")
        .fetch_one(pool)
        .await?;
    Ok(stats)
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = reading_stats(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Shelf Insight: Reading Stats");
    println!("=============================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Books:       {}", stats.total_books);
    println!(
        "  Rated:       {} (avg {:.2})",
        stats.rated_books, stats.average_rating
    );
    println!("  Enriched:    {}%", stats.enrichment_rate);
    println!("  Embedded:    {}", stats.embedded_books);
    println!("  Clustered:   {}", stats.clustered_books);

    let t = &stats.reading_timeline;
    if let (Some(start), Some(end)) = (&t.start_date, &t.end_date) {
        println!(
            "  Timeline:    {} → {} ({} days, {:.2} books/month)",
            start, end, t.total_days, t.books_per_month
        );
    }

    if !stats.rating_distribution.is_empty() {
        println!();
        println!("  Ratings:");
        for (rating, count) in &stats.rating_distribution {
            println!("    {} ★  {}", rating, count);
        }
    }

    print_top("Top shelves", &stats.top_genres);
    print_top("Top authors", &stats.top_authors);

    println!();

    pool.close().await;
    Ok(())
}

fn print_top(heading: &str, rows: &[NamedCount]) {
    if rows.is_empty() {
        return;
    }
    println!();
    println!("  {}:", heading);
    for r in rows {
        println!("    {:<32} {:>4}", r.name, r.count);
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
