//! Core data models.
//!
//! A [`BookRecord`] is what the importer produces from one export row; a
//! [`Book`] is the stored row, carrying enrichment and clustering columns
//! filled in by later stages.

use chrono::NaiveDate;
use serde::Serialize;

/// A normalized export row, ready to be upserted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookRecord {
    /// Identifier assigned by the exporting service, if any.
    pub source_id: Option<String>,
    pub title: String,
    pub author: Option<String>,
    pub isbn: Option<String>,
    pub isbn13: Option<String>,
    pub my_rating: Option<i64>,
    pub average_rating: Option<f64>,
    pub publisher: Option<String>,
    pub pages: Option<i64>,
    pub year_published: Option<i64>,
    pub original_publication_year: Option<i64>,
    pub date_read: Option<NaiveDate>,
    pub date_added: Option<NaiveDate>,
    /// Free-text shelf tags, comma separated.
    pub bookshelves: Option<String>,
    pub my_review: Option<String>,
}

/// A book as stored in SQLite.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Book {
    pub id: String,
    pub source_id: Option<String>,
    pub title: String,
    pub author: String,
    pub isbn: Option<String>,
    pub isbn13: Option<String>,
    pub my_rating: Option<i64>,
    pub average_rating: Option<f64>,
    pub publisher: Option<String>,
    pub pages: Option<i64>,
    pub year_published: Option<i64>,
    pub original_publication_year: Option<i64>,
    pub date_read: Option<NaiveDate>,
    pub date_added: Option<NaiveDate>,
    pub bookshelves: Option<String>,
    pub my_review: Option<String>,
    pub description: Option<String>,
    pub subjects: Option<String>,
    pub genres: Option<String>,
    pub language: Option<String>,
    /// Unix seconds of the last catalog lookup that found a match.
    pub enriched_at: Option<i64>,
    pub cluster_id: Option<i64>,
    pub centroid_distance: Option<f64>,
    pub proj_x: Option<f64>,
    pub proj_y: Option<f64>,
}

impl Book {
    /// True once a catalog lookup has matched, even if the match carried
    /// no description, subjects, or genres.
    pub fn is_enriched(&self) -> bool {
        self.enriched_at.is_some()
    }

    /// Shelf tags split on commas, trimmed, empties dropped.
    pub fn shelf_tags(&self) -> Vec<&str> {
        self.bookshelves
            .as_deref()
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// One stored LLM round-trip.
#[derive(Debug, Clone, Serialize)]
pub struct LlmHistoryEntry {
    pub id: i64,
    pub created_at: i64,
    pub kind: String,
    pub prompt: String,
    pub response: String,
    pub status: String,
    pub extra: serde_json::Value,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A stored book with only the fields tests usually care about.
    pub fn book(id: &str, title: &str, author: &str, rating: Option<i64>) -> Book {
        Book {
            id: id.to_string(),
            source_id: None,
            title: title.to_string(),
            author: author.to_string(),
            isbn: None,
            isbn13: None,
            my_rating: rating,
            average_rating: None,
            publisher: None,
            pages: None,
            year_published: None,
            original_publication_year: None,
            date_read: None,
            date_added: None,
            bookshelves: None,
            my_review: None,
            description: None,
            subjects: None,
            genres: None,
            language: None,
            enriched_at: None,
            cluster_id: None,
            centroid_distance: None,
            proj_x: None,
            proj_y: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::book;

    #[test]
    fn shelf_tags_are_trimmed() {
        let mut b = book("1", "Dune", "Frank Herbert", Some(5));
        b.bookshelves = Some(" sci-fi, , favorites ,classics".to_string());
        assert_eq!(b.shelf_tags(), vec!["sci-fi", "favorites", "classics"]);
    }

    #[test]
    fn enrichment_follows_lookup_timestamp() {
        let mut b = book("1", "Dune", "Frank Herbert", None);
        b.genres = Some("Science fiction".to_string());
        assert!(!b.is_enriched());
        b.enriched_at = Some(1_700_000_000);
        assert!(b.is_enriched());
    }
}
