//! Embedding provider abstraction and the book embedding pass.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: returns errors; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: calls the OpenAI embeddings API.
//! - **[`OllamaProvider`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`GeminiProvider`]**: calls Gemini `batchEmbedContents`.
//!
//! Remote providers share the retry policy in [`crate::http`].
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`]: compute similarity between two embedding vectors
//! - [`vec_to_blob`]: encode a `Vec<f32>` as little-endian bytes for SQLite BLOB storage
//! - [`blob_to_vec`]: decode a SQLite BLOB back into a `Vec<f32>`
//!
//! Each stored vector carries the SHA-256 of the text it was computed from,
//! so editing a book (or enriching it) marks its embedding stale and the
//! next [`embed_books`] run recomputes it.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use crate::books::{row_to_book, BOOK_COLUMNS, BOOK_ORDER};
use crate::config::{Config, EmbeddingConfig};
use crate::db;
use crate::enrich::percent;
use crate::error::ShelfError;
use crate::http;
use crate::models::Book;

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ============ Disabled Provider ============

pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(ShelfError::config(
            "embedding provider is disabled; set [embedding] provider in config",
        )
        .into())
    }
}

/// Model, dims, and client shared by the remote providers.
struct RemoteSettings {
    client: reqwest::Client,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl RemoteSettings {
    fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| ShelfError::config("embedding.model required"))?;
        let dims = config
            .dims
            .ok_or_else(|| ShelfError::config("embedding.dims required"))?;

        Ok(Self {
            client: http::client(config.timeout_secs)?,
            model,
            dims,
            max_retries: config.max_retries,
        })
    }
}

// ============ OpenAI Provider ============

pub struct OpenAIProvider {
    settings: RemoteSettings,
    url: String,
    api_key: String,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = http::api_key("OPENAI_API_KEY")?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        Ok(Self {
            settings: RemoteSettings::new(config)?,
            url: url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.settings.model
    }
    fn dims(&self) -> usize {
        self.settings.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = json!({
            "model": self.settings.model,
            "input": texts,
        });
        let json = http::post_json(
            &self.settings.client,
            "openai",
            &format!("{}/v1/embeddings", self.url),
            &[("Authorization", format!("Bearer {}", self.api_key))],
            &body,
            self.settings.max_retries,
        )
        .await?;

        parse_openai_response(&json)
    }
}

/// Extracts `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ShelfError::external("openai", "missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .ok_or_else(|| ShelfError::external("openai", "missing embedding"))?;
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, json_vector(embedding, "openai")?));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default `http://localhost:11434`).
pub struct OllamaProvider {
    settings: RemoteSettings,
    url: String,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            settings: RemoteSettings::new(config)?,
            url: url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.settings.model
    }
    fn dims(&self) -> usize {
        self.settings.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = json!({
            "model": self.settings.model,
            "input": texts,
        });
        let json = http::post_json(
            &self.settings.client,
            "ollama",
            &format!("{}/api/embed", self.url),
            &[],
            &body,
            self.settings.max_retries,
        )
        .await?;

        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ShelfError::external("ollama", "missing embeddings array"))?;

        embeddings.iter().map(|e| json_vector(e, "ollama")).collect()
    }
}

// ============ Gemini Provider ============

pub struct GeminiProvider {
    settings: RemoteSettings,
    url: String,
    api_key: String,
}

impl GeminiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = http::api_key("GEMINI_API_KEY")?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string());

        Ok(Self {
            settings: RemoteSettings::new(config)?,
            url: url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for GeminiProvider {
    fn model_name(&self) -> &str {
        &self.settings.model
    }
    fn dims(&self) -> usize {
        self.settings.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model_path = format!("models/{}", self.settings.model);
        let requests: Vec<Value> = texts
            .iter()
            .map(|t| {
                json!({
                    "model": model_path,
                    "content": {"parts": [{"text": t}]},
                    "taskType": "CLUSTERING",
                })
            })
            .collect();

        let json = http::post_json(
            &self.settings.client,
            "gemini",
            &format!("{}/v1beta/{}:batchEmbedContents", self.url, model_path),
            &[("x-goog-api-key", self.api_key.clone())],
            &json!({ "requests": requests }),
            self.settings.max_retries,
        )
        .await?;

        let embeddings = json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ShelfError::external("gemini", "missing embeddings array"))?;

        embeddings
            .iter()
            .map(|e| {
                let values = e
                    .get("values")
                    .ok_or_else(|| ShelfError::external("gemini", "missing values"))?;
                json_vector(values, "gemini")
            })
            .collect()
    }
}

fn json_vector(value: &Value, service: &str) -> Result<Vec<f32>> {
    let arr = value
        .as_array()
        .ok_or_else(|| ShelfError::external(service, "embedding is not an array"))?;
    Ok(arr
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

/// Instantiate the provider named by `config.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        "gemini" => Ok(Arc::new(GeminiProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// The text a book is embedded from: labelled fields, present ones only.
pub fn book_text(book: &Book) -> String {
    let mut parts = vec![
        format!("Title: {}", book.title),
        format!("Author: {}", book.author),
    ];

    let optional = [
        ("Description", book.description.as_deref()),
        ("Subjects", book.subjects.as_deref()),
        ("Genres", book.genres.as_deref()),
        ("Review", book.my_review.as_deref()),
        ("Bookshelves", book.bookshelves.as_deref()),
        ("Publisher", book.publisher.as_deref()),
    ];
    for (label, value) in optional {
        if let Some(v) = value.filter(|v| !v.is_empty()) {
            parts.push(format!("{}: {}", label, v));
        }
    }
    if let Some(year) = book.year_published {
        parts.push(format!("Year: {}", year));
    }

    parts.join(" | ")
}

fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

struct PendingBook {
    book_id: String,
    text: String,
    text_hash: String,
}

/// Books with no embedding for `model`, or whose text changed since.
async fn find_pending(
    pool: &SqlitePool,
    model: &str,
    limit: Option<usize>,
) -> Result<Vec<PendingBook>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM books ORDER BY {}",
        BOOK_COLUMNS, BOOK_ORDER
    ))
    .fetch_all(pool)
    .await?;

    let existing: std::collections::HashMap<String, String> =
        sqlx::query("SELECT book_id, hash FROM book_embeddings WHERE model = ?")
            .bind(model)
            .fetch_all(pool)
            .await?
            .iter()
            .map(|r| (r.get("book_id"), r.get("hash")))
            .collect();

    let mut pending = Vec::new();
    for row in &rows {
        let book = row_to_book(row);
        let text = book_text(&book);
        let text_hash = hash_text(&text);

        if existing.get(&book.id) == Some(&text_hash) {
            continue;
        }
        pending.push(PendingBook {
            book_id: book.id,
            text,
            text_hash,
        });
        if limit.is_some_and(|l| pending.len() >= l) {
            break;
        }
    }

    Ok(pending)
}

async fn upsert_embedding(
    pool: &SqlitePool,
    book_id: &str,
    model: &str,
    text_hash: &str,
    vector: &[f32],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO book_embeddings (book_id, model, dims, hash, vector, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(book_id) DO UPDATE SET
            model = excluded.model,
            dims = excluded.dims,
            hash = excluded.hash,
            vector = excluded.vector,
            created_at = excluded.created_at
        "#,
    )
    .bind(book_id)
    .bind(model)
    .bind(vector.len() as i64)
    .bind(text_hash)
    .bind(vec_to_blob(vector))
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(Debug, Default, Clone, Serialize, PartialEq)]
pub struct EmbedReport {
    pub total: u64,
    pub embedded: u64,
    pub failed: u64,
}

/// Embed every missing or stale book in batches of `config.batch_size`.
///
/// A failing batch is logged and counted; other batches still run. A
/// configuration error (disabled provider, missing key) aborts the pass.
pub async fn embed_books(
    pool: &SqlitePool,
    provider: &dyn EmbeddingProvider,
    config: &EmbeddingConfig,
    limit: Option<usize>,
) -> Result<EmbedReport> {
    let model = provider.model_name().to_string();
    let pending = find_pending(pool, &model, limit).await?;

    let mut report = EmbedReport {
        total: pending.len() as u64,
        ..EmbedReport::default()
    };
    if pending.is_empty() {
        return Ok(report);
    }

    tracing::info!(books = pending.len(), model = %model, "embedding books");

    for batch in pending.chunks(config.batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();

        match provider.embed(&texts).await {
            Ok(vectors) if vectors.len() == batch.len() => {
                for (item, vec) in batch.iter().zip(vectors.iter()) {
                    upsert_embedding(pool, &item.book_id, &model, &item.text_hash, vec).await?;
                    report.embedded += 1;
                }
            }
            Ok(vectors) => {
                tracing::warn!(
                    expected = batch.len(),
                    got = vectors.len(),
                    "embedding batch returned wrong number of vectors"
                );
                report.failed += batch.len() as u64;
            }
            Err(e) if matches!(e.downcast_ref::<ShelfError>(), Some(ShelfError::Config(_))) => {
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(error = %e, "embedding batch failed");
                report.failed += batch.len() as u64;
            }
        }
    }

    Ok(report)
}

/// All stored vectors for `model`, as `(book_id, vector)` in book order.
pub async fn load_embeddings(pool: &SqlitePool, model: &str) -> Result<Vec<(String, Vec<f32>)>> {
    let rows = sqlx::query(&format!(
        "SELECT e.book_id, e.vector FROM book_embeddings e \
         JOIN books ON books.id = e.book_id \
         WHERE e.model = ? ORDER BY {}",
        BOOK_ORDER
            .split(", ")
            .map(|c| format!("books.{}", c))
            .collect::<Vec<_>>()
            .join(", ")
    ))
    .bind(model)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|r| {
            let blob: Vec<u8> = r.get("vector");
            (r.get("book_id"), blob_to_vec(&blob))
        })
        .collect())
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmbeddingStats {
    pub provider: String,
    pub model: Option<String>,
    pub total_books: i64,
    pub embedded_books: i64,
    pub embedding_rate: f64,
}

pub async fn embedding_stats(pool: &SqlitePool, config: &EmbeddingConfig) -> Result<EmbeddingStats> {
    let total_books: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM books")
        .fetch_one(pool)
        .await?;
    let embedded_books: i64 = match &config.model {
        Some(model) => sqlx::query_scalar("SELECT COUNT(*) FROM book_embeddings WHERE model = ?")
            .bind(model)
            .fetch_one(pool)
            .await?,
        None => sqlx::query_scalar("SELECT COUNT(*) FROM book_embeddings")
            .fetch_one(pool)
            .await?,
    };

    Ok(EmbeddingStats {
        provider: config.provider.clone(),
        model: config.model.clone(),
        total_books,
        embedded_books,
        embedding_rate: percent(embedded_books, total_books),
    })
}

pub async fn run_embed(config: &Config, limit: Option<usize>) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!(ShelfError::config(
            "embedding provider is disabled; set [embedding] provider in config"
        ));
    }

    let provider = create_provider(&config.embedding)?;
    let pool = db::connect(config).await?;

    let report = embed_books(&pool, provider.as_ref(), &config.embedding, limit).await?;

    println!("embed");
    if report.total == 0 {
        println!("  all books up to date");
    } else {
        println!("  pending: {}", report.total);
        println!("  embedded: {}", report.embedded);
        println!("  failed: {}", report.failed);
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::fixtures::book;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn book_text_skips_missing_fields() {
        let mut b = book("1", "Dune", "Frank Herbert", Some(5));
        b.genres = Some("Science fiction".to_string());
        b.year_published = Some(1965);
        b.my_review = Some(String::new());
        assert_eq!(
            book_text(&b),
            "Title: Dune | Author: Frank Herbert | Genres: Science fiction | Year: 1965"
        );
    }

    #[test]
    fn openai_response_is_reordered_by_index() {
        let json = json!({"data": [
            {"index": 1, "embedding": [0.0, 1.0]},
            {"index": 0, "embedding": [1.0, 0.0]}
        ]});
        assert_eq!(
            parse_openai_response(&json).unwrap(),
            vec![vec![1.0, 0.0], vec![0.0, 1.0]]
        );
    }

    #[tokio::test]
    async fn disabled_provider_is_a_config_error() {
        let err = DisabledProvider.embed(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ShelfError>(),
            Some(ShelfError::Config(_))
        ));
    }
}
