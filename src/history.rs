//! Persisted LLM round-trips.
//!
//! Every insight request is recorded, whether the model answered or the
//! call failed, so the prompt that was sent can always be inspected.

use anyhow::Result;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::ShelfError;
use crate::models::LlmHistoryEntry;

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";

pub async fn record(
    pool: &SqlitePool,
    kind: &str,
    prompt: &str,
    response: &str,
    status: &str,
    extra: &Value,
) -> Result<i64> {
    let now = chrono::Utc::now().timestamp();
    let id = sqlx::query(
        "INSERT INTO llm_history (created_at, kind, prompt, response, status, extra_json) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(now)
    .bind(kind)
    .bind(prompt)
    .bind(response)
    .bind(status)
    .bind(extra.to_string())
    .execute(pool)
    .await?
    .last_insert_rowid();

    Ok(id)
}

fn row_to_entry(row: &SqliteRow) -> LlmHistoryEntry {
    let extra: String = row.get("extra_json");
    LlmHistoryEntry {
        id: row.get("id"),
        created_at: row.get("created_at"),
        kind: row.get("kind"),
        prompt: row.get("prompt"),
        response: row.get("response"),
        status: row.get("status"),
        extra: serde_json::from_str(&extra).unwrap_or(Value::Null),
    }
}

/// Most recent first.
pub async fn list_history(pool: &SqlitePool, limit: usize) -> Result<Vec<LlmHistoryEntry>> {
    let rows = sqlx::query(
        "SELECT id, created_at, kind, prompt, response, status, extra_json \
         FROM llm_history ORDER BY created_at DESC, id DESC LIMIT ?",
    )
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(row_to_entry).collect())
}

pub async fn get_history(pool: &SqlitePool, id: i64) -> Result<LlmHistoryEntry> {
    let row = sqlx::query(
        "SELECT id, created_at, kind, prompt, response, status, extra_json \
         FROM llm_history WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(row_to_entry(&row)),
        None => Err(ShelfError::not_found(format!("history entry {}", id)).into()),
    }
}

/// `(status, count)` pairs, ordered by status.
pub async fn status_counts(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query(
        "SELECT status, COUNT(*) AS n FROM llm_history GROUP BY status ORDER BY status",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(|r| (r.get("status"), r.get("n"))).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::{db, migrate};
    use serde_json::json;

    #[tokio::test]
    async fn records_and_reads_back() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect(&Config::with_db_path(tmp.path().join("h.sqlite")))
            .await
            .unwrap();
        migrate::apply(&pool).await.unwrap();

        let first = record(&pool, "insights", "p1", "r1", STATUS_SUCCESS, &json!({"model": "fake"}))
            .await
            .unwrap();
        let second = record(&pool, "quick", "p2", "boom", STATUS_ERROR, &json!({}))
            .await
            .unwrap();

        let recent = list_history(&pool, 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, second);

        let entry = get_history(&pool, first).await.unwrap();
        assert_eq!(entry.kind, "insights");
        assert_eq!(entry.extra["model"], "fake");

        assert_eq!(
            status_counts(&pool).await.unwrap(),
            vec![("error".to_string(), 1), ("success".to_string(), 1)]
        );

        let err = get_history(&pool, 999).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ShelfError>(),
            Some(ShelfError::NotFound(_))
        ));
    }
}
