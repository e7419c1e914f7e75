use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Safe to call repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Books: one row per distinct (title, author, date read)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS books (
            id TEXT PRIMARY KEY,
            dedup_key TEXT NOT NULL UNIQUE,
            source_id TEXT,
            title TEXT NOT NULL,
            author TEXT NOT NULL DEFAULT '',
            isbn TEXT,
            isbn13 TEXT,
            my_rating INTEGER,
            average_rating REAL,
            publisher TEXT,
            pages INTEGER,
            year_published INTEGER,
            original_publication_year INTEGER,
            date_read TEXT,
            date_added TEXT,
            bookshelves TEXT,
            my_review TEXT,
            description TEXT,
            subjects TEXT,
            genres TEXT,
            language TEXT,
            enriched_at INTEGER,
            cluster_id INTEGER,
            centroid_distance REAL,
            proj_x REAL,
            proj_y REAL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS book_embeddings (
            book_id TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            hash TEXT NOT NULL,
            vector BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (book_id) REFERENCES books(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS llm_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at INTEGER NOT NULL,
            kind TEXT NOT NULL,
            prompt TEXT NOT NULL,
            response TEXT NOT NULL,
            status TEXT NOT NULL,
            extra_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_books_cluster_id ON books(cluster_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_books_author ON books(author)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_llm_history_created_at ON llm_history(created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Drop every table and recreate the schema.
pub async fn reset(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;
    for table in ["book_embeddings", "llm_history", "books"] {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    apply(pool).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = Config::with_db_path(tmp.path().join("shelf.sqlite"));
        let pool = db::connect(&cfg).await.unwrap();

        apply(&pool).await.unwrap();
        apply(&pool).await.unwrap();

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' \
             AND name IN ('books', 'book_embeddings', 'llm_history')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 3);
    }

    #[tokio::test]
    async fn reset_empties_tables() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = Config::with_db_path(tmp.path().join("shelf.sqlite"));
        let pool = db::connect(&cfg).await.unwrap();
        apply(&pool).await.unwrap();

        sqlx::query(
            "INSERT INTO llm_history (created_at, kind, prompt, response, status) \
             VALUES (0, 'insights', 'p', 'r', 'success')",
        )
        .execute(&pool)
        .await
        .unwrap();

        reset(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM llm_history")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
