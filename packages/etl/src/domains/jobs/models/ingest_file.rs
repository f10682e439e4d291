use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// One row per ingested source file; owns the records it produced.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IngestFile {
    pub id: Uuid,
    pub filename: String,
    pub dateprocessed: Option<DateTime<Utc>>,
}

impl IngestFile {
    pub async fn create(filename: &str, pool: &PgPool) -> Result<Self> {
        let file = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO files (id, filename, dateprocessed)
            VALUES ($1, $2, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(filename)
        .fetch_one(pool)
        .await?;
        Ok(file)
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        let file = sqlx::query_as::<_, Self>("SELECT * FROM files WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(file)
    }
}
