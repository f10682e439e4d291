use pgvector::Vector;
use sqlx::Postgres;
use uuid::Uuid;

/// The 1536-dimension embedding owned one-to-one by a job record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobEmbedding {
    pub job_id: Uuid,
    pub embedding: Vector,
}

impl JobEmbedding {
    /// Expected vector width for text-embedding-3-small.
    pub const DIMENSIONS: usize = 1536;

    /// Insert an embedding; a record that already has one is left untouched.
    ///
    /// Returns whether a row was written, so callers can distinguish fresh
    /// work from a re-applied result file.
    pub async fn insert<'e, E>(job_id: Uuid, embedding: Vector, executor: E) -> Result<bool, sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let result = sqlx::query(
            r#"
            INSERT INTO job_embeddings (job_id, embedding)
            VALUES ($1, $2)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(embedding)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
