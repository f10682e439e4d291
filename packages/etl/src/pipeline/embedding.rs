//! Embedding generation domain.
//!
//! Terminal enrichment: valid US records get a 1536-dimension vector over
//! `title\n\ndescription`, written to the one-to-one embeddings table. This
//! domain is not file-scoped (candidates are selected globally in keyset
//! pages) and has no retry counter: a failed line simply rolls back to
//! `geocoded` so the next pass regenerates it.

use anyhow::Result;
use async_trait::async_trait;
use openai_client::BatchRequestLine;
use pgvector::Vector;
use serde_json::json;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::domains::jobs::models::job::EmbeddingCandidate;
use crate::domains::jobs::models::JobEmbedding;
use crate::domains::jobs::JobStatus;

use super::domain::{correlation_token, DomainSpec};
use super::generate::{chunk_and_queue, queue_chunk};
use super::results::{InvalidOutput, ResultApplicator};
use super::{Stage, StageContext};

pub static EMBEDDING: DomainSpec = DomainSpec {
    name: "embedding",
    batch_table: "embedding_batches",
    endpoint: "/v1/embeddings",
    chunk_size: 20_000,
    batch_subdir: "embeddingbatch",
    result_subdir: "embeddingresult",
    artifact_prefix: "embedding_batch",
    result_prefix: "embedding_results",
    error_prefix: "embedding_errors",
};

const EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Candidate rows loaded per query while accumulating a chunk.
const SELECT_PAGE: i64 = 10_000;

/// Roughly 8000 tokens for text-embedding-3-small at ~4 chars per token.
const MAX_INPUT_LENGTH: usize = 32_000;

/// Build the embedding request line for one record.
pub fn build_request(job: &EmbeddingCandidate) -> BatchRequestLine {
    let mut input = format!(
        "{}\n\n{}",
        job.job_title.as_deref().unwrap_or_default(),
        job.job_description.as_deref().unwrap_or_default()
    );
    if input.chars().count() > MAX_INPUT_LENGTH {
        input = input.chars().take(MAX_INPUT_LENGTH).collect();
    }

    BatchRequestLine::new(
        correlation_token(job.id),
        EMBEDDING.endpoint,
        json!({
            "model": EMBEDDING_MODEL,
            "input": input,
        }),
    )
}

pub struct EmbeddingGenerateStage;

#[async_trait]
impl Stage for EmbeddingGenerateStage {
    fn name(&self) -> &'static str {
        "embedding-batch"
    }

    async fn run(&self, ctx: &StageContext) -> Result<()> {
        let paths = ctx.config.paths();
        tokio::fs::create_dir_all(EMBEDDING.batch_dir(&paths)).await?;

        let mut after: Option<Uuid> = None;
        let mut pending: Vec<(Uuid, BatchRequestLine)> = Vec::new();
        let mut selected = 0u64;

        // Keyset pagination keeps memory bounded: at most one chunk plus one
        // page of requests is ever held.
        loop {
            let page = EmbeddingCandidate::page(after, SELECT_PAGE, &ctx.pool).await?;
            if page.is_empty() {
                break;
            }
            after = page.last().map(|c| c.id);
            selected += page.len() as u64;

            pending.extend(page.iter().map(|job| (job.id, build_request(job))));

            while pending.len() >= EMBEDDING.chunk_size {
                let chunk: Vec<_> = pending.drain(..EMBEDDING.chunk_size).collect();
                queue_chunk(
                    &EMBEDDING,
                    None,
                    &chunk,
                    JobStatus::Geocoded,
                    JobStatus::EmbeddingBatchesGenerated,
                    &paths,
                    &ctx.pool,
                )
                .await?;
            }
        }

        if selected == 0 {
            info!("no valid US records awaiting embeddings");
            return Ok(());
        }

        chunk_and_queue(
            &EMBEDDING,
            None,
            pending,
            JobStatus::Geocoded,
            JobStatus::EmbeddingBatchesGenerated,
            &paths,
            &ctx.pool,
        )
        .await?;

        info!(selected, "embedding batch generation complete");
        Ok(())
    }
}

pub struct EmbeddingApplicator;

#[async_trait]
impl ResultApplicator for EmbeddingApplicator {
    type Update = Vector;

    fn spec(&self) -> &'static DomainSpec {
        &EMBEDDING
    }

    fn parse_body(&self, body: &serde_json::Value) -> Result<Self::Update, InvalidOutput> {
        let values = body
            .pointer("/data/0/embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| InvalidOutput::Malformed("no embedding data".to_string()))?;

        let floats: Vec<f32> = values
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Option<_>>()
            .ok_or_else(|| InvalidOutput::Malformed("non-numeric embedding value".to_string()))?;

        if floats.len() != JobEmbedding::DIMENSIONS {
            return Err(InvalidOutput::WrongDimensions(floats.len()));
        }
        Ok(Vector::from(floats))
    }

    async fn flush(&self, updates: &[(Uuid, Self::Update)], pool: &PgPool) -> Result<u64> {
        let mut tx = pool.begin().await?;

        for (job_id, embedding) in updates {
            JobEmbedding::insert(*job_id, embedding.clone(), &mut *tx).await?;
        }

        // Status advances for every record in the page, including ones whose
        // vector already existed from a crashed earlier run.
        let ids: Vec<Uuid> = updates.iter().map(|(id, _)| *id).collect();
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = $1, status_change_date = NOW()
            WHERE id = ANY($2) AND status = $3
            "#,
        )
        .bind(JobStatus::Embedded)
        .bind(&ids)
        .bind(JobStatus::EmbeddingBatchesGenerated)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// No retry counter here: the record returns to `geocoded` and the next
    /// pipeline pass regenerates its request.
    async fn escalate(&self, job_ids: &[Uuid], pool: &PgPool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = $1, status_change_date = NOW()
            WHERE id = ANY($2) AND status = $3
            "#,
        )
        .bind(JobStatus::Geocoded)
        .bind(job_ids)
        .bind(JobStatus::EmbeddingBatchesGenerated)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    fn flush_size(&self) -> usize {
        1_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate(title: &str, description: &str) -> EmbeddingCandidate {
        EmbeddingCandidate {
            id: Uuid::new_v4(),
            job_title: Some(title.to_string()),
            job_description: Some(description.to_string()),
        }
    }

    #[test]
    fn request_combines_title_and_description() {
        let job = candidate("Platform Engineer", "Kubernetes all day.");
        let line = build_request(&job);

        assert_eq!(line.custom_id, format!("job_{}", job.id));
        assert_eq!(line.url, "/v1/embeddings");
        assert_eq!(line.body["model"], EMBEDDING_MODEL);
        assert_eq!(
            line.body["input"],
            "Platform Engineer\n\nKubernetes all day."
        );
    }

    #[test]
    fn oversized_input_is_truncated() {
        let job = candidate("Title", &"y".repeat(50_000));
        let line = build_request(&job);

        let input = line.body["input"].as_str().unwrap();
        assert_eq!(input.chars().count(), MAX_INPUT_LENGTH);
    }

    #[test]
    fn parse_body_accepts_a_full_width_vector() {
        let body = json!({"data": [{"embedding": vec![0.5f32; 1536]}]});
        let vector = EmbeddingApplicator.parse_body(&body).unwrap();
        assert_eq!(vector.as_slice().len(), 1536);
    }

    #[test]
    fn parse_body_rejects_wrong_width_and_missing_data() {
        let short = json!({"data": [{"embedding": vec![0.5f32; 3]}]});
        assert!(matches!(
            EmbeddingApplicator.parse_body(&short),
            Err(InvalidOutput::WrongDimensions(3))
        ));

        let missing = json!({"data": []});
        assert!(matches!(
            EmbeddingApplicator.parse_body(&missing),
            Err(InvalidOutput::Malformed(_))
        ));
    }
}
