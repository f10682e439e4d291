//! Batch artifact generation.
//!
//! Eligible records are grouped into fixed-size chunks; each chunk becomes
//! one newline-delimited request artifact on disk plus one `pending`
//! tracking row. The tracking row and the records' status advance commit in
//! a single transaction, so a re-run never re-queues records that already
//! made it into a chunk. A crash between the file write and the commit
//! leaves an orphan artifact that no tracking row references; it is never
//! submitted.

use std::path::Path;

use anyhow::{Context, Result};
use openai_client::BatchRequestLine;
use sqlx::PgPool;
use tokio::io::AsyncWriteExt;
use tracing::info;
use uuid::Uuid;

use crate::config::DataPaths;
use crate::domains::batches::EnrichmentBatch;
use crate::domains::jobs::models::job;
use crate::domains::jobs::JobStatus;

use super::domain::DomainSpec;

/// Write one artifact: one serialized request per line.
pub async fn write_artifact(path: &Path, lines: &[BatchRequestLine]) -> Result<()> {
    let file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed to create artifact {}", path.display()))?;
    let mut writer = tokio::io::BufWriter::new(file);

    for line in lines {
        let json = serde_json::to_string(line)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }

    writer.flush().await?;
    Ok(())
}

/// Persist one generated chunk: artifact on disk, then tracking row +
/// record status flip in one transaction.
pub async fn queue_chunk(
    spec: &'static DomainSpec,
    file_id: Option<Uuid>,
    chunk: &[(Uuid, BatchRequestLine)],
    entry: JobStatus,
    queued: JobStatus,
    paths: &DataPaths,
    pool: &PgPool,
) -> Result<()> {
    let batch_id = Uuid::new_v4();
    let filename = spec.artifact_filename(file_id, batch_id);
    let path = spec.batch_dir(paths).join(&filename);

    let lines: Vec<BatchRequestLine> = chunk.iter().map(|(_, line)| line.clone()).collect();
    write_artifact(&path, &lines).await?;

    let job_ids: Vec<Uuid> = chunk.iter().map(|(id, _)| *id).collect();

    let mut tx = pool.begin().await?;
    EnrichmentBatch::insert(
        spec.batch_table,
        batch_id,
        file_id,
        path.to_string_lossy().as_ref(),
        &mut *tx,
    )
    .await?;
    let queued_count = job::mark_queued(&job_ids, entry, queued, &mut *tx).await?;
    tx.commit().await?;

    info!(
        domain = spec.name,
        artifact = %filename,
        records = chunk.len(),
        queued = queued_count,
        "generated batch artifact"
    );
    Ok(())
}

/// Chunk a full set of requests and queue every chunk.
pub async fn chunk_and_queue(
    spec: &'static DomainSpec,
    file_id: Option<Uuid>,
    requests: Vec<(Uuid, BatchRequestLine)>,
    entry: JobStatus,
    queued: JobStatus,
    paths: &DataPaths,
    pool: &PgPool,
) -> Result<usize> {
    if requests.is_empty() {
        return Ok(0);
    }

    tokio::fs::create_dir_all(spec.batch_dir(paths)).await?;

    let mut artifacts = 0;
    for chunk in requests.chunks(spec.chunk_size) {
        queue_chunk(spec, file_id, chunk, entry, queued, paths, pool).await?;
        artifacts += 1;
    }
    Ok(artifacts)
}
