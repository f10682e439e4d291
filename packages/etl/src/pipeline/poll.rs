//! Remote batch polling.
//!
//! Maps remote terminal states onto the tracking record and brings completed
//! results home. The tracking record only flips to `completed` after the
//! output (and error) artifacts are safely on local disk; a crash in between
//! re-downloads on the next poll, which is safe because result application
//! is status-gated per record.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::domains::batches::{BatchStatus, EnrichmentBatch};

use super::domain::DomainSpec;
use super::retry::DOWNLOAD_RETRY;
use super::{Stage, StageContext};

pub struct PollStage {
    stage_name: &'static str,
    spec: &'static DomainSpec,
}

impl PollStage {
    pub fn new(stage_name: &'static str, spec: &'static DomainSpec) -> Self {
        Self { stage_name, spec }
    }

    async fn handle_completed(
        &self,
        ctx: &StageContext,
        batch: &EnrichmentBatch,
        output_file_id: &str,
        error_file_id: Option<&str>,
    ) -> Result<()> {
        let result_dir = self.spec.result_dir(&ctx.config.paths());

        let output_path = result_dir.join(self.spec.result_filename(batch.id));
        download_with_retry(ctx, output_file_id, &output_path).await?;

        if let Some(error_file_id) = error_file_id {
            let error_path = result_dir.join(self.spec.error_filename(batch.id));
            download_with_retry(ctx, error_file_id, &error_path).await?;
        }

        EnrichmentBatch::mark_completed(self.spec.batch_table, batch.id, &ctx.pool).await?;

        info!(
            domain = self.spec.name,
            batch_id = %batch.id,
            result = %output_path.display(),
            "batch completed; results downloaded"
        );
        Ok(())
    }
}

#[async_trait]
impl Stage for PollStage {
    fn name(&self) -> &'static str {
        self.stage_name
    }

    async fn run(&self, ctx: &StageContext) -> Result<()> {
        let submitted = EnrichmentBatch::find_submitted(self.spec.batch_table, &ctx.pool).await?;
        if submitted.is_empty() {
            info!(domain = self.spec.name, "no submitted batches to check");
            return Ok(());
        }

        info!(
            domain = self.spec.name,
            count = submitted.len(),
            "checking submitted batches"
        );
        tokio::fs::create_dir_all(self.spec.result_dir(&ctx.config.paths())).await?;

        for batch in &submitted {
            let Some(remote_id) = batch.openai_batch_id.as_deref() else {
                warn!(batch_id = %batch.id, "submitted batch has no remote id");
                continue;
            };

            let remote = match ctx.client.retrieve_batch(remote_id).await {
                Ok(remote) => remote,
                // Might be a temporary network issue; the next poll retries.
                Err(error) => {
                    warn!(batch_id = %batch.id, error = %error, "batch status check failed");
                    continue;
                }
            };

            match remote.status.as_str() {
                "completed" => {
                    let Some(output_file_id) = remote.output_file_id.as_deref() else {
                        warn!(batch_id = %batch.id, "completed batch has no output file id");
                        continue;
                    };

                    if let Err(error) = self
                        .handle_completed(ctx, batch, output_file_id, remote.error_file_id.as_deref())
                        .await
                    {
                        warn!(batch_id = %batch.id, error = %error, "failed to collect results");
                    }
                }
                "failed" | "expired" | "cancelled" => {
                    // Remote terminal states pass through unchanged.
                    let status = match remote.status.as_str() {
                        "failed" => BatchStatus::Failed,
                        "expired" => BatchStatus::Expired,
                        _ => BatchStatus::Cancelled,
                    };
                    warn!(batch_id = %batch.id, status = %status, "batch ended without results");
                    EnrichmentBatch::mark_terminal(
                        self.spec.batch_table,
                        batch.id,
                        status,
                        &format!("Batch {}", remote.status),
                        &ctx.pool,
                    )
                    .await?;
                }
                "validating" | "in_progress" | "finalizing" | "cancelling" => {
                    debug!(batch_id = %batch.id, status = %remote.status, "batch still processing");
                }
                other => {
                    warn!(batch_id = %batch.id, status = other, "unknown remote batch status");
                }
            }
        }

        Ok(())
    }
}

async fn download_with_retry(ctx: &StageContext, file_id: &str, path: &Path) -> Result<()> {
    let contents = DOWNLOAD_RETRY
        .run("batch result download", || ctx.client.file_content(file_id))
        .await
        .with_context(|| format!("failed to download file {file_id}"))?;

    tokio::fs::write(path, &contents)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
