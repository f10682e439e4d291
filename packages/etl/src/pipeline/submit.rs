//! Batch submission.
//!
//! Uploads pending artifacts and creates remote batches under a per-domain
//! in-flight cap. The cap is enforced by counting tracking rows at
//! `submitted`; two pipeline instances racing can transiently exceed it,
//! which the remote quota tolerates. Before uploading, the remote batch list
//! is consulted by artifact filename so a crash after remote creation but
//! before local persistence never produces a second remote batch.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use openai_client::BatchObject;
use tracing::{info, warn};

use crate::domains::batches::{BatchStatus, EnrichmentBatch};

use super::domain::DomainSpec;
use super::{Stage, StageContext};

pub struct SubmitStage {
    stage_name: &'static str,
    spec: &'static DomainSpec,
}

impl SubmitStage {
    pub fn new(stage_name: &'static str, spec: &'static DomainSpec) -> Self {
        Self { stage_name, spec }
    }

    async fn submit_one(&self, ctx: &StageContext, batch: &EnrichmentBatch) -> Result<()> {
        let filename = batch.artifact_filename().to_string();

        let contents = tokio::fs::read(&batch.batch_file_path)
            .await
            .with_context(|| format!("failed to read artifact {}", batch.batch_file_path))?;

        let file = ctx.client.upload_batch_file(&filename, contents).await?;
        let remote = ctx
            .client
            .create_batch(&file.id, self.spec.endpoint, Some(&filename))
            .await?;

        EnrichmentBatch::mark_submitted(
            self.spec.batch_table,
            batch.id,
            &file.id,
            &remote.id,
            &ctx.pool,
        )
        .await?;

        remove_artifact(&batch.batch_file_path).await;

        info!(
            domain = self.spec.name,
            batch_id = %batch.id,
            remote_batch = %remote.id,
            artifact = %filename,
            "submitted batch"
        );
        Ok(())
    }

    /// A pending artifact already present remotely (crash after remote
    /// creation, before local persistence): record the existing handles
    /// instead of creating a duplicate.
    async fn adopt_existing(
        &self,
        ctx: &StageContext,
        batch: &EnrichmentBatch,
        remote: &BatchObject,
    ) -> Result<()> {
        EnrichmentBatch::mark_submitted(
            self.spec.batch_table,
            batch.id,
            remote.input_file_id.as_deref().unwrap_or_default(),
            &remote.id,
            &ctx.pool,
        )
        .await?;

        remove_artifact(&batch.batch_file_path).await;

        info!(
            domain = self.spec.name,
            batch_id = %batch.id,
            remote_batch = %remote.id,
            "batch already exists remotely; adopted"
        );
        Ok(())
    }
}

#[async_trait]
impl Stage for SubmitStage {
    fn name(&self) -> &'static str {
        self.stage_name
    }

    async fn run(&self, ctx: &StageContext) -> Result<()> {
        let table = self.spec.batch_table;
        let cap = ctx.config.batches_in_flight(self.spec.name);

        let in_flight =
            EnrichmentBatch::count_in_status(table, BatchStatus::Submitted, &ctx.pool).await?;
        info!(
            domain = self.spec.name,
            in_flight, cap, "checking submission capacity"
        );

        if in_flight >= cap {
            info!(domain = self.spec.name, "in-flight cap reached; skipping submission");
            return Ok(());
        }

        let pending = EnrichmentBatch::find_pending(table, cap - in_flight, &ctx.pool).await?;
        if pending.is_empty() {
            info!(domain = self.spec.name, "no pending batches to submit");
            return Ok(());
        }

        // One listing serves every pending artifact's duplicate check.
        let remote_by_filename: HashMap<String, BatchObject> = ctx
            .client
            .list_batches()
            .await?
            .into_iter()
            .filter_map(|b| {
                let description = b.description().map(str::to_string);
                description.map(|d| (d, b))
            })
            .collect();

        for batch in &pending {
            let filename = batch.artifact_filename().to_string();

            let outcome = match remote_by_filename.get(&filename) {
                Some(remote) => self.adopt_existing(ctx, batch, remote).await,
                None => self.submit_one(ctx, batch).await,
            };

            // One bad submission must not block the rest.
            if let Err(error) = outcome {
                warn!(
                    domain = self.spec.name,
                    batch_id = %batch.id,
                    error = %error,
                    "batch submission failed"
                );
                EnrichmentBatch::mark_terminal(
                    table,
                    batch.id,
                    BatchStatus::Failed,
                    &error.to_string(),
                    &ctx.pool,
                )
                .await?;
            }
        }

        Ok(())
    }
}

async fn remove_artifact(path: &str) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!(path, error = %error, "failed to delete local artifact");
        }
    }
}
