//! Pipeline stages and orchestration.
//!
//! Each stage is a self-contained unit of work selected by record status;
//! the orchestrator only sequences them and stops at the first failure.
//! The three LLM-backed enrichment domains share the generic batch
//! lifecycle in `generate`/`submit`/`poll`/`results`, parameterized by the
//! `DomainSpec` values in `workplace`/`location`/`embedding`.

pub mod domain;
pub mod embedding;
pub mod generate;
pub mod geocode;
pub mod ingest;
pub mod location;
pub mod poll;
pub mod results;
pub mod retry;
pub mod submit;
pub mod workplace;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use openai_client::OpenAIClient;
use sqlx::PgPool;
use tracing::{info, Instrument};

use crate::config::Config;

use embedding::{EmbeddingApplicator, EmbeddingGenerateStage, EMBEDDING};
use geocode::GeocodeStage;
use ingest::IngestStage;
use location::{LocationApplicator, LocationGenerateStage, LOCATION};
use poll::PollStage;
use results::ResultsStage;
use submit::SubmitStage;
use workplace::{WorkplaceApplicator, WorkplaceGenerateStage, WORKPLACE};

/// Everything a stage needs, passed in at invocation rather than held as
/// process-global state.
pub struct StageContext {
    pub pool: PgPool,
    pub client: OpenAIClient,
    pub config: Config,
}

#[async_trait]
pub trait Stage: Send + Sync {
    /// CLI name of the stage.
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &StageContext) -> Result<()>;
}

/// The ordered stage registry.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// The full enrichment sequence in execution order.
    pub fn standard() -> Self {
        Self {
            stages: vec![
                Box::new(IngestStage),
                Box::new(WorkplaceGenerateStage),
                Box::new(SubmitStage::new("llm-submit", &WORKPLACE)),
                Box::new(PollStage::new("llm-check", &WORKPLACE)),
                Box::new(ResultsStage::new("llm-results", WorkplaceApplicator)),
                Box::new(LocationGenerateStage),
                Box::new(SubmitStage::new("location-submit", &LOCATION)),
                Box::new(PollStage::new("location-check", &LOCATION)),
                Box::new(ResultsStage::new("location-results", LocationApplicator)),
                Box::new(GeocodeStage),
                Box::new(EmbeddingGenerateStage),
                Box::new(SubmitStage::new("embedding-submit", &EMBEDDING)),
                Box::new(PollStage::new("embedding-check", &EMBEDDING)),
                Box::new(ResultsStage::new("embedding-results", EmbeddingApplicator)),
            ],
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run the named stages in the order given, or the full sequence when
    /// none are named. The first failing stage aborts the rest.
    pub async fn run(&self, ctx: &StageContext, names: &[String]) -> Result<()> {
        let selected: Vec<&dyn Stage> = if names.is_empty() {
            self.stages.iter().map(|s| s.as_ref()).collect()
        } else {
            let mut selected = Vec::with_capacity(names.len());
            for name in names {
                match self.stages.iter().find(|s| s.name() == name.as_str()) {
                    Some(stage) => selected.push(stage.as_ref()),
                    None => bail!(
                        "unknown stage '{}'; available stages: {}",
                        name,
                        self.stage_names().join(", ")
                    ),
                }
            }
            selected
        };

        for stage in selected {
            let span = tracing::info_span!("stage", name = stage.name());
            async {
                info!("stage starting");
                stage.run(ctx).await?;
                info!("stage complete");
                Ok::<(), anyhow::Error>(())
            }
            .instrument(span)
            .await
            .with_context(|| format!("stage '{}' failed", stage.name()))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_pipeline_runs_stages_in_enrichment_order() {
        let names = Pipeline::standard().stage_names();
        assert_eq!(
            names,
            vec![
                "ingest",
                "llm-batch",
                "llm-submit",
                "llm-check",
                "llm-results",
                "location-batch",
                "location-submit",
                "location-check",
                "location-results",
                "geocode",
                "embedding-batch",
                "embedding-submit",
                "embedding-check",
                "embedding-results",
            ]
        );
    }
}
