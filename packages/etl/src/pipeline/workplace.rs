//! Workplace-type classification domain.
//!
//! First LLM-backed enrichment: each record's title, company, location
//! context, and (truncated) description go to a chat-completion batch that
//! returns REMOTE/HYBRID/ONSITE plus an inferred flag and a confidence
//! grade.

use anyhow::Result;
use async_trait::async_trait;
use openai_client::BatchRequestLine;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::domains::jobs::models::job::{self, JobRequestData};
use crate::domains::jobs::JobStatus;

use super::domain::{correlation_token, location_context, DomainSpec};
use super::generate::chunk_and_queue;
use super::results::{chat_content, EscalationPolicy, InvalidOutput, ResultApplicator};
use super::{Stage, StageContext};

pub static WORKPLACE: DomainSpec = DomainSpec {
    name: "workplace",
    batch_table: "workplace_batches",
    endpoint: "/v1/chat/completions",
    chunk_size: 25_000,
    batch_subdir: "llmbatch",
    result_subdir: "llmresult",
    artifact_prefix: "workplace_batch",
    result_prefix: "workplace_results",
    error_prefix: "workplace_errors",
};

const CHAT_MODEL: &str = "gpt-5-nano";
const MAX_COMPLETION_TOKENS: u32 = 2_000;
const DESCRIPTION_MAX_LENGTH: usize = 2_000;

/// Longest value accepted for the classifier's enum-ish string fields.
const FIELD_MAX: usize = 20;

const SYSTEM_PROMPT: &str = r#"You are a workplace type classifier. Analyze the job posting and determine the workplace type.

Respond with ONLY a JSON object in this format:
{"type":"REMOTE|HYBRID|ONSITE","inferred":true|false,"confidence":"EXPLICIT|LIKELY|PROBABLY|GUESS"}

- type: REMOTE, HYBRID, or ONSITE
- inferred: true if the workplace type is not explicitly stated, false if it is clearly stated
- confidence: EXPLICIT if clearly stated, LIKELY if strong indicators, PROBABLY if moderate indicators, GUESS if weak indicators"#;

/// Build the chat request line for one record.
pub fn build_request(job: &JobRequestData) -> BatchRequestLine {
    let mut description = job
        .job_description
        .clone()
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| "No description provided".to_string());
    if description.chars().count() > DESCRIPTION_MAX_LENGTH {
        description = description.chars().take(DESCRIPTION_MAX_LENGTH).collect();
        description.push_str("...");
    }

    let user_message = format!(
        "Title: {}\nCompany: {}\nLocation: {}\nDescription: {}",
        job.job_title.as_deref().unwrap_or("Not specified"),
        job.company_name.as_deref().unwrap_or("Not specified"),
        location_context(job),
        description
    );

    BatchRequestLine::new(
        correlation_token(job.id),
        WORKPLACE.endpoint,
        json!({
            "model": CHAT_MODEL,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": user_message},
            ],
            "max_completion_tokens": MAX_COMPLETION_TOKENS,
            "response_format": {"type": "json_object"},
        }),
    )
}

pub struct WorkplaceGenerateStage;

#[async_trait]
impl Stage for WorkplaceGenerateStage {
    fn name(&self) -> &'static str {
        "llm-batch"
    }

    async fn run(&self, ctx: &StageContext) -> Result<()> {
        let file_ids =
            job::files_with_pending_work(JobStatus::Ingested, "generated_workplace", &ctx.pool)
                .await?;
        if file_ids.is_empty() {
            info!("no records awaiting workplace classification");
            return Ok(());
        }

        info!(files = file_ids.len(), "generating workplace batches");
        let paths = ctx.config.paths();

        for file_id in file_ids {
            let jobs = JobRequestData::needing_workplace(file_id, &ctx.pool).await?;
            if jobs.is_empty() {
                continue;
            }

            let requests = jobs
                .iter()
                .map(|job| (job.id, build_request(job)))
                .collect();
            chunk_and_queue(
                &WORKPLACE,
                Some(file_id),
                requests,
                JobStatus::Ingested,
                JobStatus::LlmBatchesGenerated,
                &paths,
                &ctx.pool,
            )
            .await?;
        }

        Ok(())
    }
}

/// Parsed classifier output.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkplaceClassification {
    #[serde(rename = "type")]
    pub workplace_type: String,
    pub inferred: bool,
    pub confidence: String,
}

pub struct WorkplaceApplicator;

#[async_trait]
impl ResultApplicator for WorkplaceApplicator {
    type Update = WorkplaceClassification;

    fn spec(&self) -> &'static DomainSpec {
        &WORKPLACE
    }

    fn parse_body(&self, body: &serde_json::Value) -> Result<Self::Update, InvalidOutput> {
        let content = chat_content(body)?;
        let classification: WorkplaceClassification =
            serde_json::from_str(content).map_err(|e| InvalidOutput::Malformed(e.to_string()))?;

        if classification.workplace_type.len() > FIELD_MAX {
            return Err(InvalidOutput::FieldTooLong {
                field: "type",
                max: FIELD_MAX,
            });
        }
        if classification.confidence.len() > FIELD_MAX {
            return Err(InvalidOutput::FieldTooLong {
                field: "confidence",
                max: FIELD_MAX,
            });
        }
        Ok(classification)
    }

    async fn flush(&self, updates: &[(Uuid, Self::Update)], pool: &PgPool) -> Result<u64> {
        let ids: Vec<Uuid> = updates.iter().map(|(id, _)| *id).collect();
        let types: Vec<&str> = updates
            .iter()
            .map(|(_, u)| u.workplace_type.as_str())
            .collect();
        let inferred: Vec<bool> = updates.iter().map(|(_, u)| u.inferred).collect();
        let confidence: Vec<&str> = updates.iter().map(|(_, u)| u.confidence.as_str()).collect();

        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                generated_workplace = u.workplace,
                generated_workplace_inferred = u.inferred,
                generated_workplace_confidence = u.confidence,
                status = $5,
                status_change_date = NOW()
            FROM UNNEST($1::uuid[], $2::text[], $3::bool[], $4::text[])
                AS u(id, workplace, inferred, confidence)
            WHERE jobs.id = u.id AND jobs.status = $6
            "#,
        )
        .bind(&ids)
        .bind(&types)
        .bind(&inferred)
        .bind(&confidence)
        .bind(JobStatus::WorkplaceClassified)
        .bind(JobStatus::LlmBatchesGenerated)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn escalate(&self, job_ids: &[Uuid], pool: &PgPool) -> Result<u64> {
        ESCALATION.apply(job_ids, pool).await
    }
}

const ESCALATION: EscalationPolicy = EscalationPolicy {
    retry_column: "llm_workplace_retry_count",
    queued_status: JobStatus::LlmBatchesGenerated,
    entry_status: JobStatus::Ingested,
    failed_status: JobStatus::FailedWorkplaceGeneration,
    max_attempts: EscalationPolicy::MAX_ATTEMPTS,
};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_job(description_len: usize) -> JobRequestData {
        JobRequestData {
            id: Uuid::new_v4(),
            job_title: Some("Backend Engineer".to_string()),
            company_name: Some("Acme".to_string()),
            locality: Some("Denver".to_string()),
            region: Some("CO".to_string()),
            country: Some("US".to_string()),
            location: None,
            job_description: Some("x".repeat(description_len)),
        }
    }

    #[test]
    fn request_carries_the_correlation_token() {
        let job = sample_job(10);
        let line = build_request(&job);

        assert_eq!(line.custom_id, format!("job_{}", job.id));
        assert_eq!(line.url, "/v1/chat/completions");
        assert_eq!(line.body["model"], CHAT_MODEL);
        assert_eq!(line.body["response_format"]["type"], "json_object");
    }

    #[test]
    fn long_descriptions_are_truncated_in_the_prompt() {
        let job = sample_job(10_000);
        let line = build_request(&job);

        let user = line.body["messages"][1]["content"].as_str().unwrap();
        assert!(user.contains("..."));
        assert!(user.len() < 3_000);
    }

    #[test]
    fn parse_body_accepts_a_valid_classification() {
        let body = json!({
            "choices": [{"message": {"content":
                "{\"type\":\"REMOTE\",\"inferred\":false,\"confidence\":\"EXPLICIT\"}"}}]
        });

        let parsed = WorkplaceApplicator.parse_body(&body).unwrap();
        assert_eq!(parsed.workplace_type, "REMOTE");
        assert!(!parsed.inferred);
        assert_eq!(parsed.confidence, "EXPLICIT");
    }

    #[test]
    fn parse_body_rejects_empty_and_malformed_content() {
        let empty = json!({"choices": [{"message": {"content": ""}}]});
        assert!(matches!(
            WorkplaceApplicator.parse_body(&empty),
            Err(InvalidOutput::EmptyContent)
        ));

        let malformed = json!({"choices": [{"message": {"content": "REMOTE"}}]});
        assert!(matches!(
            WorkplaceApplicator.parse_body(&malformed),
            Err(InvalidOutput::Malformed(_))
        ));
    }

    #[test]
    fn parse_body_rejects_oversized_fields() {
        let body = json!({
            "choices": [{"message": {"content": format!(
                "{{\"type\":\"{}\",\"inferred\":true,\"confidence\":\"GUESS\"}}",
                "X".repeat(40)
            )}}]
        });

        assert!(matches!(
            WorkplaceApplicator.parse_body(&body),
            Err(InvalidOutput::FieldTooLong { field: "type", .. })
        ));
    }
}
