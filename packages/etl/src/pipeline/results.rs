//! Result application.
//!
//! Streams downloaded batch output files, resolves each line back to its
//! record via the correlation token, and applies validated enrichments in
//! set-based pages. Two passes per file: the first collects correlation ids
//! so a single bulk lookup establishes which records exist, the second
//! applies. The per-line loop never issues one query per record.
//!
//! A line that fails to parse, resolves to no known record, or carries a
//! per-request error never aborts the file; failed records are routed to
//! the escalation policy. Only a persistently failing database flush
//! abandons the file (left in place for the next invocation).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use sqlx::PgPool;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domains::jobs::models::job;
use crate::domains::jobs::JobStatus;

use super::domain::{parse_correlation_token, DomainSpec};
use super::retry::STORAGE_RETRY;
use super::{Stage, StageContext};

/// Page size for the bulk known-id lookup.
const ID_LOOKUP_PAGE: usize = 50_000;

/// A successful response body that fails domain validation; the record is
/// escalated instead of receiving a partial enrichment.
#[derive(Debug, thiserror::Error)]
pub enum InvalidOutput {
    /// Observed when the upstream model hits its output-length limit
    #[error("empty response content")]
    EmptyContent,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("{field} is longer than {max} characters")]
    FieldTooLong { field: &'static str, max: usize },

    #[error("embedding has {0} dimensions")]
    WrongDimensions(usize),
}

/// One line of a result file, resolved to its record.
#[derive(Debug)]
pub enum LineOutcome {
    /// The request succeeded; `body` is the endpoint response body.
    Success { job_id: Uuid, body: serde_json::Value },
    /// The request itself failed (error object or non-200 status).
    Failure { job_id: Uuid, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum LineError {
    #[error("unparseable result line: {0}")]
    Unparseable(#[from] serde_json::Error),

    #[error("unresolvable correlation token: {0:?}")]
    BadToken(String),

    #[error("result line has no response body")]
    MissingBody,
}

#[derive(Debug, Deserialize)]
struct RawResultLine {
    custom_id: String,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    response: Option<RawResponse>,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(default)]
    status_code: Option<i64>,
    #[serde(default)]
    body: Option<serde_json::Value>,
}

/// Classify one result line.
pub fn parse_result_line(line: &str) -> Result<LineOutcome, LineError> {
    let raw: RawResultLine = serde_json::from_str(line)?;

    let job_id = parse_correlation_token(&raw.custom_id)
        .ok_or_else(|| LineError::BadToken(raw.custom_id.clone()))?;

    if let Some(error) = raw.error.filter(|e| !e.is_null()) {
        let reason = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("request error")
            .to_string();
        return Ok(LineOutcome::Failure { job_id, reason });
    }

    let response = raw.response.ok_or(LineError::MissingBody)?;
    if let Some(status_code) = response.status_code {
        if status_code != 200 {
            return Ok(LineOutcome::Failure {
                job_id,
                reason: format!("status {status_code}"),
            });
        }
    }

    let body = response.body.ok_or(LineError::MissingBody)?;
    Ok(LineOutcome::Success { job_id, body })
}

/// Extract the assistant message content from a chat-completion body.
pub fn chat_content(body: &serde_json::Value) -> Result<&str, InvalidOutput> {
    let content = body
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| InvalidOutput::Malformed("no message content".to_string()))?;

    if content.trim().is_empty() {
        return Err(InvalidOutput::EmptyContent);
    }
    Ok(content)
}

/// Per-domain half of the results applicator: payload parsing/validation,
/// the set-based field writer, and the escalation route.
#[async_trait]
pub trait ResultApplicator: Send + Sync {
    type Update: Send + Sync;

    fn spec(&self) -> &'static DomainSpec;

    /// Parse and validate a successful response body. An error routes the
    /// record to escalation instead.
    fn parse_body(&self, body: &serde_json::Value) -> Result<Self::Update, InvalidOutput>;

    /// Apply a page of validated updates, guarded on the domain's queued
    /// status so re-processing never double-applies.
    async fn flush(&self, updates: &[(Uuid, Self::Update)], pool: &PgPool) -> Result<u64>;

    /// Route a page of failed records to the domain's retry/escalation
    /// policy.
    async fn escalate(&self, job_ids: &[Uuid], pool: &PgPool) -> Result<u64>;

    /// Updates held in memory before a flush.
    fn flush_size(&self) -> usize {
        5_000
    }
}

#[derive(Debug, Default)]
pub struct FileStats {
    pub applied: u64,
    pub escalated: u64,
    pub errors: u64,
}

async fn read_lines(path: &Path) -> Result<tokio::io::Lines<tokio::io::BufReader<tokio::fs::File>>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(tokio::io::BufReader::new(file).lines())
}

/// First pass: every correlation id the file mentions.
async fn collect_ids(path: &Path) -> Result<Vec<Uuid>> {
    let mut ids = Vec::new();
    let mut lines = read_lines(path).await?;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match parse_result_line(&line) {
            Ok(LineOutcome::Success { job_id, .. }) | Ok(LineOutcome::Failure { job_id, .. }) => {
                ids.push(job_id)
            }
            // Counted in the second pass.
            Err(_) => {}
        }
    }
    Ok(ids)
}

async fn known_id_set(ids: &[Uuid], pool: &PgPool) -> Result<HashSet<Uuid>> {
    let mut known = HashSet::with_capacity(ids.len());
    for page in ids.chunks(ID_LOOKUP_PAGE) {
        known.extend(job::known_ids(page, pool).await?);
    }
    Ok(known)
}

/// Apply one downloaded result file.
pub async fn process_result_file<A: ResultApplicator>(
    applicator: &A,
    path: &Path,
    pool: &PgPool,
) -> Result<FileStats> {
    let ids = collect_ids(path).await?;
    let known = known_id_set(&ids, pool).await?;
    debug!(
        domain = applicator.spec().name,
        lines = ids.len(),
        known = known.len(),
        "bulk-resolved correlation ids"
    );

    let mut stats = FileStats::default();
    let mut updates: Vec<(Uuid, A::Update)> = Vec::new();
    let mut escalations: Vec<Uuid> = Vec::new();
    let mut line_number = 0u64;

    let mut lines = read_lines(path).await?;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        match parse_result_line(&line) {
            Ok(LineOutcome::Success { job_id, body }) => {
                if !known.contains(&job_id) {
                    warn!(line = line_number, %job_id, "result for unknown record");
                    stats.errors += 1;
                    continue;
                }
                match applicator.parse_body(&body) {
                    Ok(update) => updates.push((job_id, update)),
                    Err(invalid) => {
                        debug!(line = line_number, %job_id, error = %invalid, "invalid output; escalating");
                        escalations.push(job_id);
                    }
                }
            }
            Ok(LineOutcome::Failure { job_id, reason }) => {
                if !known.contains(&job_id) {
                    warn!(line = line_number, %job_id, "error for unknown record");
                    stats.errors += 1;
                    continue;
                }
                debug!(line = line_number, %job_id, %reason, "request failed; escalating");
                escalations.push(job_id);
            }
            Err(error) => {
                warn!(line = line_number, error = %error, "skipping result line");
                stats.errors += 1;
            }
        }

        if updates.len() >= applicator.flush_size() {
            stats.applied += flush_with_retry(applicator, &updates, pool).await?;
            updates.clear();
        }
        if escalations.len() >= applicator.flush_size() {
            stats.escalated += escalations.len() as u64;
            escalate_with_retry(applicator, &escalations, pool).await?;
            escalations.clear();
        }
    }

    if !updates.is_empty() {
        stats.applied += flush_with_retry(applicator, &updates, pool).await?;
    }
    if !escalations.is_empty() {
        stats.escalated += escalations.len() as u64;
        escalate_with_retry(applicator, &escalations, pool).await?;
    }

    Ok(stats)
}

async fn flush_with_retry<A: ResultApplicator>(
    applicator: &A,
    updates: &[(Uuid, A::Update)],
    pool: &PgPool,
) -> Result<u64> {
    STORAGE_RETRY
        .run("result flush", || applicator.flush(updates, pool))
        .await
}

async fn escalate_with_retry<A: ResultApplicator>(
    applicator: &A,
    job_ids: &[Uuid],
    pool: &PgPool,
) -> Result<u64> {
    STORAGE_RETRY
        .run("escalation flush", || applicator.escalate(job_ids, pool))
        .await
}

/// Apply one downloaded error file: every listed record escalates.
pub async fn process_error_file<A: ResultApplicator>(
    applicator: &A,
    path: &Path,
    pool: &PgPool,
) -> Result<FileStats> {
    let mut stats = FileStats::default();
    let mut escalations: Vec<Uuid> = Vec::new();
    let mut line_number = 0u64;

    let mut lines = read_lines(path).await?;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<RawResultLine>(&line) {
            Ok(raw) => match parse_correlation_token(&raw.custom_id) {
                Some(job_id) => escalations.push(job_id),
                None => {
                    warn!(line = line_number, custom_id = %raw.custom_id, "unresolvable token in error file");
                    stats.errors += 1;
                }
            },
            Err(error) => {
                warn!(line = line_number, error = %error, "skipping error line");
                stats.errors += 1;
            }
        }

        if escalations.len() >= applicator.flush_size() {
            stats.escalated += escalations.len() as u64;
            escalate_with_retry(applicator, &escalations, pool).await?;
            escalations.clear();
        }
    }

    if !escalations.is_empty() {
        stats.escalated += escalations.len() as u64;
        escalate_with_retry(applicator, &escalations, pool).await?;
    }

    Ok(stats)
}

/// The generic results stage: drain result files then error files from the
/// domain's result folder, deleting each file once fully applied.
pub struct ResultsStage<A> {
    stage_name: &'static str,
    applicator: A,
}

impl<A: ResultApplicator> ResultsStage<A> {
    pub fn new(stage_name: &'static str, applicator: A) -> Self {
        Self {
            stage_name,
            applicator,
        }
    }
}

#[async_trait]
impl<A: ResultApplicator> Stage for ResultsStage<A> {
    fn name(&self) -> &'static str {
        self.stage_name
    }

    async fn run(&self, ctx: &StageContext) -> Result<()> {
        let spec = self.applicator.spec();
        let result_dir = spec.result_dir(&ctx.config.paths());
        tokio::fs::create_dir_all(&result_dir).await?;

        let result_files = list_files(&result_dir, spec.result_prefix).await?;
        let error_files = list_files(&result_dir, spec.error_prefix).await?;

        if result_files.is_empty() && error_files.is_empty() {
            info!(domain = spec.name, "no result or error files to process");
            return Ok(());
        }

        for path in &result_files {
            let stats = process_result_file(&self.applicator, path, &ctx.pool)
                .await
                .with_context(|| format!("failed to process {}", path.display()))?;

            tokio::fs::remove_file(path).await?;
            info!(
                domain = spec.name,
                file = %path.display(),
                applied = stats.applied,
                escalated = stats.escalated,
                errors = stats.errors,
                "applied result file"
            );
        }

        for path in &error_files {
            let stats = process_error_file(&self.applicator, path, &ctx.pool)
                .await
                .with_context(|| format!("failed to process {}", path.display()))?;

            tokio::fs::remove_file(path).await?;
            info!(
                domain = spec.name,
                file = %path.display(),
                escalated = stats.escalated,
                errors = stats.errors,
                "applied error file"
            );
        }

        Ok(())
    }
}

async fn list_files(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(prefix) && name.ends_with(".jsonl") {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Shared rollback-or-fail policy for recoverable per-record failures.
///
/// Increments the domain's retry counter; below the threshold the record's
/// status resets to the domain's entry status (the one sanctioned rollback)
/// so the next pipeline pass regenerates a request for it. At the threshold
/// the record takes the domain's terminal failure status and is permanently
/// excluded via `is_valid = false`. Guarded on the queued status, so
/// re-processing a file cannot double-increment counters.
#[derive(Debug, Clone, Copy)]
pub struct EscalationPolicy {
    pub retry_column: &'static str,
    pub queued_status: JobStatus,
    pub entry_status: JobStatus,
    pub failed_status: JobStatus,
    pub max_attempts: i32,
}

impl EscalationPolicy {
    pub const MAX_ATTEMPTS: i32 = 3;

    pub async fn apply(&self, job_ids: &[Uuid], pool: &PgPool) -> Result<u64> {
        let sql = format!(
            "UPDATE jobs SET \
               {col} = {col} + 1, \
               status = CASE WHEN {col} + 1 >= $1 THEN $2 ELSE $3 END, \
               is_valid = CASE WHEN {col} + 1 >= $1 THEN FALSE ELSE is_valid END, \
               status_change_date = NOW() \
             WHERE id = ANY($4) AND status = $5",
            col = self.retry_column
        );

        let result = sqlx::query(&sql)
            .bind(self.max_attempts)
            .bind(self.failed_status)
            .bind(self.entry_status)
            .bind(job_ids)
            .bind(self.queued_status)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn success_line(job_id: Uuid, content: &str) -> String {
        json!({
            "custom_id": format!("job_{job_id}"),
            "response": {
                "status_code": 200,
                "body": {"choices": [{"message": {"content": content}}]}
            }
        })
        .to_string()
    }

    #[test]
    fn success_line_resolves_to_its_record() {
        let job_id = Uuid::new_v4();
        let outcome = parse_result_line(&success_line(job_id, "{}")).unwrap();

        match outcome {
            LineOutcome::Success { job_id: id, .. } => assert_eq!(id, job_id),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn error_object_is_a_failure() {
        let job_id = Uuid::new_v4();
        let line = json!({
            "custom_id": format!("job_{job_id}"),
            "error": {"message": "rate limited"}
        })
        .to_string();

        match parse_result_line(&line).unwrap() {
            LineOutcome::Failure { job_id: id, reason } => {
                assert_eq!(id, job_id);
                assert_eq!(reason, "rate limited");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn non_200_status_is_a_failure() {
        let job_id = Uuid::new_v4();
        let line = json!({
            "custom_id": format!("job_{job_id}"),
            "response": {"status_code": 500, "body": {}}
        })
        .to_string();

        assert!(matches!(
            parse_result_line(&line).unwrap(),
            LineOutcome::Failure { .. }
        ));
    }

    #[test]
    fn bad_token_is_a_line_error_not_a_panic() {
        let line = json!({
            "custom_id": "session_42",
            "response": {"status_code": 200, "body": {}}
        })
        .to_string();

        assert!(matches!(
            parse_result_line(&line),
            Err(LineError::BadToken(_))
        ));
    }

    #[test]
    fn unparseable_line_is_a_line_error() {
        assert!(matches!(
            parse_result_line("not json at all"),
            Err(LineError::Unparseable(_))
        ));
    }

    #[test]
    fn chat_content_rejects_empty_output() {
        let body = json!({"choices": [{"message": {"content": "   "}}]});
        assert!(matches!(
            chat_content(&body),
            Err(InvalidOutput::EmptyContent)
        ));

        let body = json!({"choices": []});
        assert!(matches!(chat_content(&body), Err(InvalidOutput::Malformed(_))));
    }

    #[test]
    fn chat_content_returns_the_message() {
        let body = json!({"choices": [{"message": {"content": "{\"ok\":true}"}}]});
        assert_eq!(chat_content(&body).unwrap(), "{\"ok\":true}");
    }
}
