//! Location normalization domain.
//!
//! Normalizes free-form location strings into city / two-letter state /
//! two-letter country. The precomputed lookup cache is consulted first and
//! matched records skip batch generation entirely; only the remainder go to
//! the LLM. Non-US results permanently invalidate the record.

use anyhow::Result;
use async_trait::async_trait;
use openai_client::BatchRequestLine;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::domains::geo::LookupTable;
use crate::domains::jobs::models::job::{self, JobRequestData};
use crate::domains::jobs::JobStatus;

use super::domain::{correlation_token, location_context, DomainSpec};
use super::generate::chunk_and_queue;
use super::results::{chat_content, EscalationPolicy, InvalidOutput, ResultApplicator};
use super::{Stage, StageContext};

pub static LOCATION: DomainSpec = DomainSpec {
    name: "location",
    batch_table: "location_batches",
    endpoint: "/v1/chat/completions",
    chunk_size: 25_000,
    batch_subdir: "locationbatch",
    result_subdir: "locationresult",
    artifact_prefix: "location_batch",
    result_prefix: "location_results",
    error_prefix: "location_errors",
};

const CHAT_MODEL: &str = "gpt-5-nano";
const MAX_COMPLETION_TOKENS: u32 = 2_000;

/// Two-letter code fields must not exceed this.
const CODE_MAX: usize = 2;

/// Page size for applying lookup-cache matches.
const LOOKUP_APPLY_PAGE: usize = 5_000;

const SYSTEM_PROMPT: &str = r#"You are a location normalizer for US job postings. Extract the city, state, and country from the location string.

Respond with ONLY a JSON object in this format:
{"city":"CityName","state":"XX","country":"US"}

Rules:
- city: Extract the city name if present. For metro areas like "San Francisco Bay Area" or "Hampton Roads", extract the primary city (e.g., "San Francisco", "Norfolk"). Only set to null if truly vague like "Remote", "USA", or state-only.
- state: 2-letter state code (e.g., "CA", "TX", "NY", "DC"). Use "DC" for Washington D.C. Return null if not a US location.
- country: "US" for United States jobs, null otherwise.
- Handle common formats: "City, State", "City, ST", "City, State, USA"
- For Washington D.C., use city="Washington" and state="DC", not "WA"
- Extract city from localities, even if they include the state name (e.g., "Oklahoma City, Oklahoma" → city="Oklahoma City")
- Be generous in extraction - prefer extracting a city over returning null"#;

/// Build the chat request line for one record.
pub fn build_request(job: &JobRequestData) -> BatchRequestLine {
    BatchRequestLine::new(
        correlation_token(job.id),
        LOCATION.endpoint,
        json!({
            "model": CHAT_MODEL,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": format!("Location: {}", location_context(job))},
            ],
            "max_completion_tokens": MAX_COMPLETION_TOKENS,
            "response_format": {"type": "json_object"},
        }),
    )
}

pub struct LocationGenerateStage;

impl LocationGenerateStage {
    /// Write cache-matched normalizations directly; these records skip
    /// batch generation and move straight to `location_classified`.
    async fn apply_lookup_matches(
        matches: &[(Uuid, &crate::domains::geo::LocationLookup)],
        pool: &PgPool,
    ) -> Result<u64> {
        let mut applied = 0;
        for page in matches.chunks(LOOKUP_APPLY_PAGE) {
            let ids: Vec<Uuid> = page.iter().map(|(id, _)| *id).collect();
            let cities: Vec<Option<&str>> =
                page.iter().map(|(_, l)| l.city.as_deref()).collect();
            let states: Vec<Option<&str>> =
                page.iter().map(|(_, l)| l.state.as_deref()).collect();
            let countries: Vec<Option<&str>> =
                page.iter().map(|(_, l)| l.country.as_deref()).collect();

            let result = sqlx::query(
                r#"
                UPDATE jobs SET
                    generated_city = u.city,
                    generated_state = u.state,
                    generated_country = u.country,
                    status = $5,
                    status_change_date = NOW()
                FROM UNNEST($1::uuid[], $2::text[], $3::text[], $4::text[])
                    AS u(id, city, state, country)
                WHERE jobs.id = u.id AND jobs.status = $6 AND jobs.is_valid = TRUE
                "#,
            )
            .bind(&ids)
            .bind(&cities)
            .bind(&states)
            .bind(&countries)
            .bind(JobStatus::LocationClassified)
            .bind(JobStatus::WorkplaceClassified)
            .execute(pool)
            .await?;
            applied += result.rows_affected();
        }
        Ok(applied)
    }
}

#[async_trait]
impl Stage for LocationGenerateStage {
    fn name(&self) -> &'static str {
        "location-batch"
    }

    async fn run(&self, ctx: &StageContext) -> Result<()> {
        let lookups = LookupTable::load(&ctx.pool).await?;
        info!(entries = lookups.len(), "loaded location lookup cache");

        let file_ids = job::files_with_pending_work(
            JobStatus::WorkplaceClassified,
            "generated_city",
            &ctx.pool,
        )
        .await?;
        if file_ids.is_empty() {
            info!("no records awaiting location normalization");
            return Ok(());
        }

        info!(files = file_ids.len(), "generating location batches");
        let paths = ctx.config.paths();

        for file_id in file_ids {
            let jobs = JobRequestData::needing_location(file_id, &ctx.pool).await?;
            if jobs.is_empty() {
                continue;
            }

            let mut matched = Vec::new();
            let mut needs_llm = Vec::new();
            for job in &jobs {
                let hit = job
                    .location
                    .as_deref()
                    .filter(|l| !l.is_empty())
                    .and_then(|l| lookups.get(l));
                match hit {
                    Some(lookup) => matched.push((job.id, lookup)),
                    None => needs_llm.push((job.id, build_request(job))),
                }
            }

            if !matched.is_empty() {
                let applied = Self::apply_lookup_matches(&matched, &ctx.pool).await?;
                info!(%file_id, applied, "normalized records via lookup cache");
            }

            chunk_and_queue(
                &LOCATION,
                Some(file_id),
                needs_llm,
                JobStatus::WorkplaceClassified,
                JobStatus::LocationBatchesGenerated,
                &paths,
                &ctx.pool,
            )
            .await?;
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RawNormalization {
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    country: Option<String>,
}

/// Validated normalization plus the record's resulting state.
#[derive(Debug, Clone)]
pub struct LocationUpdate {
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub status: JobStatus,
    pub is_valid: bool,
}

pub struct LocationApplicator;

#[async_trait]
impl ResultApplicator for LocationApplicator {
    type Update = LocationUpdate;

    fn spec(&self) -> &'static DomainSpec {
        &LOCATION
    }

    fn parse_body(&self, body: &serde_json::Value) -> Result<Self::Update, InvalidOutput> {
        let content = chat_content(body)?;
        let raw: RawNormalization =
            serde_json::from_str(content).map_err(|e| InvalidOutput::Malformed(e.to_string()))?;

        let city = raw.city.filter(|c| !c.is_empty());

        let state = match raw.state.filter(|s| !s.is_empty()) {
            Some(state) if state.len() > CODE_MAX => {
                return Err(InvalidOutput::FieldTooLong {
                    field: "state",
                    max: CODE_MAX,
                })
            }
            other => other,
        };

        let country = match raw.country.filter(|c| !c.is_empty()) {
            Some(country) => {
                let country = if country.eq_ignore_ascii_case("USA") {
                    "US".to_string()
                } else {
                    country
                };
                if country.len() > CODE_MAX {
                    return Err(InvalidOutput::FieldTooLong {
                        field: "country",
                        max: CODE_MAX,
                    });
                }
                Some(country)
            }
            None => None,
        };

        // Anything the classifier cannot place in the US leaves the pipeline.
        let us = country
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case("US"));
        let (status, is_valid) = if us {
            (JobStatus::LocationClassified, true)
        } else {
            (JobStatus::InvalidNonUsLocation, false)
        };

        Ok(LocationUpdate {
            city,
            state,
            country,
            status,
            is_valid,
        })
    }

    async fn flush(&self, updates: &[(Uuid, Self::Update)], pool: &PgPool) -> Result<u64> {
        let ids: Vec<Uuid> = updates.iter().map(|(id, _)| *id).collect();
        let cities: Vec<Option<&str>> = updates.iter().map(|(_, u)| u.city.as_deref()).collect();
        let states: Vec<Option<&str>> = updates.iter().map(|(_, u)| u.state.as_deref()).collect();
        let countries: Vec<Option<&str>> =
            updates.iter().map(|(_, u)| u.country.as_deref()).collect();
        let statuses: Vec<&str> = updates.iter().map(|(_, u)| u.status.as_str()).collect();
        let validity: Vec<bool> = updates.iter().map(|(_, u)| u.is_valid).collect();

        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                generated_city = u.city,
                generated_state = u.state,
                generated_country = u.country,
                status = u.status,
                is_valid = u.is_valid,
                status_change_date = NOW()
            FROM UNNEST($1::uuid[], $2::text[], $3::text[], $4::text[], $5::text[], $6::bool[])
                AS u(id, city, state, country, status, is_valid)
            WHERE jobs.id = u.id AND jobs.status = $7
            "#,
        )
        .bind(&ids)
        .bind(&cities)
        .bind(&states)
        .bind(&countries)
        .bind(&statuses)
        .bind(&validity)
        .bind(JobStatus::LocationBatchesGenerated)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn escalate(&self, job_ids: &[Uuid], pool: &PgPool) -> Result<u64> {
        ESCALATION.apply(job_ids, pool).await
    }
}

const ESCALATION: EscalationPolicy = EscalationPolicy {
    retry_column: "llm_location_retry_count",
    queued_status: JobStatus::LocationBatchesGenerated,
    entry_status: JobStatus::WorkplaceClassified,
    failed_status: JobStatus::FailedLocationGeneration,
    max_attempts: EscalationPolicy::MAX_ATTEMPTS,
};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(content: &str) -> serde_json::Value {
        json!({"choices": [{"message": {"content": content}}]})
    }

    #[test]
    fn us_result_classifies_the_record() {
        let update = LocationApplicator
            .parse_body(&body(r#"{"city":"Austin","state":"TX","country":"US"}"#))
            .unwrap();

        assert_eq!(update.city.as_deref(), Some("Austin"));
        assert_eq!(update.state.as_deref(), Some("TX"));
        assert_eq!(update.country.as_deref(), Some("US"));
        assert_eq!(update.status, JobStatus::LocationClassified);
        assert!(update.is_valid);
    }

    #[test]
    fn usa_is_normalized_to_us() {
        let update = LocationApplicator
            .parse_body(&body(r#"{"city":"Boston","state":"MA","country":"USA"}"#))
            .unwrap();

        assert_eq!(update.country.as_deref(), Some("US"));
        assert!(update.is_valid);
    }

    #[test]
    fn non_us_result_invalidates_the_record() {
        let update = LocationApplicator
            .parse_body(&body(r#"{"city":"Toronto","state":null,"country":"CA"}"#))
            .unwrap();

        assert_eq!(update.status, JobStatus::InvalidNonUsLocation);
        assert!(!update.is_valid);

        let update = LocationApplicator
            .parse_body(&body(r#"{"city":null,"state":null,"country":null}"#))
            .unwrap();
        assert_eq!(update.status, JobStatus::InvalidNonUsLocation);
        assert!(!update.is_valid);
    }

    #[test]
    fn oversized_codes_fail_validation() {
        assert!(matches!(
            LocationApplicator
                .parse_body(&body(r#"{"city":"Austin","state":"Texas","country":"US"}"#)),
            Err(InvalidOutput::FieldTooLong { field: "state", .. })
        ));

        assert!(matches!(
            LocationApplicator
                .parse_body(&body(r#"{"city":"Paris","state":null,"country":"France"}"#)),
            Err(InvalidOutput::FieldTooLong { field: "country", .. })
        ));
    }

    #[test]
    fn empty_strings_read_as_absent() {
        let update = LocationApplicator
            .parse_body(&body(r#"{"city":"","state":"","country":"US"}"#))
            .unwrap();

        assert!(update.city.is_none());
        assert!(update.state.is_none());
    }
}
