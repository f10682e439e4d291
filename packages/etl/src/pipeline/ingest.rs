//! Source file ingestion.
//!
//! Consumes one newline-delimited JSON file per run from the `Ingestable`
//! folder, maps each line's nested schema.org-flavored payload into a job
//! record at status `ingested`, and bulk-inserts in pages. A unique
//! violation inside a page degrades that page to one-row-at-a-time inserts
//! so only the genuinely duplicate rows are skipped, never the whole page.
//! The consumed file moves to `Ingested` afterwards.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use sqlx::PgPool;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::common::generate_content_hash;
use crate::domains::jobs::models::{IngestFile, NewJob};
use crate::domains::jobs::JobStatus;

use super::{Stage, StageContext};

const INSERT_PAGE: usize = 2_000;

pub struct IngestStage;

#[async_trait]
impl Stage for IngestStage {
    fn name(&self) -> &'static str {
        "ingest"
    }

    async fn run(&self, ctx: &StageContext) -> Result<()> {
        let paths = ctx.config.paths();
        let ingestable = paths.ingestable();
        let ingested = paths.ingested();
        tokio::fs::create_dir_all(&ingestable).await?;
        tokio::fs::create_dir_all(&ingested).await?;

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&ingestable).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_str().is_some_and(|n| n.ends_with(".jsonl")) {
                files.push(entry.path());
            }
        }
        files.sort();

        let Some(path) = files.first() else {
            info!("no files to ingest");
            return Ok(());
        };

        // One file per run keeps each invocation's unit of work bounded.
        info!(file = %path.display(), remaining = files.len() - 1, "ingesting file");
        ingest_file(path, &ctx.pool).await?;

        let destination = ingested.join(path.file_name().unwrap_or_default());
        tokio::fs::rename(path, &destination)
            .await
            .with_context(|| format!("failed to move {} to Ingested", path.display()))?;
        info!(file = %destination.display(), "file ingested and archived");

        Ok(())
    }
}

async fn ingest_file(path: &std::path::Path, pool: &PgPool) -> Result<()> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown");
    let file_record = IngestFile::create(filename, pool).await?;

    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut lines = tokio::io::BufReader::new(file).lines();

    let mut page: Vec<NewJob> = Vec::with_capacity(INSERT_PAGE);
    let mut line_number = 0u64;
    let mut parse_errors = 0u64;
    let mut inserted = 0u64;
    let mut duplicates = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<RawPosting>(&line) {
            Ok(raw) => page.push(map_posting(raw, file_record.id)),
            Err(error) => {
                warn!(line = line_number, error = %error, "skipping unparseable posting");
                parse_errors += 1;
            }
        }

        if page.len() >= INSERT_PAGE {
            let (ok, dup) = save_page(&page, pool).await?;
            inserted += ok;
            duplicates += dup;
            page.clear();
        }
    }

    if !page.is_empty() {
        let (ok, dup) = save_page(&page, pool).await?;
        inserted += ok;
        duplicates += dup;
    }

    info!(
        file = filename,
        lines = line_number,
        inserted,
        duplicates,
        parse_errors,
        "ingestion complete"
    );
    Ok(())
}

/// Insert a page in one statement; degrade to row-at-a-time on a unique
/// violation so only the duplicates are dropped.
async fn save_page(page: &[NewJob], pool: &PgPool) -> Result<(u64, u64)> {
    match NewJob::insert_batch(page, pool).await {
        Ok(count) => Ok((count, 0)),
        Err(error) if is_unique_violation(&error) => {
            info!("duplicate key in page; inserting rows individually");

            let mut inserted = 0u64;
            let mut duplicates = 0u64;
            for job in page {
                match job.insert(pool).await {
                    Ok(()) => inserted += 1,
                    Err(error) if is_unique_violation(&error) => duplicates += 1,
                    Err(error) => return Err(error.into()),
                }
            }
            Ok((inserted, duplicates))
        }
        Err(error) => Err(error.into()),
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

fn map_posting(raw: RawPosting, file_id: Uuid) -> NewJob {
    let schema = raw
        .json
        .as_ref()
        .and_then(|j| j.schema_org.as_ref().or(j.json_ld.as_ref()));
    let address = schema
        .and_then(|s| s.job_location.as_ref())
        .and_then(|l| l.address.as_ref());

    let job_description = raw.text.clone();
    let job_description_hash = job_description
        .as_deref()
        .filter(|d| !d.is_empty())
        .map(generate_content_hash);

    NewJob {
        id: Uuid::new_v4(),
        file_id,
        status: JobStatus::Ingested,
        is_valid: true,
        portal: truncate(raw.portal, 100),
        source: truncate(raw.source, 100),
        sourcecc: truncate(raw.source_cc, 10),
        isduplicate: raw.is_duplicate,
        locale: truncate(raw.locale, 10),
        job_title: truncate(raw.name, 500),
        job_url: truncate(raw.url, 1_000),
        job_description,
        job_description_hash,
        location: truncate(
            raw.location
                .and_then(|l| l.org_address)
                .and_then(|a| a.address_line),
            500,
        ),
        country: truncate(address.and_then(|a| a.address_country.clone()), 100),
        region: truncate(address.and_then(|a| a.address_region.clone()), 100),
        locality: truncate(address.and_then(|a| a.address_locality.clone()), 100),
        postcode: truncate(address.and_then(|a| a.postal_code.clone()), 20),
        latitude: schema
            .and_then(|s| s.job_location.as_ref())
            .and_then(|l| l.latitude),
        longitude: schema
            .and_then(|s| s.job_location.as_ref())
            .and_then(|l| l.longitude),
        date_posted: parse_date(schema.and_then(|s| s.date_posted.as_deref())),
        employment_type: truncate(schema.and_then(|s| s.employment_type.clone()), 100),
        company_name: truncate(raw.company.as_ref().and_then(|c| c.name.clone()), 500),
        company_url: truncate(
            raw.company
                .and_then(|c| c.info)
                .and_then(|i| i.careerpage_url),
            1_000,
        ),
        validthrough: parse_date(schema.and_then(|s| s.valid_through.as_deref())),
    }
}

fn truncate(value: Option<String>, max: usize) -> Option<String> {
    value.map(|v| {
        if v.chars().count() <= max {
            v
        } else {
            v.chars().take(max).collect()
        }
    })
}

fn parse_date(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    None
}

// Wire shape of one posting line (schema.org JobPosting flavored, with a
// jsonLD fallback block mirroring schemaOrg).

#[derive(Debug, Deserialize)]
struct RawPosting {
    #[serde(default)]
    portal: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default, rename = "sourceCC")]
    source_cc: Option<String>,
    #[serde(default, rename = "isDuplicate")]
    is_duplicate: bool,
    #[serde(default)]
    locale: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    json: Option<RawJsonBlock>,
    #[serde(default)]
    location: Option<RawLocation>,
    #[serde(default)]
    company: Option<RawCompany>,
}

#[derive(Debug, Deserialize)]
struct RawJsonBlock {
    #[serde(default, rename = "schemaOrg")]
    schema_org: Option<RawSchemaOrg>,
    #[serde(default, rename = "jsonLD")]
    json_ld: Option<RawSchemaOrg>,
}

#[derive(Debug, Deserialize)]
struct RawSchemaOrg {
    #[serde(default, rename = "datePosted")]
    date_posted: Option<String>,
    #[serde(default, rename = "employmentType")]
    employment_type: Option<String>,
    #[serde(default, rename = "validThrough")]
    valid_through: Option<String>,
    #[serde(default, rename = "jobLocation")]
    job_location: Option<RawJobLocation>,
}

#[derive(Debug, Deserialize)]
struct RawJobLocation {
    #[serde(default)]
    address: Option<RawAddress>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawAddress {
    #[serde(default, rename = "addressCountry")]
    address_country: Option<String>,
    #[serde(default, rename = "addressRegion")]
    address_region: Option<String>,
    #[serde(default, rename = "addressLocality")]
    address_locality: Option<String>,
    #[serde(default, rename = "postalCode")]
    postal_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLocation {
    #[serde(default, rename = "orgAddress")]
    org_address: Option<RawOrgAddress>,
}

#[derive(Debug, Deserialize)]
struct RawOrgAddress {
    #[serde(default, rename = "addressLine")]
    address_line: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCompany {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    info: Option<RawCompanyInfo>,
}

#[derive(Debug, Deserialize)]
struct RawCompanyInfo {
    #[serde(default, rename = "careerpageURL")]
    careerpage_url: Option<String>,
}
