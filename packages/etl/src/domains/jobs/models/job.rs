use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::domains::jobs::JobStatus;

/// A job record as captured at ingestion time.
///
/// Enrichment fields (workplace type, normalized location, coordinates,
/// embedding) start out null and are written progressively by later stages;
/// the stages themselves use targeted set-based updates rather than loading
/// whole rows back.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub file_id: Uuid,
    pub status: JobStatus,
    pub is_valid: bool,
    pub portal: Option<String>,
    pub source: Option<String>,
    pub sourcecc: Option<String>,
    pub isduplicate: bool,
    pub locale: Option<String>,
    pub job_title: Option<String>,
    pub job_url: Option<String>,
    pub job_description: Option<String>,
    pub job_description_hash: Option<String>,
    pub location: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub locality: Option<String>,
    pub postcode: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub date_posted: Option<DateTime<Utc>>,
    pub employment_type: Option<String>,
    pub company_name: Option<String>,
    pub company_url: Option<String>,
    pub validthrough: Option<DateTime<Utc>>,
}

const INSERT_COLUMNS: &str = "id, file_id, status, is_valid, portal, source, sourcecc, \
     isduplicate, locale, job_title, job_url, job_description, job_description_hash, \
     location, country, region, locality, postcode, latitude, longitude, date_posted, \
     employment_type, company_name, company_url, validthrough";

fn push_job_binds(b: &mut sqlx::query_builder::Separated<'_, '_, Postgres, &str>, job: &NewJob) {
    b.push_bind(job.id)
        .push_bind(job.file_id)
        .push_bind(job.status)
        .push_bind(job.is_valid)
        .push_bind(job.portal.clone())
        .push_bind(job.source.clone())
        .push_bind(job.sourcecc.clone())
        .push_bind(job.isduplicate)
        .push_bind(job.locale.clone())
        .push_bind(job.job_title.clone())
        .push_bind(job.job_url.clone())
        .push_bind(job.job_description.clone())
        .push_bind(job.job_description_hash.clone())
        .push_bind(job.location.clone())
        .push_bind(job.country.clone())
        .push_bind(job.region.clone())
        .push_bind(job.locality.clone())
        .push_bind(job.postcode.clone())
        .push_bind(job.latitude)
        .push_bind(job.longitude)
        .push_bind(job.date_posted)
        .push_bind(job.employment_type.clone())
        .push_bind(job.company_name.clone())
        .push_bind(job.company_url.clone())
        .push_bind(job.validthrough);
}

impl NewJob {
    /// Insert a page of records with a single multi-row statement.
    pub async fn insert_batch(jobs: &[NewJob], pool: &PgPool) -> Result<u64, sqlx::Error> {
        let mut builder =
            QueryBuilder::<Postgres>::new(format!("INSERT INTO jobs ({}) ", INSERT_COLUMNS));
        builder.push_values(jobs, |mut b, job| push_job_binds(&mut b, job));

        let result = builder.build().execute(pool).await?;
        Ok(result.rows_affected())
    }

    /// Insert one record; a unique violation surfaces as `sqlx::Error`.
    pub async fn insert(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        let mut builder =
            QueryBuilder::<Postgres>::new(format!("INSERT INTO jobs ({}) ", INSERT_COLUMNS));
        builder.push_values(std::iter::once(self), |mut b, job| {
            push_job_binds(&mut b, job)
        });

        builder.build().execute(pool).await?;
        Ok(())
    }
}

/// The fields a classification batch request is built from.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRequestData {
    pub id: Uuid,
    pub job_title: Option<String>,
    pub company_name: Option<String>,
    pub locality: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub location: Option<String>,
    pub job_description: Option<String>,
}

impl JobRequestData {
    /// Records in `file_id` awaiting workplace classification.
    pub async fn needing_workplace(file_id: Uuid, pool: &PgPool) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, job_title, company_name, locality, region, country, location, job_description
            FROM jobs
            WHERE file_id = $1 AND status = $2 AND generated_workplace IS NULL AND is_valid = TRUE
            ORDER BY id
            "#,
        )
        .bind(file_id)
        .bind(JobStatus::Ingested)
        .fetch_all(pool)
        .await?;
        Ok(jobs)
    }

    /// Records in `file_id` awaiting location normalization.
    pub async fn needing_location(file_id: Uuid, pool: &PgPool) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, job_title, company_name, locality, region, country, location, job_description
            FROM jobs
            WHERE file_id = $1 AND status = $2 AND generated_city IS NULL AND is_valid = TRUE
            ORDER BY id
            "#,
        )
        .bind(file_id)
        .bind(JobStatus::WorkplaceClassified)
        .fetch_all(pool)
        .await?;
        Ok(jobs)
    }
}

/// The fields an embedding batch request is built from.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EmbeddingCandidate {
    pub id: Uuid,
    pub job_title: Option<String>,
    pub job_description: Option<String>,
}

impl EmbeddingCandidate {
    /// One keyset page of valid US records that have no embedding yet.
    pub async fn page(after: Option<Uuid>, limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(
            r#"
            SELECT j.id, j.job_title, j.job_description
            FROM jobs j
            LEFT JOIN job_embeddings e ON e.job_id = j.id
            WHERE j.status = $1
              AND j.is_valid = TRUE
              AND j.generated_country = 'US'
              AND e.job_id IS NULL
              AND ($2::uuid IS NULL OR j.id > $2)
            ORDER BY j.id
            LIMIT $3
            "#,
        )
        .bind(JobStatus::Geocoded)
        .bind(after)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(jobs)
    }
}

/// Distinct source files that still hold records at the given entry status
/// with the given enrichment output unset.
pub async fn files_with_pending_work(
    entry: JobStatus,
    output_column: &'static str,
    pool: &PgPool,
) -> Result<Vec<Uuid>> {
    let sql = format!(
        "SELECT DISTINCT file_id FROM jobs \
         WHERE status = $1 AND {output_column} IS NULL AND is_valid = TRUE"
    );
    let rows: Vec<(Uuid,)> = sqlx::query_as(&sql).bind(entry).fetch_all(pool).await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// The subset of `ids` that exist in the record store.
pub async fn known_ids(ids: &[Uuid], pool: &PgPool) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM jobs WHERE id = ANY($1)")
        .bind(ids)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Advance every listed record from `from` to `to` in one statement.
///
/// The `from` guard makes re-runs no-ops for records that already moved.
pub async fn mark_queued<'e, E>(ids: &[Uuid], from: JobStatus, to: JobStatus, executor: E) -> Result<u64>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    from.transition_to(to)?;

    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = $1, status_change_date = NOW()
        WHERE id = ANY($2) AND status = $3 AND is_valid = TRUE
        "#,
    )
    .bind(to)
    .bind(ids)
    .bind(from)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}
