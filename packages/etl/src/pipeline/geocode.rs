//! Offline geocoding.
//!
//! A pure join against a static city/state → coordinates table loaded from
//! the reference CSV. No external API, no batches, no retries. Records the
//! location classifier flagged as non-US are invalidated here; lookup
//! misses still advance so an incomplete reference table never blocks the
//! pipeline.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::domains::jobs::JobStatus;

use super::{Stage, StageContext};

const PAGE_SIZE: i64 = 25_000;

/// In-memory `city,state` → coordinates index.
pub struct CityIndex {
    entries: HashMap<String, (f64, f64)>,
}

impl CityIndex {
    /// Load the reference CSV (header row, then city,state,lat,lng).
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("city reference CSV not found at {}", path.display()))?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut entries = HashMap::new();

        for line in contents.lines().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            let fields = parse_csv_line(line);
            if fields.len() < 4 {
                continue;
            }

            let (Ok(lat), Ok(lon)) = (fields[2].parse::<f64>(), fields[3].parse::<f64>()) else {
                continue;
            };

            // First entry wins on duplicates.
            entries
                .entry(Self::key(&fields[0], &fields[1]))
                .or_insert((lat, lon));
        }

        if entries.is_empty() {
            bail!("city reference CSV contained no usable rows");
        }
        Ok(Self { entries })
    }

    pub fn get(&self, city: &str, state: &str) -> Option<(f64, f64)> {
        self.entries.get(&Self::key(city, state)).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn key(city: &str, state: &str) -> String {
        format!("{},{}", city, state).to_lowercase()
    }
}

/// Split one CSV line, honoring double-quoted fields.
fn parse_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

#[derive(Debug, sqlx::FromRow)]
struct GeocodeCandidate {
    id: Uuid,
    generated_city: Option<String>,
    generated_state: Option<String>,
    generated_country: Option<String>,
}

pub struct GeocodeStage;

#[async_trait]
impl Stage for GeocodeStage {
    fn name(&self) -> &'static str {
        "geocode"
    }

    async fn run(&self, ctx: &StageContext) -> Result<()> {
        let index = CityIndex::load(&ctx.config.geocode_csv_path).await?;
        info!(cities = index.len(), "loaded city coordinate index");

        let mut geocoded = 0u64;
        let mut missed = 0u64;
        let mut invalidated = 0u64;

        // Every update removes the row from the eligibility set, so
        // re-querying the first page walks the whole backlog.
        loop {
            let page = sqlx::query_as::<_, GeocodeCandidate>(
                r#"
                SELECT id, generated_city, generated_state, generated_country
                FROM jobs
                WHERE status = $1 AND latitude IS NULL AND is_valid = TRUE
                ORDER BY id
                LIMIT $2
                "#,
            )
            .bind(JobStatus::LocationClassified)
            .bind(PAGE_SIZE)
            .fetch_all(&ctx.pool)
            .await?;

            if page.is_empty() {
                break;
            }

            let mut non_us: Vec<Uuid> = Vec::new();
            let mut hits: Vec<(Uuid, f64, f64)> = Vec::new();
            let mut misses: Vec<Uuid> = Vec::new();

            for candidate in &page {
                let foreign = candidate
                    .generated_country
                    .as_deref()
                    .is_some_and(|c| !c.eq_ignore_ascii_case("US"));
                if foreign {
                    non_us.push(candidate.id);
                    continue;
                }

                let coords = match (&candidate.generated_city, &candidate.generated_state) {
                    (Some(city), Some(state)) => index.get(city, state),
                    _ => None,
                };
                match coords {
                    Some((lat, lon)) => hits.push((candidate.id, lat, lon)),
                    None => misses.push(candidate.id),
                }
            }

            let mut tx = ctx.pool.begin().await?;

            if !non_us.is_empty() {
                sqlx::query(
                    r#"
                    UPDATE jobs SET status = $1, is_valid = FALSE, status_change_date = NOW()
                    WHERE id = ANY($2) AND status = $3
                    "#,
                )
                .bind(JobStatus::Invalid)
                .bind(&non_us)
                .bind(JobStatus::LocationClassified)
                .execute(&mut *tx)
                .await?;
            }

            if !hits.is_empty() {
                let ids: Vec<Uuid> = hits.iter().map(|(id, _, _)| *id).collect();
                let lats: Vec<f64> = hits.iter().map(|(_, lat, _)| *lat).collect();
                let lons: Vec<f64> = hits.iter().map(|(_, _, lon)| *lon).collect();

                sqlx::query(
                    r#"
                    UPDATE jobs SET
                        latitude = u.lat,
                        longitude = u.lon,
                        status = $4,
                        status_change_date = NOW()
                    FROM UNNEST($1::uuid[], $2::float8[], $3::float8[]) AS u(id, lat, lon)
                    WHERE jobs.id = u.id AND jobs.status = $5
                    "#,
                )
                .bind(&ids)
                .bind(&lats)
                .bind(&lons)
                .bind(JobStatus::Geocoded)
                .bind(JobStatus::LocationClassified)
                .execute(&mut *tx)
                .await?;
            }

            if !misses.is_empty() {
                // Not in the reference table: advance anyway, coordinates
                // stay null.
                sqlx::query(
                    r#"
                    UPDATE jobs SET status = $1, status_change_date = NOW()
                    WHERE id = ANY($2) AND status = $3
                    "#,
                )
                .bind(JobStatus::Geocoded)
                .bind(&misses)
                .bind(JobStatus::LocationClassified)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;

            invalidated += non_us.len() as u64;
            geocoded += hits.len() as u64;
            missed += misses.len() as u64;
            info!(
                geocoded,
                missed, invalidated, "geocoding progress"
            );
        }

        // Records that already carried coordinates from ingestion.
        let swept = sqlx::query(
            r#"
            UPDATE jobs SET status = $1, status_change_date = NOW()
            WHERE status = $2 AND is_valid = TRUE
            "#,
        )
        .bind(JobStatus::Geocoded)
        .bind(JobStatus::LocationClassified)
        .execute(&ctx.pool)
        .await?
        .rows_affected();

        info!(
            geocoded,
            missed, invalidated, pre_geocoded = swept, "geocoding complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "city,state_id,lat,lng\n\
        Seattle,WA,47.6211,-122.3244\n\
        \"St. Louis\",MO,38.6358,-90.2451\n\
        Springfield,IL,39.7709,-89.6540\n\
        Springfield,MO,37.1943,-93.2916\n";

    #[test]
    fn lookup_is_case_insensitive() {
        let index = CityIndex::parse(CSV).unwrap();

        assert_eq!(index.get("seattle", "wa"), Some((47.6211, -122.3244)));
        assert_eq!(index.get("SEATTLE", "WA"), Some((47.6211, -122.3244)));
        assert_eq!(index.get("Portland", "OR"), None);
    }

    #[test]
    fn quoted_fields_parse() {
        let index = CityIndex::parse(CSV).unwrap();
        assert_eq!(index.get("St. Louis", "MO"), Some((38.6358, -90.2451)));
    }

    #[test]
    fn first_duplicate_wins() {
        let index = CityIndex::parse(CSV).unwrap();
        assert_eq!(index.get("Springfield", "IL"), Some((39.7709, -89.6540)));
    }

    #[test]
    fn header_and_bad_rows_are_skipped() {
        let index = CityIndex::parse("city,state,lat,lng\nNowhere,XX,not-a-number,0\nReal,RL,1.0,2.0\n")
            .unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("Real", "RL"), Some((1.0, 2.0)));
    }

    #[test]
    fn empty_csv_is_an_error() {
        assert!(CityIndex::parse("city,state,lat,lng\n").is_err());
    }

    #[test]
    fn csv_line_splitting_honors_quotes() {
        assert_eq!(
            parse_csv_line(r#""Coeur d'Alene, City of",ID,47.7,-116.8"#),
            vec!["Coeur d'Alene, City of", "ID", "47.7", "-116.8"]
        );
        assert_eq!(parse_csv_line("a,b,c"), vec!["a", "b", "c"]);
    }
}
