use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub openai_api_key: String,
    pub data_root: PathBuf,
    pub geocode_csv_path: PathBuf,
    pub workplace_batches_in_flight: i64,
    pub location_batches_in_flight: i64,
    pub embedding_batches_in_flight: i64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let data_root = PathBuf::from(
            env::var("ETL_DATA_ROOT").context("ETL_DATA_ROOT must be set")?,
        );
        let geocode_csv_path = env::var("GEOCODE_CSV_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_root.join("us_cities.csv"));

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            openai_api_key: env::var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set")?,
            data_root,
            geocode_csv_path,
            workplace_batches_in_flight: in_flight_cap("WORKPLACE_BATCHES_IN_FLIGHT")?,
            location_batches_in_flight: in_flight_cap("LOCATION_BATCHES_IN_FLIGHT")?,
            embedding_batches_in_flight: in_flight_cap("EMBEDDING_BATCHES_IN_FLIGHT")?,
        })
    }

    /// The per-stage folder layout rooted at the configured data directory.
    pub fn paths(&self) -> DataPaths {
        DataPaths::new(self.data_root.clone())
    }

    /// The in-flight submission cap for an enrichment domain.
    pub fn batches_in_flight(&self, domain: &str) -> i64 {
        match domain {
            "workplace" => self.workplace_batches_in_flight,
            "location" => self.location_batches_in_flight,
            "embedding" => self.embedding_batches_in_flight,
            _ => DataPaths::DEFAULT_BATCHES_IN_FLIGHT,
        }
    }
}

fn in_flight_cap(var: &str) -> Result<i64> {
    match env::var(var) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{} must be a valid number", var)),
        Err(_) => Ok(DataPaths::DEFAULT_BATCHES_IN_FLIGHT),
    }
}

/// Per-stage subfolders under the data root.
///
/// The folders double as the durable queue between pipeline runs: a batch
/// artifact or downloaded result file sitting in one of them is persisted
/// state, picked up by whichever stage owns the folder on its next run.
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    /// Default cap on remote batches concurrently in flight per domain.
    pub const DEFAULT_BATCHES_IN_FLIGHT: i64 = 2;

    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Source files waiting to be ingested.
    pub fn ingestable(&self) -> PathBuf {
        self.root.join("Ingestable")
    }

    /// Source files already consumed.
    pub fn ingested(&self) -> PathBuf {
        self.root.join("Ingested")
    }

    /// A named per-stage subfolder (batch artifacts or downloaded results).
    pub fn subdir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_rooted_at_the_data_root() {
        let paths = DataPaths::new(PathBuf::from("/data"));

        assert_eq!(paths.ingestable(), PathBuf::from("/data/Ingestable"));
        assert_eq!(paths.ingested(), PathBuf::from("/data/Ingested"));
        assert_eq!(paths.subdir("llmbatch"), PathBuf::from("/data/llmbatch"));
    }
}
