//! Per-domain configuration for the generic batch lifecycle.
//!
//! The three enrichment domains (workplace classification, location
//! normalization, embedding generation) run the identical generate → submit
//! → poll → apply cycle; everything that differs between them is captured
//! here as data, plus a result-applicator implementation per domain.

use std::path::PathBuf;

use uuid::Uuid;

use crate::config::DataPaths;
use crate::domains::jobs::models::JobRequestData;

/// Static description of one enrichment domain.
#[derive(Debug)]
pub struct DomainSpec {
    /// Domain key, also used to look up configuration overrides
    pub name: &'static str,
    /// Batch tracking table owned by this domain
    pub batch_table: &'static str,
    /// Per-line target endpoint inside the batch
    pub endpoint: &'static str,
    /// Records per generated artifact
    pub chunk_size: usize,
    /// Data-root subfolder holding artifacts awaiting submission
    pub batch_subdir: &'static str,
    /// Data-root subfolder holding downloaded result/error files
    pub result_subdir: &'static str,
    /// Filename prefixes for artifacts, result files, and error files
    pub artifact_prefix: &'static str,
    pub result_prefix: &'static str,
    pub error_prefix: &'static str,
}

impl DomainSpec {
    pub fn batch_dir(&self, paths: &DataPaths) -> PathBuf {
        paths.subdir(self.batch_subdir)
    }

    pub fn result_dir(&self, paths: &DataPaths) -> PathBuf {
        paths.subdir(self.result_subdir)
    }

    /// Artifact filename for a freshly generated chunk.
    ///
    /// The tracking-record id is embedded so the name (which becomes the
    /// remote batch's `metadata.description` deduplication key) is unique
    /// per generated artifact, even across retry rounds over the same file.
    pub fn artifact_filename(&self, file_id: Option<Uuid>, batch_id: Uuid) -> String {
        match file_id {
            Some(file_id) => format!("{}_{}_{}.jsonl", self.artifact_prefix, file_id, batch_id),
            None => format!("{}_{}.jsonl", self.artifact_prefix, batch_id),
        }
    }

    pub fn result_filename(&self, batch_id: Uuid) -> String {
        format!("{}_{}.jsonl", self.result_prefix, batch_id)
    }

    pub fn error_filename(&self, batch_id: Uuid) -> String {
        format!("{}_{}.jsonl", self.error_prefix, batch_id)
    }
}

/// Correlation-token prefix embedded in every outbound request line.
const CORRELATION_PREFIX: &str = "job_";

/// The `custom_id` carried by a record's batch request.
pub fn correlation_token(job_id: Uuid) -> String {
    format!("{CORRELATION_PREFIX}{job_id}")
}

/// Resolve a result line's `custom_id` back to a record id.
pub fn parse_correlation_token(token: &str) -> Option<Uuid> {
    token
        .strip_prefix(CORRELATION_PREFIX)
        .and_then(|id| Uuid::parse_str(id).ok())
}

/// Human-readable location context for classification prompts: structured
/// fields joined when present, the raw location string otherwise.
pub fn location_context(job: &JobRequestData) -> String {
    let parts: Vec<&str> = [&job.locality, &job.region, &job.country]
        .into_iter()
        .filter_map(|part| part.as_deref())
        .filter(|part| !part.is_empty())
        .collect();

    if parts.is_empty() {
        job.location
            .clone()
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| "Not specified".to_string())
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_data(
        locality: Option<&str>,
        region: Option<&str>,
        country: Option<&str>,
        location: Option<&str>,
    ) -> JobRequestData {
        JobRequestData {
            id: Uuid::new_v4(),
            job_title: None,
            company_name: None,
            locality: locality.map(String::from),
            region: region.map(String::from),
            country: country.map(String::from),
            location: location.map(String::from),
            job_description: None,
        }
    }

    #[test]
    fn correlation_token_round_trips() {
        let id = Uuid::new_v4();
        assert_eq!(parse_correlation_token(&correlation_token(id)), Some(id));
    }

    #[test]
    fn bad_tokens_do_not_resolve() {
        assert_eq!(parse_correlation_token("job_not-a-uuid"), None);
        assert_eq!(parse_correlation_token("record_123"), None);
        assert_eq!(parse_correlation_token(""), None);
    }

    #[test]
    fn location_context_prefers_structured_fields() {
        let job = request_data(Some("Austin"), Some("TX"), Some("US"), Some("raw text"));
        assert_eq!(location_context(&job), "Austin, TX, US");
    }

    #[test]
    fn location_context_falls_back_to_the_raw_string() {
        let job = request_data(None, None, None, Some("Somewhere, USA"));
        assert_eq!(location_context(&job), "Somewhere, USA");

        let job = request_data(None, None, None, None);
        assert_eq!(location_context(&job), "Not specified");
    }

    #[test]
    fn artifact_names_embed_the_tracking_id() {
        let spec = DomainSpec {
            name: "workplace",
            batch_table: "workplace_batches",
            endpoint: "/v1/chat/completions",
            chunk_size: 10,
            batch_subdir: "llmbatch",
            result_subdir: "llmresult",
            artifact_prefix: "workplace_batch",
            result_prefix: "workplace_results",
            error_prefix: "workplace_errors",
        };

        let file_id = Uuid::new_v4();
        let batch_id = Uuid::new_v4();
        let name = spec.artifact_filename(Some(file_id), batch_id);
        assert!(name.starts_with("workplace_batch_"));
        assert!(name.contains(&file_id.to_string()));
        assert!(name.contains(&batch_id.to_string()));
        assert!(name.ends_with(".jsonl"));

        let global = spec.artifact_filename(None, batch_id);
        assert_eq!(global, format!("workplace_batch_{batch_id}.jsonl"));
    }
}
