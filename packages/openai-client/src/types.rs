//! OpenAI API request and response types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// =============================================================================
// Files
// =============================================================================

/// A file stored on OpenAI (uploaded batch input, batch output, batch errors).
#[derive(Debug, Clone, Deserialize)]
pub struct FileObject {
    /// File identifier (e.g., "file-abc123")
    pub id: String,

    /// Original filename
    #[serde(default)]
    pub filename: Option<String>,

    /// Size in bytes
    #[serde(default)]
    pub bytes: Option<i64>,

    /// Upload purpose (e.g., "batch")
    #[serde(default)]
    pub purpose: Option<String>,
}

// =============================================================================
// Batches
// =============================================================================

/// One line of a batch input file.
///
/// The Batch API consumes newline-delimited JSON where every line is a
/// self-contained request carrying a caller-chosen `custom_id` used to
/// correlate the asynchronous response back to its origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequestLine {
    /// Caller-chosen correlation token, echoed back on the result line
    pub custom_id: String,

    /// HTTP method, always "POST" for the supported endpoints
    pub method: String,

    /// Target endpoint ("/v1/chat/completions" or "/v1/embeddings")
    pub url: String,

    /// Endpoint-specific request body
    pub body: serde_json::Value,
}

impl BatchRequestLine {
    /// Create a request line for the given endpoint.
    pub fn new(
        custom_id: impl Into<String>,
        url: impl Into<String>,
        body: serde_json::Value,
    ) -> Self {
        Self {
            custom_id: custom_id.into(),
            method: "POST".to_string(),
            url: url.into(),
            body,
        }
    }
}

/// A batch job as reported by the Batches API.
///
/// `status` is one of: "validating", "failed", "in_progress", "finalizing",
/// "completed", "expired", "cancelling", "cancelled".
#[derive(Debug, Clone, Deserialize)]
pub struct BatchObject {
    /// Batch identifier (e.g., "batch_abc123")
    pub id: String,

    /// Remote lifecycle status
    pub status: String,

    /// The uploaded input file this batch runs over
    #[serde(default)]
    pub input_file_id: Option<String>,

    /// Result file, present once the batch completes
    #[serde(default)]
    pub output_file_id: Option<String>,

    /// Per-request error file, present when some requests failed
    #[serde(default)]
    pub error_file_id: Option<String>,

    /// Caller-supplied metadata set at creation time
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

impl BatchObject {
    /// The `description` metadata entry, used to tag batches with their
    /// originating artifact filename.
    pub fn description(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("description"))
            .map(String::as_str)
    }
}

/// One page of the batch listing endpoint.
#[derive(Debug, Deserialize)]
pub struct BatchList {
    pub data: Vec<BatchObject>,

    #[serde(default)]
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_serializes_with_post_method() {
        let line = BatchRequestLine::new(
            "job_123",
            "/v1/embeddings",
            serde_json::json!({"model": "text-embedding-3-small", "input": "hello"}),
        );

        let json = serde_json::to_value(&line).unwrap();
        assert_eq!(json["custom_id"], "job_123");
        assert_eq!(json["method"], "POST");
        assert_eq!(json["url"], "/v1/embeddings");
        assert_eq!(json["body"]["model"], "text-embedding-3-small");
    }

    #[test]
    fn batch_object_description_reads_metadata() {
        let batch: BatchObject = serde_json::from_value(serde_json::json!({
            "id": "batch_1",
            "status": "completed",
            "metadata": {"description": "workplace_batch_a.jsonl"}
        }))
        .unwrap();

        assert_eq!(batch.description(), Some("workplace_batch_a.jsonl"));
    }

    #[test]
    fn batch_object_tolerates_missing_optional_fields() {
        let batch: BatchObject =
            serde_json::from_value(serde_json::json!({"id": "batch_2", "status": "in_progress"}))
                .unwrap();

        assert!(batch.output_file_id.is_none());
        assert!(batch.error_file_id.is_none());
        assert!(batch.description().is_none());
    }
}
