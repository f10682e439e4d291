//! Pure OpenAI REST API client
//!
//! A clean, minimal client for the OpenAI Files and Batches APIs with no
//! domain-specific logic. Covers the full asynchronous batch protocol:
//! upload an input file, create a batch over it, poll its status, and
//! download the output (and error) file contents.
//!
//! # Example
//!
//! ```rust,ignore
//! use openai_client::OpenAIClient;
//!
//! let client = OpenAIClient::from_env()?;
//!
//! let file = client.upload_batch_file("requests.jsonl", bytes).await?;
//! let batch = client
//!     .create_batch(&file.id, "/v1/embeddings", Some("requests.jsonl"))
//!     .await?;
//!
//! // ... hours later ...
//! let batch = client.retrieve_batch(&batch.id).await?;
//! if batch.status == "completed" {
//!     let output = client.file_content(batch.output_file_id.as_deref().unwrap()).await?;
//! }
//! ```

pub mod error;
pub mod types;

pub use error::{OpenAIError, Result};
pub use types::*;

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};

/// Request timeout applied to every call; batch output downloads can be
/// large, so this is generous.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Pure OpenAI API client.
#[derive(Clone)]
pub struct OpenAIClient {
    http_client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAIClient {
    /// Create a new OpenAI client with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");

        Self {
            http_client,
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    /// Create from environment variable `OPENAI_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| OpenAIError::Config("OPENAI_API_KEY not set".into()))?;
        Ok(Self::new(api_key))
    }

    /// Set a custom base URL (for Azure, proxies, etc.).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Upload a batch input file (`purpose=batch`).
    ///
    /// The filename is preserved remotely and is what batch metadata should
    /// reference for duplicate-submission detection.
    pub async fn upload_batch_file(&self, filename: &str, contents: Vec<u8>) -> Result<FileObject> {
        let part = reqwest::multipart::Part::bytes(contents)
            .file_name(filename.to_string())
            .mime_str("application/json")
            .map_err(|e| OpenAIError::Config(e.to_string()))?;

        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("purpose", "batch");

        let response = self
            .http_client
            .post(format!("{}/files", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "OpenAI file upload failed");
                OpenAIError::Network(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %error_text, "OpenAI file upload error");
            return Err(OpenAIError::Api(format!(
                "OpenAI file upload error: {}",
                error_text
            )));
        }

        let file: FileObject = response
            .json()
            .await
            .map_err(|e| OpenAIError::Parse(e.to_string()))?;

        debug!(file_id = %file.id, filename, "uploaded batch file");
        Ok(file)
    }

    /// Create a batch over an uploaded input file.
    ///
    /// `endpoint` is the per-line target ("/v1/chat/completions" or
    /// "/v1/embeddings"). When `description` is given it is stored in the
    /// batch metadata so later runs can recognize an already-submitted
    /// artifact by filename.
    pub async fn create_batch(
        &self,
        input_file_id: &str,
        endpoint: &str,
        description: Option<&str>,
    ) -> Result<BatchObject> {
        let mut body = serde_json::json!({
            "input_file_id": input_file_id,
            "endpoint": endpoint,
            "completion_window": "24h",
        });
        if let Some(description) = description {
            body["metadata"] = serde_json::json!({ "description": description });
        }

        let response = self
            .http_client
            .post(format!("{}/batches", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "OpenAI batch creation failed");
                OpenAIError::Network(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %error_text, "OpenAI batch creation error");
            return Err(OpenAIError::Api(format!(
                "OpenAI batch creation error: {}",
                error_text
            )));
        }

        let batch: BatchObject = response
            .json()
            .await
            .map_err(|e| OpenAIError::Parse(e.to_string()))?;

        debug!(batch_id = %batch.id, endpoint, "created batch");
        Ok(batch)
    }

    /// Retrieve the current state of a batch.
    pub async fn retrieve_batch(&self, batch_id: &str) -> Result<BatchObject> {
        let response = self
            .http_client
            .get(format!("{}/batches/{}", self.base_url, batch_id))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| OpenAIError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(OpenAIError::Api(format!(
                "OpenAI batch status error: {}",
                error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| OpenAIError::Parse(e.to_string()))
    }

    /// List all batches, following pagination to the end.
    pub async fn list_batches(&self) -> Result<Vec<BatchObject>> {
        let mut batches = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut url = format!("{}/batches?limit=100", self.base_url);
            if let Some(after_id) = &after {
                url.push_str(&format!("&after={}", after_id));
            }

            let response = self
                .http_client
                .get(url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .send()
                .await
                .map_err(|e| OpenAIError::Network(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let error_text = response.text().await.unwrap_or_default();
                return Err(OpenAIError::Api(format!(
                    "OpenAI batch list error: {}",
                    error_text
                )));
            }

            let page: BatchList = response
                .json()
                .await
                .map_err(|e| OpenAIError::Parse(e.to_string()))?;

            let has_more = page.has_more && !page.data.is_empty();
            after = page.data.last().map(|b| b.id.clone());
            batches.extend(page.data);

            if !has_more {
                break;
            }
        }

        debug!(count = batches.len(), "listed batches");
        Ok(batches)
    }

    /// Download the raw contents of a stored file (batch output or errors).
    pub async fn file_content(&self, file_id: &str) -> Result<bytes::Bytes> {
        let response = self
            .http_client
            .get(format!("{}/files/{}/content", self.base_url, file_id))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, file_id, "OpenAI file download failed");
                OpenAIError::Network(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(status = %status, error = %error_text, "OpenAI file download error");
            return Err(OpenAIError::Api(format!(
                "OpenAI file download error: {}",
                error_text
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| OpenAIError::Network(e.to_string()))
    }
}
