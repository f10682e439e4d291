// Job-posting enrichment pipeline.
//
// Raw postings flow through a sequence of batch-oriented stages: ingestion,
// workplace classification, location normalization, geocoding, and semantic
// embedding. The LLM-backed stages delegate to the OpenAI Batch API and share
// one generic generate → submit → poll → apply lifecycle; record status in
// the database is the sole driver of stage eligibility, so any stage can be
// re-run at any time.

pub mod common;
pub mod config;
pub mod domains;
pub mod pipeline;

pub use config::*;
