pub mod ingest_file;
pub mod job;
pub mod job_embedding;

pub use ingest_file::IngestFile;
pub use job::{EmbeddingCandidate, JobRequestData, NewJob};
pub use job_embedding::JobEmbedding;
