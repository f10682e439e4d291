pub mod models;

pub use models::{BatchStatus, EnrichmentBatch};
