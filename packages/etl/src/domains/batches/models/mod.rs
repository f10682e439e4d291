pub mod batch;

pub use batch::{BatchStatus, EnrichmentBatch};
