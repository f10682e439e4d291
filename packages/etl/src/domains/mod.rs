pub mod batches;
pub mod geo;
pub mod jobs;
