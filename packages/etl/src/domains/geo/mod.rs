pub mod models;

pub use models::{LocationLookup, LookupTable};
