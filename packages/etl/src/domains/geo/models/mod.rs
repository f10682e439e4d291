pub mod location_lookup;

pub use location_lookup::{LocationLookup, LookupTable};
