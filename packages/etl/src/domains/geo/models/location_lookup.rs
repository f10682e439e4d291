use std::collections::HashMap;

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

/// Precomputed location-text → normalized-value cache entry.
///
/// Populated offline; the pipeline only reads it, to short-circuit repeat
/// location strings before spending an LLM request on them.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LocationLookup {
    pub id: Uuid,
    pub location_text: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub confidence: i32,
}

impl LocationLookup {
    pub async fn load_all(pool: &PgPool) -> Result<Vec<Self>> {
        let lookups = sqlx::query_as::<_, Self>("SELECT * FROM location_lookups")
            .fetch_all(pool)
            .await?;
        Ok(lookups)
    }
}

/// Case-insensitive in-memory index over the lookup cache.
#[derive(Debug, Default)]
pub struct LookupTable {
    entries: HashMap<String, LocationLookup>,
}

impl LookupTable {
    pub fn from_rows(rows: Vec<LocationLookup>) -> Self {
        let entries = rows
            .into_iter()
            .map(|row| (row.location_text.to_lowercase(), row))
            .collect();
        Self { entries }
    }

    pub async fn load(pool: &PgPool) -> Result<Self> {
        Ok(Self::from_rows(LocationLookup::load_all(pool).await?))
    }

    pub fn get(&self, location_text: &str) -> Option<&LocationLookup> {
        self.entries.get(&location_text.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(text: &str, city: &str, state: &str, country: &str) -> LocationLookup {
        LocationLookup {
            id: Uuid::new_v4(),
            location_text: text.to_string(),
            city: Some(city.to_string()),
            state: Some(state.to_string()),
            country: Some(country.to_string()),
            confidence: 90,
        }
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let table = LookupTable::from_rows(vec![entry("New York, NY", "New York", "NY", "US")]);

        assert!(table.get("new york, ny").is_some());
        assert!(table.get("NEW YORK, NY").is_some());
        assert!(table.get("Boston, MA").is_none());
    }

    #[test]
    fn later_duplicate_key_wins() {
        let table = LookupTable::from_rows(vec![
            entry("Remote", "Old", "XX", "US"),
            entry("remote", "New", "YY", "US"),
        ]);

        assert_eq!(table.len(), 1);
        assert_eq!(table.get("REMOTE").unwrap().city.as_deref(), Some("New"));
    }
}
