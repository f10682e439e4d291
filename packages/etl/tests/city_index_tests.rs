//! Geocoder reference-table loading from disk.

use etl_core::pipeline::geocode::CityIndex;
use std::io::Write;

#[tokio::test]
async fn loads_the_reference_csv_from_disk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "city,state_id,lat,lng").unwrap();
    writeln!(file, "Minneapolis,MN,44.9635,-93.2678").unwrap();
    writeln!(file, "\"St. Paul\",MN,44.9489,-93.1041").unwrap();
    file.flush().unwrap();

    let index = CityIndex::load(file.path()).await.unwrap();

    assert_eq!(index.len(), 2);
    assert_eq!(index.get("minneapolis", "mn"), Some((44.9635, -93.2678)));
    assert_eq!(index.get("St. Paul", "MN"), Some((44.9489, -93.1041)));
}

#[tokio::test]
async fn missing_reference_csv_is_a_fatal_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.csv");

    let result = CityIndex::load(&missing).await;
    assert!(result.is_err());
}
