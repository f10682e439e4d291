//! Batch artifact round-trip: what the generator writes is exactly what the
//! submitter uploads and the remote API consumes, one self-contained request
//! per line with a resolvable correlation token.

use etl_core::pipeline::domain::parse_correlation_token;
use etl_core::pipeline::generate::write_artifact;
use etl_core::pipeline::{embedding, location, workplace};
use openai_client::BatchRequestLine;
use uuid::Uuid;

use etl_core::domains::jobs::models::job::{EmbeddingCandidate, JobRequestData};

fn request_data(id: Uuid) -> JobRequestData {
    JobRequestData {
        id,
        job_title: Some("Data Engineer".to_string()),
        company_name: Some("Initech".to_string()),
        locality: Some("Tulsa".to_string()),
        region: Some("OK".to_string()),
        country: Some("US".to_string()),
        location: Some("Tulsa, OK".to_string()),
        job_description: Some("Pipelines, but for data.".to_string()),
    }
}

#[tokio::test]
async fn written_artifact_round_trips_line_by_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("workplace_batch_test.jsonl");

    let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
    let lines: Vec<BatchRequestLine> = ids
        .iter()
        .map(|id| workplace::build_request(&request_data(*id)))
        .collect();

    write_artifact(&path, &lines).await.unwrap();

    let contents = tokio::fs::read_to_string(&path).await.unwrap();
    let parsed: Vec<BatchRequestLine> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(parsed.len(), ids.len());
    for (line, id) in parsed.iter().zip(&ids) {
        assert_eq!(parse_correlation_token(&line.custom_id), Some(*id));
        assert_eq!(line.method, "POST");
        assert_eq!(line.url, "/v1/chat/completions");
        assert_eq!(line.body["response_format"]["type"], "json_object");
    }
}

#[tokio::test]
async fn each_domain_targets_its_own_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mixed.jsonl");

    let id = Uuid::new_v4();
    let lines = vec![
        workplace::build_request(&request_data(id)),
        location::build_request(&request_data(id)),
        embedding::build_request(&EmbeddingCandidate {
            id,
            job_title: Some("Data Engineer".to_string()),
            job_description: Some("Pipelines.".to_string()),
        }),
    ];

    write_artifact(&path, &lines).await.unwrap();

    let contents = tokio::fs::read_to_string(&path).await.unwrap();
    let urls: Vec<String> = contents
        .lines()
        .map(|line| {
            serde_json::from_str::<BatchRequestLine>(line)
                .unwrap()
                .url
        })
        .collect();

    assert_eq!(
        urls,
        vec![
            "/v1/chat/completions",
            "/v1/chat/completions",
            "/v1/embeddings"
        ]
    );
}

#[tokio::test]
async fn empty_artifact_is_still_a_valid_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.jsonl");

    write_artifact(&path, &[]).await.unwrap();

    let contents = tokio::fs::read_to_string(&path).await.unwrap();
    assert!(contents.is_empty());
}
