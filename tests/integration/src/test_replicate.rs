//! Replication integration tests.

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use crate::{
        base_url, destination_root, http_client, put_source_object, replicate, test_container,
    };

    #[tokio::test]
    #[ignore = "requires running server"]
    async fn test_should_replicate_then_skip() {
        let client = http_client();
        let container = test_container("skip");
        let data = vec![42u8; 1024 * 1024];
        put_source_object(&container, &format!("{container}/q1 2024.csv"), &data);
        let wire_key = format!("{container}/q1+2024.csv");

        let (status, body) = replicate(&client, &container, &wire_key).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["status"], "completed");
        assert_eq!(body["bytes"], 1024 * 1024);

        let copied = std::fs::read(destination_root().join(&container).join("q1 2024.csv"))
            .expect("replicated object");
        assert_eq!(copied, data);

        let (status, body) = replicate(&client, &container, &wire_key).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "skipped");
        assert_eq!(body["bytes"], 0);
    }

    #[tokio::test]
    #[ignore = "requires running server"]
    async fn test_should_settle_concurrent_deliveries() {
        let client = http_client();
        let container = test_container("race");
        let key = format!("{container}/race.bin");
        let data: Vec<u8> = (0..=255u8).cycle().take(256 * 1024).collect();
        put_source_object(&container, &key, &data);

        let results =
            futures::future::join_all((0..8).map(|_| replicate(&client, &container, &key))).await;
        for (status, body) in &results {
            assert_eq!(*status, StatusCode::OK, "{body}");
            assert!(body["status"] == "completed" || body["status"] == "skipped");
        }

        let copied = std::fs::read(destination_root().join(&key)).expect("replicated object");
        assert_eq!(copied, data);

        let leftovers: Vec<_> = std::fs::read_dir(destination_root().join(&container))
            .expect("destination dir")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".__tmp__"))
            .collect();
        assert!(leftovers.is_empty(), "temporary objects left: {leftovers:?}");
    }

    #[tokio::test]
    #[ignore = "requires running server"]
    async fn test_should_report_missing_source() {
        let client = http_client();
        let container = test_container("missing");
        let (status, body) = replicate(&client, &container, "nope.txt").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "SourceNotFound");
        assert_eq!(body["bucket"], container.as_str());
        assert_eq!(body["key"], "nope.txt");
    }

    #[tokio::test]
    #[ignore = "requires running server"]
    async fn test_should_reject_invalid_requests() {
        let client = http_client();

        let (status, body) = replicate(&client, "", "k").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "InvalidRequest");

        let (status, _) = replicate(&client, "b", "bad%FF").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let response = client
            .post(format!("{}/v1/replicate", base_url()))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    #[ignore = "requires running server"]
    async fn test_should_accept_legacy_field_names() {
        let client = http_client();
        let container = test_container("legacy");
        let key = format!("{container}/legacy.txt");
        put_source_object(&container, &key, b"legacy");

        let response = client
            .post(format!("{}/v1/replicate", base_url()))
            .json(&serde_json::json!({ "s3_bucket": container, "s3_key": key }))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
