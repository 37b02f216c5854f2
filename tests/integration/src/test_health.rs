//! Health endpoint integration tests.

#[cfg(test)]
mod tests {
    use crate::{base_url, http_client};

    #[tokio::test]
    #[ignore = "requires running server"]
    async fn test_should_report_running() {
        let client = http_client();
        let response = client
            .get(format!("{}/health", base_url()))
            .send()
            .await
            .expect("health request");

        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let body: serde_json::Value = response.json().await.expect("json");
        assert_eq!(body["status"], "running");
        assert!(body["version"].is_string());
    }

    #[tokio::test]
    #[ignore = "requires running server"]
    async fn test_should_reject_get_on_replicate() {
        let client = http_client();
        let response = client
            .get(format!("{}/v1/replicate", base_url()))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);
    }
}
