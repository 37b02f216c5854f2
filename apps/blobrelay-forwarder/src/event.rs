//! S3 event notification parsing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Body posted to `/v1/replicate`. The key keeps its notification encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardedRequest {
    /// Source bucket.
    pub bucket: String,
    /// Object key exactly as it appeared in the notification.
    pub key: String,
}

#[derive(Debug, Deserialize)]
struct Notification {
    #[serde(rename = "Records", default)]
    records: Vec<Record>,
}

#[derive(Debug, Deserialize)]
struct Record {
    s3: Option<Entity>,
}

#[derive(Debug, Deserialize)]
struct Entity {
    bucket: Option<Named>,
    object: Option<Object>,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Object {
    key: Option<String>,
}

/// One entry per record: the request to forward, or why the record is unusable.
pub type Extracted = Vec<Result<ForwardedRequest, String>>;

/// Extract `{bucket, key}` from every record of a notification document.
///
/// # Errors
///
/// Fails if the document is not JSON or has no records at all.
pub fn extract_requests(document: &str) -> Result<Extracted> {
    let notification: Notification =
        serde_json::from_str(document).context("event is not a valid notification document")?;
    if notification.records.is_empty() {
        anyhow::bail!("event contains no records");
    }

    Ok(notification
        .records
        .into_iter()
        .enumerate()
        .map(|(i, record)| -> Result<ForwardedRequest, String> {
            let entity = record.s3.ok_or_else(|| format!("record {i} has no s3 entity"))?;
            let bucket = entity
                .bucket
                .and_then(|b| b.name)
                .filter(|b| !b.is_empty())
                .ok_or_else(|| format!("record {i} has no bucket name"))?;
            let key = entity
                .object
                .and_then(|o| o.key)
                .filter(|k| !k.is_empty())
                .ok_or_else(|| format!("record {i} has no object key"))?;
            Ok(ForwardedRequest { bucket, key })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENT: &str = r#"{
        "Records": [
            {
                "eventSource": "aws:s3",
                "eventName": "ObjectCreated:Put",
                "s3": {
                    "bucket": { "name": "inbox", "arn": "arn:aws:s3:::inbox" },
                    "object": { "key": "reports/q1+2024.csv", "size": 1048576 }
                }
            },
            {
                "s3": {
                    "bucket": { "name": "inbox" },
                    "object": { "key": "a%2Bb.txt" }
                }
            }
        ]
    }"#;

    #[test]
    fn test_should_extract_every_record_without_decoding() {
        let extracted = extract_requests(EVENT).unwrap();
        assert_eq!(
            extracted,
            vec![
                Ok(ForwardedRequest {
                    bucket: "inbox".into(),
                    key: "reports/q1+2024.csv".into(),
                }),
                Ok(ForwardedRequest {
                    bucket: "inbox".into(),
                    key: "a%2Bb.txt".into(),
                }),
            ]
        );
    }

    #[test]
    fn test_should_report_incomplete_records() {
        let doc = r#"{"Records":[{"s3":{"bucket":{"name":"b"}}},{"eventName":"x"}]}"#;
        let extracted = extract_requests(doc).unwrap();
        assert_eq!(extracted.len(), 2);
        assert!(extracted.iter().all(Result::is_err));
    }

    #[test]
    fn test_should_reject_documents_without_records() {
        assert!(extract_requests("{}").is_err());
        assert!(extract_requests("not json").is_err());
    }

    #[test]
    fn test_should_serialize_forwarded_body() {
        let body = serde_json::to_value(ForwardedRequest {
            bucket: "b".into(),
            key: "k+1".into(),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"bucket": "b", "key": "k+1"}));
    }
}
