//! SDK client construction.

use aws_config::BehaviorVersion;

/// How to reach an S3 or S3-compatible endpoint.
#[derive(Debug, Clone, Default)]
pub struct S3ClientOptions {
    /// Named credential profile. Falls back to the default provider chain.
    pub profile: Option<String>,
    /// Endpoint override for S3-compatible services. Implies path-style addressing.
    pub endpoint_url: Option<String>,
}

/// Build a client from the shared AWS configuration.
pub async fn build_client(options: &S3ClientOptions) -> aws_sdk_s3::Client {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(profile) = &options.profile {
        loader = loader.profile_name(profile);
    }
    let shared = loader.load().await;

    let mut builder = aws_sdk_s3::config::Builder::from(&shared);
    if let Some(url) = &options.endpoint_url {
        builder = builder.endpoint_url(url).force_path_style(true);
    }
    aws_sdk_s3::Client::from_conf(builder.build())
}
