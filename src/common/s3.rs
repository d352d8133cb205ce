//! Helper code for working with S3.

/// Return the S3 configuration from environment variables.
pub async fn config_from_env() -> Result<aws_sdk_s3::config::Config, anyhow::Error> {
    let config = aws_config::from_env().load().await;
    let endpoint_url = std::env::var("AWS_ENDPOINT_URL").map_err(|e| {
        anyhow::anyhow!(
            "Could not get endpoint url from env AWS_ENDPOINT_URL: {}",
            e
        )
    });
    match endpoint_url {
        Ok(endpoint_url) => {
            tracing::trace!("will use endpoint url {:?}", &endpoint_url);
            Ok(aws_sdk_s3::config::Builder::from(&config)
                .endpoint_url(endpoint_url)
                .force_path_style(true)
                .build())
        }
        Err(e) => Err(e),
    }
}
