//! Storage-object API under `/storage/v1`.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use poleshift_common::{Error, Result};

use super::client::{
    check_response, encode_path, encode_segment, transport_error, RestClient, RestConfig,
};
use crate::object::ObjectStorage;

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

/// Blob service client.
pub struct RestObjectStorage {
    client: RestClient,
}

impl RestObjectStorage {
    /// Create a new object storage client.
    pub fn new(config: &RestConfig) -> Result<Self> {
        Ok(Self {
            client: RestClient::new(config)?,
        })
    }

    fn object_path(bucket: &str, path: &str) -> String {
        format!(
            "/storage/v1/object/{}/{}",
            encode_segment(bucket),
            encode_path(path)
        )
    }
}

#[async_trait]
impl ObjectStorage for RestObjectStorage {
    async fn exists(&self, bucket: &str, path: &str) -> Result<bool> {
        let response = self
            .client
            .request(Method::HEAD, &Self::object_path(bucket, path))
            .send()
            .await
            .map_err(transport_error)?;

        // The storage API answers 400 for missing objects on some versions.
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST => Ok(false),
            _ => {
                check_response(response).await?;
                Ok(true)
            }
        }
    }

    async fn upload(&self, bucket: &str, path: &str, data: Vec<u8>) -> Result<()> {
        let size = data.len();
        let response = self
            .client
            .request(Method::POST, &Self::object_path(bucket, path))
            .header("Content-Type", "application/octet-stream")
            .header("x-upsert", "false")
            .body(data)
            .send()
            .await
            .map_err(transport_error)?;
        check_response(response).await?;

        debug!("Uploaded {} bytes to {}/{}", size, bucket, path);
        Ok(())
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .request(
                Method::DELETE,
                &format!("/storage/v1/object/{}", encode_segment(bucket)),
            )
            .json(&json!({ "prefixes": paths }))
            .send()
            .await
            .map_err(transport_error)?;
        check_response(response).await?;
        Ok(())
    }

    async fn create_signed_url(&self, bucket: &str, path: &str, ttl: Duration) -> Result<String> {
        let response = self
            .client
            .request(
                Method::POST,
                &format!(
                    "/storage/v1/object/sign/{}/{}",
                    encode_segment(bucket),
                    encode_path(path)
                ),
            )
            .json(&json!({ "expiresIn": ttl.as_secs() }))
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_response(response).await?;

        let signed: SignedUrlResponse = response.json().await.map_err(transport_error)?;
        if signed.signed_url.is_empty() {
            return Err(Error::NotFound(format!("{}/{}", bucket, path)));
        }
        Ok(format!("{}/storage/v1{}", self.client.base(), signed.signed_url))
    }
}
