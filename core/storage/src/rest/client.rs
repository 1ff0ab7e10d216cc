//! Shared HTTP plumbing for the REST backends.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use poleshift_common::{Error, Result};

/// Characters escaped inside one URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

fn default_timeout_ms() -> u64 {
    30_000
}

/// Connection settings of a REST backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    /// Base URL of the backend, e.g. `https://project.example.co`.
    pub url: String,
    /// Project API key, sent as `apikey`.
    pub api_key: String,
    /// User access token; falls back to the API key when absent.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Per-request timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl RestConfig {
    /// Create a config with the default timeout.
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            access_token: None,
            timeout_ms: default_timeout_ms(),
        }
    }

    /// Set the user access token.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }
}

/// Authenticated HTTP client bound to one backend.
pub(crate) struct RestClient {
    http: Client,
    base: String,
    api_key: String,
    bearer: String,
}

impl RestClient {
    pub(crate) fn new(config: &RestConfig) -> Result<Self> {
        let parsed = url::Url::parse(&config.url)
            .map_err(|e| Error::Config(format!("Invalid backend URL {}: {}", config.url, e)))?;
        let http = Client::builder()
            .user_agent("Poleshift/0.1")
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base: parsed.as_str().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            bearer: config
                .access_token
                .clone()
                .unwrap_or_else(|| config.api_key.clone()),
        })
    }

    /// Build an authenticated request to `{base}{path}`.
    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base, path);
        debug!("{} {}", method, url);
        self.http
            .request(method, url)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.bearer)
    }

    pub(crate) fn base(&self) -> &str {
        &self.base
    }
}

/// Percent-encode one path segment.
pub(crate) fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, PATH_SEGMENT).to_string()
}

/// Percent-encode a `/`-separated object path, keeping the separators.
pub(crate) fn encode_path(path: &str) -> String {
    path.trim_start_matches('/')
        .split('/')
        .map(encode_segment)
        .collect::<Vec<_>>()
        .join("/")
}

/// Map a transport error.
pub(crate) fn transport_error(err: reqwest::Error) -> Error {
    Error::Network(err.to_string())
}

/// Whether an HTTP status is worth retrying.
fn is_transient(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Turn a non-success response into the matching error.
pub(crate) async fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if is_transient(status) {
        Err(Error::Network(format!("HTTP {}: {}", status, body)))
    } else {
        Err(Error::RemoteRejected {
            status: status.as_u16(),
            message: body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_path_keeps_separators() {
        assert_eq!(encode_path("/samples/a b/c#1.fastq"), "samples/a%20b/c%231.fastq");
        assert_eq!(encode_segment("x/y"), "x%2Fy");
    }

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient(StatusCode::BAD_GATEWAY));
        assert!(is_transient(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_transient(StatusCode::UNPROCESSABLE_ENTITY));
        assert!(!is_transient(StatusCode::CONFLICT));
    }

    #[test]
    fn test_client_trims_base() {
        let client = RestClient::new(&RestConfig::new("https://example.test/", "key")).unwrap();
        assert_eq!(client.base(), "https://example.test");
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config: RestConfig =
            serde_json::from_str(r#"{"url": "https://example.test", "api_key": "k"}"#).unwrap();
        assert_eq!(config.timeout_ms, 30_000);
        assert!(config.access_token.is_none());
    }
}
