//! Connectivity probes.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use poleshift_common::{Error, Result};

/// Liveness check of the backend.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Succeeds if the backend is reachable.
    async fn probe(&self) -> Result<()>;
}

/// HTTP reachability check against a health endpoint.
///
/// Any response below 500 counts as reachable: an auth error still proves
/// the network path works.
pub struct HttpProbe {
    http: Client,
    url: url::Url,
}

impl HttpProbe {
    /// Create a probe for `url` with a per-request timeout.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = url::Url::parse(url)
            .map_err(|e| Error::Config(format!("Invalid health URL {}: {}", url, e)))?;
        let http = Client::builder()
            .user_agent("Poleshift/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, url })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self) -> Result<()> {
        let response = self
            .http
            .head(self.url.clone())
            .send()
            .await
            .map_err(|e| Error::Network(format!("Probe failed: {}", e)))?;

        // Some gateways refuse HEAD; retry once with GET.
        let status = if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            self.http
                .get(self.url.clone())
                .send()
                .await
                .map_err(|e| Error::Network(format!("Probe failed: {}", e)))?
                .status()
        } else {
            response.status()
        };

        debug!("Probe {} answered {}", self.url, status);
        if status.is_server_error() {
            return Err(Error::Network(format!("Probe answered {}", status)));
        }
        Ok(())
    }
}

/// Probe with a scripted or fixed answer (for testing).
pub struct StaticProbe {
    reachable: AtomicBool,
    script: Mutex<VecDeque<bool>>,
    calls: AtomicU32,
}

impl StaticProbe {
    /// Create a probe that always answers `reachable`.
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
        }
    }

    /// Answer the next probes from `answers`, then fall back to the fixed value.
    pub fn with_script(self, answers: impl IntoIterator<Item = bool>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.extend(answers);
        }
        self
    }

    /// Change the fixed answer.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of probes performed so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityProbe for StaticProbe {
    async fn probe(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let reachable = scripted.unwrap_or_else(|| self.reachable.load(Ordering::SeqCst));

        if reachable {
            Ok(())
        } else {
            Err(Error::Network("Backend unreachable".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_probe_script_then_fixed() {
        let probe = StaticProbe::new(true).with_script([false, false]);

        assert!(probe.probe().await.is_err());
        assert!(probe.probe().await.is_err());
        assert!(probe.probe().await.is_ok());
        assert_eq!(probe.calls(), 3);

        probe.set_reachable(false);
        assert!(probe.probe().await.is_err());
    }

    #[test]
    fn test_http_probe_rejects_bad_url() {
        assert!(matches!(
            HttpProbe::new("not a url", Duration::from_secs(1)),
            Err(Error::Config(_))
        ));
    }
}
