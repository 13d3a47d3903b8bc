//! Broker health probing.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use protocol::HealthSnapshot;

/// Something that can ask a broker whether it is healthy.
///
/// Probe failures are never errors: an unreachable, slow or malformed
/// broker is simply unhealthy.
pub trait HealthProbe: Send + Sync {
    /// Fetch the health snapshot, or `None` when the broker cannot be reached.
    fn snapshot<'a>(&'a self) -> Pin<Box<dyn Future<Output = Option<HealthSnapshot>> + Send + 'a>>;

    /// `true` when the broker answered with status `ok`.
    fn check<'a>(&'a self) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            self.snapshot()
                .await
                .map(|snapshot| snapshot.is_ok())
                .unwrap_or(false)
        })
    }
}

/// Probes `GET /health` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Option<HealthSnapshot> {
        let response = match self.client.get(&self.url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(url = %self.url, "Health probe failed: {}", e);
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::debug!(url = %self.url, status = %response.status(), "Health probe rejected");
            return None;
        }
        match response.json::<HealthSnapshot>().await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::debug!(url = %self.url, "Malformed health response: {}", e);
                None
            }
        }
    }
}

impl HealthProbe for HttpHealthProbe {
    fn snapshot<'a>(&'a self) -> Pin<Box<dyn Future<Output = Option<HealthSnapshot>> + Send + 'a>> {
        Box::pin(self.fetch())
    }
}
