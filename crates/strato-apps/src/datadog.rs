//! Tracing-vendor API client for optional log enrichment
//!
//! Querying the vendor for the set of services its log index already knows
//! is enrichment, not core infrastructure: failures are logged as warnings
//! and provisioning continues with an empty set.

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

/// Read side of the vendor's log-index API.
#[async_trait]
pub trait LogIndexClient: Send + Sync {
    async fn log_ready_services(&self) -> anyhow::Result<Vec<String>>;
}

/// HTTP client for the Datadog API.
pub struct DatadogClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
}

impl DatadogClient {
    pub fn new(api_key: impl Into<String>, site: &str) -> anyhow::Result<Self> {
        let base_url = Url::parse(&format!("https://api.{}", site))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            api_key: api_key.into(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ServiceListResponse {
    data: Vec<ServiceEntry>,
}

#[derive(Debug, Deserialize)]
struct ServiceEntry {
    id: String,
}

#[async_trait]
impl LogIndexClient for DatadogClient {
    async fn log_ready_services(&self) -> anyhow::Result<Vec<String>> {
        let endpoint = self.base_url.join("/api/v2/services")?;
        let response = self
            .http
            .get(endpoint)
            .header("DD-API-KEY", &self.api_key)
            .send()
            .await?
            .error_for_status()?;
        let body: ServiceListResponse = response.json().await?;
        Ok(body.data.into_iter().map(|entry| entry.id).collect())
    }
}

/// Best-effort wrapper: a failed query downgrades to a warning and an empty
/// list instead of aborting the provisioning run.
pub async fn fetch_log_ready_services(client: &dyn LogIndexClient) -> Vec<String> {
    match client.log_ready_services().await {
        Ok(services) => services,
        Err(err) => {
            tracing::warn!("failed to query log-ready services, continuing without: {err:#}");
            Vec::new()
        }
    }
}
