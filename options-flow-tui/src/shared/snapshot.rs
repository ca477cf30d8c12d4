//! Startup snapshot fetched from the flow backend REST endpoints

use crate::shared::error::DashboardError;
use crate::shared::types::{
    AnomalyRecord, DashboardSnapshotResponse, FlowHistoryResponse, MarketStateResponse,
    SamplePoint,
};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Results of the three startup requests. Each one fails independently.
#[derive(Debug)]
pub struct BootstrapData {
    pub flow: Result<Vec<SamplePoint>, DashboardError>,
    pub anomalies: Result<Vec<AnomalyRecord>, DashboardError>,
    pub market: Result<MarketStateResponse, DashboardError>,
}

#[derive(Debug, Clone)]
pub struct SnapshotLoader {
    client: reqwest::Client,
    backend: Url,
    hours: u32,
}

impl SnapshotLoader {
    pub fn new(backend: &str, hours: u32) -> Result<Self, DashboardError> {
        let backend = Url::parse(backend)
            .map_err(|e| DashboardError::Http(format!("bad backend URL {backend}: {e}")))?;
        Ok(Self {
            client: reqwest::Client::new(),
            backend,
            hours,
        })
    }

    pub fn flow_url(&self) -> Result<Url, DashboardError> {
        let mut url = endpoint(&self.backend, "flow/snapshot")?;
        url.query_pairs_mut()
            .append_pair("hours", &self.hours.to_string());
        Ok(url)
    }

    pub fn anomalies_url(&self) -> Result<Url, DashboardError> {
        endpoint(&self.backend, "api/dashboard/snapshot")
    }

    pub fn market_url(&self) -> Result<Url, DashboardError> {
        endpoint(&self.backend, "api/market/state")
    }

    /// Run all three requests concurrently
    pub async fn load_all(&self) -> BootstrapData {
        let (flow, anomalies, market) = tokio::join!(
            self.fetch_flow_history(),
            self.fetch_anomalies(),
            self.fetch_market_state()
        );
        BootstrapData {
            flow,
            anomalies,
            market,
        }
    }

    pub async fn fetch_flow_history(&self) -> Result<Vec<SamplePoint>, DashboardError> {
        let response: FlowHistoryResponse = self.get_json(self.flow_url()?).await?;
        if response.count != response.history.len() {
            warn!(
                count = response.count,
                rows = response.history.len(),
                "flow snapshot count mismatch"
            );
        }
        let samples: Vec<SamplePoint> = response.history.iter().map(|row| row.to_sample()).collect();
        info!(samples = samples.len(), hours = self.hours, "loaded flow snapshot");
        Ok(samples)
    }

    pub async fn fetch_anomalies(&self) -> Result<Vec<AnomalyRecord>, DashboardError> {
        let response: DashboardSnapshotResponse = self.get_json(self.anomalies_url()?).await?;
        Ok(parse_anomalies(response.anomalies))
    }

    pub async fn fetch_market_state(&self) -> Result<MarketStateResponse, DashboardError> {
        self.get_json(self.market_url()?).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, DashboardError> {
        let response = self
            .client
            .get(url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DashboardError::Status(response.status().as_u16()));
        }

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

fn endpoint(base: &Url, path: &str) -> Result<Url, DashboardError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path)
        .map_err(|e| DashboardError::Http(format!("bad endpoint {path}: {e}")))
}

/// Decode anomaly snapshot entries, skipping the ones that do not parse
pub fn parse_anomalies(raw: Vec<serde_json::Value>) -> Vec<AnomalyRecord> {
    let total = raw.len();
    let parsed: Vec<AnomalyRecord> = raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<AnomalyRecord>(value) {
            Ok(anomaly) => Some(anomaly),
            Err(err) => {
                warn!(%err, "skipping malformed anomaly");
                None
            }
        })
        .collect();

    if parsed.len() < total {
        warn!(skipped = total - parsed.len(), "anomaly snapshot had malformed entries");
    }
    parsed
}
