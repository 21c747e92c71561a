use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::error::SourceError;
use crate::model::{HistorySnapshot, PollSnapshot};

/// Remote telemetry server the engine polls
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// `GET /history`
    async fn fetch_history(&self) -> Result<HistorySnapshot, SourceError>;

    /// `GET /data`, or `GET /data?since=<watermark>` once a watermark exists
    async fn fetch_data(&self, since: Option<&str>) -> Result<PollSnapshot, SourceError>;

    /// `POST /clear`
    async fn clear(&self) -> Result<(), SourceError>;
}

#[async_trait]
impl<T: TelemetrySource + ?Sized> TelemetrySource for Arc<T> {
    async fn fetch_history(&self) -> Result<HistorySnapshot, SourceError> {
        (**self).fetch_history().await
    }

    async fn fetch_data(&self, since: Option<&str>) -> Result<PollSnapshot, SourceError> {
        (**self).fetch_data(since).await
    }

    async fn clear(&self) -> Result<(), SourceError> {
        (**self).clear().await
    }
}

/// HTTP client for the dashboard server's JSON endpoints
///
/// # Error Handling
/// - connect failures / timeouts → `SourceError::Network` / `Timeout`
/// - non-2xx status → `SourceError::Http(code)`
/// - body that is not the expected JSON shape → `SourceError::Parse`
///
/// No retries here: the poll loop's next tick is the retry.
pub struct HttpTelemetrySource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTelemetrySource {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sensor_dashboard_rs/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        HttpTelemetrySource {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// CSV download location. The engine never fetches it.
    pub fn export_url(&self) -> String {
        self.url("/export")
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json(&self, request: reqwest::RequestBuilder) -> Result<Value, SourceError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Http(status.as_u16()));
        }
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl TelemetrySource for HttpTelemetrySource {
    async fn fetch_history(&self) -> Result<HistorySnapshot, SourceError> {
        let value = self.get_json(self.client.get(self.url("/history"))).await?;
        Ok(HistorySnapshot::from_value(value))
    }

    async fn fetch_data(&self, since: Option<&str>) -> Result<PollSnapshot, SourceError> {
        let mut request = self.client.get(self.url("/data"));
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }
        let value = self.get_json(request).await?;
        PollSnapshot::parse(&value)
    }

    async fn clear(&self) -> Result<(), SourceError> {
        let response = self.client.post(self.url("/clear")).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Http(status.as_u16()));
        }
        Ok(())
    }
}
