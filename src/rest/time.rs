//! Server time over HTTP

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use timesync::{ClockError, TimeSource};
use tracing::debug;

/// Reads the exchange's clock from a JSON time endpoint.
///
/// The response must contain Unix milliseconds at `field`, which may name a
/// nested member with dots (`"data.serverTime"`).
pub struct HttpTimeSource {
    client: Client,
    url: String,
    field: String,
    timeout: Duration,
}

impl HttpTimeSource {
    pub fn new(url: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            field: field.into(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Extract Unix milliseconds from a time response
pub fn parse_server_time(body: &Value, field: &str) -> Result<i64, ClockError> {
    let value = field
        .split('.')
        .try_fold(body, |node, key| node.get(key))
        .ok_or_else(|| ClockError::Source(format!("missing field '{}'", field)))?;

    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| ClockError::Source(format!("field '{}' is not an integer: {}", field, value)))
}

#[async_trait]
impl TimeSource for HttpTimeSource {
    async fn fetch_time(&self) -> Result<i64, ClockError> {
        let response = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ClockError::Source(e.to_string()))?
            .error_for_status()
            .map_err(|e| ClockError::Source(e.to_string()))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| ClockError::Source(e.to_string()))?;

        let server_time = parse_server_time(&body, &self.field)?;
        debug!("Server time from {}: {}", self.url, server_time);
        Ok(server_time)
    }
}
