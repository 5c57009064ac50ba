//! Time-series sink for weather sensor samples

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::TimeSeriesConfig;
use crate::error::{BridgeError, Result};

/// One temperature/humidity sample
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSample {
    /// Kind of source, e.g. `"rf-weather"`
    pub source_name: String,
    /// Source identifier (house/station of an RF sensor)
    pub source_id: Option<String>,
    /// Channel on the source
    pub channel: Option<String>,
    /// Celsius
    pub temperature: Option<f64>,
    /// Percent relative humidity
    pub humidity: Option<f64>,
}

impl SensorSample {
    /// Both values present
    pub fn is_complete(&self) -> bool {
        self.temperature.is_some() && self.humidity.is_some()
    }
}

/// Destination for sensor samples
#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    /// Store a sample. Incomplete samples are skipped with a warning.
    async fn record(&self, sample: &SensorSample) -> Result<()>;
}

/// Sink that discards samples
#[derive(Debug, Clone, Default)]
pub struct NullTimeSeries;

#[async_trait]
impl TimeSeriesSink for NullTimeSeries {
    async fn record(&self, sample: &SensorSample) -> Result<()> {
        debug!(source = %sample.source_name, "Sample dropped (no time-series sink)");
        Ok(())
    }
}

/// InfluxDB 1.x `/write` endpoint
#[derive(Debug, Clone)]
pub struct InfluxSink {
    client: reqwest::Client,
    write_url: String,
    database: String,
    measurement: String,
}

impl InfluxSink {
    /// Create from configuration; `None` when no URL is set
    pub fn from_config(config: &TimeSeriesConfig) -> Result<Option<Self>> {
        let Some(url) = &config.url else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BridgeError::sink("timeseries", e))?;
        Ok(Some(Self {
            client,
            write_url: format!("{}/write", url.trim_end_matches('/')),
            database: config.database.clone(),
            measurement: config.measurement.clone(),
        }))
    }

    /// Render a complete sample as one line of line protocol
    pub fn line_protocol(&self, sample: &SensorSample, temperature: f64, humidity: f64) -> String {
        let unknown = "unknown".to_string();
        format!(
            "{},model={},sensor_id={},channel={} temperature={},humidity={}",
            escape_key(&self.measurement),
            escape_key(&sample.source_name),
            escape_key(sample.source_id.as_ref().unwrap_or(&unknown)),
            escape_key(sample.channel.as_ref().unwrap_or(&unknown)),
            temperature,
            humidity
        )
    }
}

#[async_trait]
impl TimeSeriesSink for InfluxSink {
    async fn record(&self, sample: &SensorSample) -> Result<()> {
        let (Some(temperature), Some(humidity)) = (sample.temperature, sample.humidity) else {
            warn!(
                source = %sample.source_name,
                temperature = ?sample.temperature,
                humidity = ?sample.humidity,
                "Incomplete sample, not written"
            );
            return Ok(());
        };

        let line = self.line_protocol(sample, temperature, humidity);
        let response = self
            .client
            .post(&self.write_url)
            .query(&[("db", self.database.as_str())])
            .body(line)
            .send()
            .await
            .map_err(|e| BridgeError::sink("timeseries", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::sink(
                "timeseries",
                format!("HTTP {}: {}", status, body.trim()),
            ));
        }

        debug!(temperature, humidity, "Sample written");
        Ok(())
    }
}

// Tag keys and values escape commas, spaces and equals signs.
fn escape_key(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | ' ' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sink() -> InfluxSink {
        InfluxSink::from_config(&TimeSeriesConfig {
            url: Some("http://127.0.0.1:9/".to_string()),
            timeout: Duration::from_millis(200),
            ..Default::default()
        })
        .unwrap()
        .unwrap()
    }

    fn sample() -> SensorSample {
        SensorSample {
            source_name: "rf-weather".to_string(),
            source_id: Some("1-1".to_string()),
            channel: None,
            temperature: Some(21.5),
            humidity: Some(45.0),
        }
    }

    #[test]
    fn test_disabled_without_url() {
        assert!(InfluxSink::from_config(&TimeSeriesConfig::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_write_url() {
        assert_eq!(sink().write_url, "http://127.0.0.1:9/write");
    }

    #[test]
    fn test_line_protocol() {
        let line = sink().line_protocol(&sample(), 21.5, 45.0);
        assert_eq!(
            line,
            "readings,model=rf-weather,sensor_id=1-1,channel=unknown temperature=21.5,humidity=45"
        );
    }

    #[test]
    fn test_escape_tags() {
        assert_eq!(escape_key("living room,north"), "living\\ room\\,north");
        assert_eq!(escape_key("a=b"), "a\\=b");
    }

    #[tokio::test]
    async fn test_incomplete_sample_skipped() {
        let mut incomplete = sample();
        incomplete.humidity = None;
        assert!(!incomplete.is_complete());
        // Would fail to connect if a request were made
        assert!(sink().record(&incomplete).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_sink_error() {
        let err = sink().record(&sample()).await.unwrap_err();
        assert!(matches!(err, BridgeError::ExternalSink { sink: "timeseries", .. }));
    }
}
