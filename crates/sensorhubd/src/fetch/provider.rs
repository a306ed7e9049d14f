//! Upstream telemetry provider
//!
//! The provider answers JSON over HTTP GET. Paths, query parameter names and the
//! key holding history items all come from [`ProviderConfig`].

use async_trait::async_trait;
use sensorhub_common::config::ProviderConfig;
use sensorhub_common::RawReading;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Request result classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Success,
    NetworkError,
    Timeout,
    Http4xx,
    Http5xx,
    DecodeError,
    NoData,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NetworkError => "network_error",
            Self::Timeout => "timeout",
            Self::Http4xx => "http_4xx",
            Self::Http5xx => "http_5xx",
            Self::DecodeError => "decode_error",
            Self::NoData => "no_data",
        }
    }

    /// Determine if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkError | Self::Http5xx | Self::Timeout)
    }
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream returned HTTP {0}")]
    Http(u16),

    #[error("undecodable response: {0}")]
    Decode(String),

    /// The upstream answered but holds no reading
    #[error("no reading available")]
    NoData,
}

impl ProviderError {
    pub fn status(&self) -> RequestStatus {
        match self {
            Self::Timeout => RequestStatus::Timeout,
            Self::Network(_) => RequestStatus::NetworkError,
            Self::Http(code) if (400..500).contains(code) => RequestStatus::Http4xx,
            Self::Http(_) => RequestStatus::Http5xx,
            Self::Decode(_) => RequestStatus::DecodeError,
            Self::NoData => RequestStatus::NoData,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.status().is_retryable()
    }
}

/// Source of raw readings for a provider channel
#[async_trait]
pub trait TelemetryProvider: Send + Sync {
    /// Most recent reading of `channel`
    async fn latest(&self, channel: &str, api_key: &str) -> Result<RawReading, ProviderError>;

    /// Up to `results` readings, oldest first
    async fn history(
        &self,
        channel: &str,
        api_key: &str,
        results: usize,
    ) -> Result<Vec<RawReading>, ProviderError>;
}

/// reqwest-backed provider client
pub struct HttpProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl HttpProvider {
    /// Per-attempt timeouts are applied by the caller, not the client
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sensorhubd/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn url(&self, template: &str, channel: &str) -> String {
        format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            template.replace("{channel}", channel)
        )
    }

    /// Classify request error
    fn classify_error(err: &reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if let Some(status) = err.status() {
            ProviderError::Http(status.as_u16())
        } else if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value, ProviderError> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| Self::classify_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Http(status.as_u16()));
        }

        let body = response.text().await.map_err(|e| Self::classify_error(&e))?;
        parse_body(&body)
    }
}

/// Decode a response body. The provider answers `-1` for an empty channel.
fn parse_body(body: &str) -> Result<Value, ProviderError> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "-1" {
        return Err(ProviderError::NoData);
    }
    serde_json::from_str(trimmed).map_err(|e| ProviderError::Decode(e.to_string()))
}

fn latest_from_value(value: Value) -> Result<RawReading, ProviderError> {
    match value {
        Value::Object(map) if map.is_empty() => Err(ProviderError::NoData),
        Value::Object(map) => Ok(map),
        Value::Null => Err(ProviderError::NoData),
        Value::Number(n) if n.as_i64() == Some(-1) => Err(ProviderError::NoData),
        other => Err(ProviderError::Decode(format!(
            "expected an object, got {}",
            json_kind(&other)
        ))),
    }
}

fn history_from_value(value: Value, items_key: &str) -> Result<Vec<RawReading>, ProviderError> {
    let items = match value {
        Value::Object(mut map) => match map.remove(items_key) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => return Err(ProviderError::NoData),
            Some(other) => {
                return Err(ProviderError::Decode(format!(
                    "`{}` is {}, expected an array",
                    items_key,
                    json_kind(&other)
                )))
            }
        },
        Value::Array(items) => items,
        Value::Number(n) if n.as_i64() == Some(-1) => return Err(ProviderError::NoData),
        other => {
            return Err(ProviderError::Decode(format!(
                "expected an object, got {}",
                json_kind(&other)
            )))
        }
    };

    Ok(items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .collect())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl TelemetryProvider for HttpProvider {
    async fn latest(&self, channel: &str, api_key: &str) -> Result<RawReading, ProviderError> {
        let url = self.url(&self.config.latest_path, channel);
        let query = [(self.config.api_key_param.as_str(), api_key.to_string())];
        let value = self.get_json(&url, &query).await?;
        latest_from_value(value)
    }

    async fn history(
        &self,
        channel: &str,
        api_key: &str,
        results: usize,
    ) -> Result<Vec<RawReading>, ProviderError> {
        let url = self.url(&self.config.history_path, channel);
        let query = [
            (self.config.api_key_param.as_str(), api_key.to_string()),
            (self.config.results_param.as_str(), results.to_string()),
        ];
        let value = self.get_json(&url, &query).await?;
        history_from_value(value, &self.config.history_items_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classification() {
        assert_eq!(ProviderError::Http(404).status(), RequestStatus::Http4xx);
        assert_eq!(ProviderError::Http(429).status(), RequestStatus::Http4xx);
        assert_eq!(ProviderError::Http(503).status(), RequestStatus::Http5xx);
        assert!(ProviderError::Http(503).is_retryable());
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Network("reset".into()).is_retryable());
        assert!(!ProviderError::Http(401).is_retryable());
        assert!(!ProviderError::Decode("eof".into()).is_retryable());
        assert!(!ProviderError::NoData.is_retryable());
    }

    #[test]
    fn test_parse_body_sentinel() {
        assert!(matches!(parse_body("-1"), Err(ProviderError::NoData)));
        assert!(matches!(parse_body("  "), Err(ProviderError::NoData)));
        assert!(matches!(parse_body("{oops"), Err(ProviderError::Decode(_))));
        assert_eq!(parse_body("{\"a\":1}").unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_latest_shapes() {
        let reading = latest_from_value(json!({"field1": "21.5"})).unwrap();
        assert_eq!(reading.get("field1"), Some(&json!("21.5")));

        assert!(matches!(latest_from_value(json!({})), Err(ProviderError::NoData)));
        assert!(matches!(latest_from_value(json!(-1)), Err(ProviderError::NoData)));
        assert!(matches!(latest_from_value(json!([1, 2])), Err(ProviderError::Decode(_))));
    }

    #[test]
    fn test_history_shapes() {
        let value = json!({
            "channel": {"id": 1001},
            "feeds": [{"field1": "1"}, "junk", {"field1": "2"}]
        });
        let items = history_from_value(value, "feeds").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].get("field1"), Some(&json!("2")));

        assert!(matches!(
            history_from_value(json!({"channel": {}}), "feeds"),
            Err(ProviderError::NoData)
        ));
        assert!(matches!(
            history_from_value(json!({"feeds": "x"}), "feeds"),
            Err(ProviderError::Decode(_))
        ));
        assert_eq!(history_from_value(json!([{"a": 1}]), "feeds").unwrap().len(), 1);
    }

    #[test]
    fn test_url_template() {
        let provider = HttpProvider::new(ProviderConfig {
            base_url: "http://upstream.local/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            provider.url(&provider.config.latest_path, "1001"),
            "http://upstream.local/channels/1001/feeds/last.json"
        );
    }
}
