//! Devices, readings and the provider field mapping
//!
//! Provider payloads are flat JSON objects whose field names depend on how the
//! upstream channel was configured (`field1`..`field8` and so on). A
//! [`FieldMapping`] translates them into the canonical names dashboards use.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

/// Raw provider payload, exactly as returned upstream
pub type RawReading = Map<String, Value>;

/// A polled sensor device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Identifier handed over by the request layer
    pub id: String,
    /// Provider channel identifier
    pub channel: String,
    /// Stored credential: `enc:v1:` ciphertext, or plaintext for legacy records
    pub api_key: String,
    /// Canonical field mapping; raw fields pass through when absent
    #[serde(default)]
    pub mapping: Option<FieldMapping>,
}

impl Device {
    pub fn latest_cache_key(&self) -> String {
        format!("device:{}:latest", self.id)
    }

    pub fn history_cache_key(&self, results: usize) -> String {
        format!("{}{}", self.history_cache_prefix(), results)
    }

    pub fn history_cache_prefix(&self) -> String {
        format!("device:{}:history:", self.id)
    }

    /// Per-device push topic
    pub fn topic(&self) -> String {
        format!("device:{}", self.id)
    }
}

/// Where a canonical field is read from in the provider payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldSource {
    /// Top-level field, e.g. `field1`
    Field(String),
    /// Dotted path into nested objects, e.g. `channel.latitude`
    Path(Vec<String>),
}

impl From<String> for FieldSource {
    fn from(source: String) -> Self {
        if source.contains('.') {
            FieldSource::Path(source.split('.').map(str::to_string).collect())
        } else {
            FieldSource::Field(source)
        }
    }
}

impl From<FieldSource> for String {
    fn from(source: FieldSource) -> Self {
        match source {
            FieldSource::Field(name) => name,
            FieldSource::Path(segments) => segments.join("."),
        }
    }
}

impl FieldSource {
    /// Look the source up in a payload; `None` when any segment is missing
    pub fn lookup<'a>(&self, raw: &'a RawReading) -> Option<&'a Value> {
        match self {
            FieldSource::Field(name) => raw.get(name),
            FieldSource::Path(segments) => {
                let (first, rest) = segments.split_first()?;
                let mut current = raw.get(first)?;
                for segment in rest {
                    current = current.as_object()?.get(segment)?;
                }
                Some(current)
            }
        }
    }
}

/// One canonical field and its provider source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingRule {
    pub canonical: String,
    pub source: FieldSource,
}

/// Ordered canonical-field → provider-field table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMapping {
    rules: Vec<MappingRule>,
}

impl FieldMapping {
    pub fn new(rules: Vec<MappingRule>) -> Self {
        Self { rules }
    }

    /// Build from `(canonical, source)` pairs
    pub fn from_pairs<I, C, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (C, S)>,
        C: Into<String>,
        S: Into<String>,
    {
        let rules = pairs
            .into_iter()
            .map(|(canonical, source)| MappingRule {
                canonical: canonical.into(),
                source: FieldSource::from(source.into()),
            })
            .collect();
        Self { rules }
    }

    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply the table. Missing or null sources are left out.
    pub fn apply(&self, raw: &RawReading) -> Map<String, Value> {
        let mut fields = Map::new();
        for rule in &self.rules {
            match rule.source.lookup(raw) {
                Some(Value::Null) | None => {}
                Some(value) => {
                    fields.insert(rule.canonical.clone(), coerce_numeric(value));
                }
            }
        }
        fields
    }
}

/// Providers often ship numbers as strings; turn those into JSON numbers
fn coerce_numeric(value: &Value) -> Value {
    let Value::String(text) = value else {
        return value.clone();
    };
    let trimmed = text.trim();
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::Number(int.into());
    }
    match trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        Some(number) => Value::Number(number),
        None => value.clone(),
    }
}

/// A normalized reading for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    /// Provider-side timestamp, when the payload carries one
    pub observed_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub fields: Map<String, Value>,
    /// SHA-256 over `observed_at` and `fields`
    pub digest: String,
}

impl Reading {
    /// Normalize a raw payload
    pub fn from_raw(
        device_id: &str,
        raw: &RawReading,
        mapping: Option<&FieldMapping>,
        timestamp_field: &str,
    ) -> Self {
        let fields = match mapping {
            Some(mapping) if !mapping.is_empty() => mapping.apply(raw),
            _ => raw.clone(),
        };

        let observed_at = raw
            .get(timestamp_field)
            .and_then(Value::as_str)
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));

        let digest = compute_digest(observed_at.as_ref(), &fields);

        Self {
            device_id: device_id.to_string(),
            observed_at,
            fetched_at: Utc::now(),
            fields,
            digest,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

fn compute_digest(observed_at: Option<&DateTime<Utc>>, fields: &Map<String, Value>) -> String {
    let mut hasher = Sha256::new();
    if let Some(ts) = observed_at {
        hasher.update(ts.to_rfc3339().as_bytes());
    }
    hasher.update([0u8]);
    // serde_json maps are key-ordered, so this is canonical
    hasher.update(Value::Object(fields.clone()).to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawReading {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_mapping_renames_and_coerces() {
        let mapping = FieldMapping::from_pairs([("temperature", "field1"), ("humidity", "field2")]);
        let payload = raw(json!({"field1": "21.5", "field2": "40", "field3": "x"}));

        let fields = mapping.apply(&payload);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["temperature"], json!(21.5));
        assert_eq!(fields["humidity"], json!(40));
    }

    #[test]
    fn test_mapping_missing_fields_are_absent() {
        let mapping = FieldMapping::from_pairs([("temperature", "field1"), ("battery", "field7")]);
        let payload = raw(json!({"field1": 20, "field7": null}));

        let fields = mapping.apply(&payload);
        assert_eq!(fields.len(), 1);
        assert!(!fields.contains_key("battery"));
    }

    #[test]
    fn test_mapping_nested_path() {
        let mapping = FieldMapping::from_pairs([("lat", "channel.latitude"), ("bad", "channel.nope.deeper")]);
        let payload = raw(json!({"channel": {"latitude": "59.91"}}));

        let fields = mapping.apply(&payload);
        assert_eq!(fields["lat"], json!(59.91));
        assert!(!fields.contains_key("bad"));
    }

    #[test]
    fn test_non_numeric_strings_kept() {
        let mapping = FieldMapping::from_pairs([("status", "field1")]);
        let fields = mapping.apply(&raw(json!({"field1": "ok"})));
        assert_eq!(fields["status"], json!("ok"));
    }

    #[test]
    fn test_no_mapping_passes_raw_through() {
        let payload = raw(json!({"field1": "10", "created_at": "2024-03-01T10:00:00Z"}));
        let reading = Reading::from_raw("D1", &payload, None, "created_at");

        assert_eq!(reading.fields, payload);
        assert_eq!(
            reading.observed_at.map(|t| t.to_rfc3339()),
            Some("2024-03-01T10:00:00+00:00".to_string())
        );
    }

    #[test]
    fn test_digest_tracks_content() {
        let mapping = FieldMapping::from_pairs([("value", "field1")]);
        let a = Reading::from_raw("D1", &raw(json!({"field1": 10})), Some(&mapping), "created_at");
        let b = Reading::from_raw("D1", &raw(json!({"field1": 10})), Some(&mapping), "created_at");
        let c = Reading::from_raw("D1", &raw(json!({"field1": 11})), Some(&mapping), "created_at");

        assert_eq!(a.digest, b.digest);
        assert_ne!(a.digest, c.digest);
        assert_eq!(a.digest.len(), 64);
    }

    #[test]
    fn test_mapping_toml_roundtrip() {
        #[derive(Deserialize)]
        struct Wrapper {
            mapping: FieldMapping,
        }
        let parsed: Wrapper = toml::from_str(
            r#"
            mapping = [
                { canonical = "temperature", source = "field1" },
                { canonical = "lat", source = "channel.latitude" },
            ]
            "#,
        )
        .unwrap();

        assert_eq!(parsed.mapping.rules().len(), 2);
        assert_eq!(parsed.mapping.rules()[0].canonical, "temperature");
        assert_eq!(
            parsed.mapping.rules()[1].source,
            FieldSource::Path(vec!["channel".into(), "latitude".into()])
        );
    }

    #[test]
    fn test_cache_keys() {
        let device = Device {
            id: "42".into(),
            channel: "1001".into(),
            api_key: "k".into(),
            mapping: None,
        };
        assert_eq!(device.latest_cache_key(), "device:42:latest");
        assert_eq!(device.history_cache_key(10), "device:42:history:10");
        assert!(device.history_cache_key(10).starts_with(&device.history_cache_prefix()));
        assert_eq!(device.topic(), "device:42");
    }
}
