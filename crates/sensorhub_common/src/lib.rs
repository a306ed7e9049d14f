//! SensorHub common types shared by the daemon and the control CLI.

pub mod backoff;
pub mod config;
pub mod protocol;
pub mod reading;
pub mod secrets;
pub mod status;

pub use backoff::BackoffConfig;
pub use config::{DeviceConfig, HubConfig};
pub use protocol::{Envelope, MessageKind};
pub use reading::{Device, FieldMapping, FieldSource, MappingRule, RawReading, Reading};
pub use secrets::{AesGcmSecretStore, SecretError, SecretStore};
pub use status::{ConnectionStats, JobStats, PipelineStats, UpstreamHealth};
