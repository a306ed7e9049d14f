//! Device polling loops
//!
//! Devices are split round-robin across shards; each shard is one long-lived
//! task. A cycle refreshes every device in the shard, and only readings whose
//! digest changed are handed to the job manager.

use crate::fetch::TelemetryFetchService;
use crate::jobs::JobManager;
use sensorhub_common::config::PollerConfig;
use sensorhub_common::protocol::NODE_UPDATES_TOPIC;
use sensorhub_common::{Device, Reading};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Split devices round-robin into `shards` groups; empty groups are dropped
pub fn shard_devices(devices: &[Device], shards: usize) -> Vec<Vec<Device>> {
    let shards = shards.max(1);
    let mut groups: Vec<Vec<Device>> = vec![Vec::new(); shards];
    for (index, device) in devices.iter().enumerate() {
        groups[index % shards].push(device.clone());
    }
    groups.retain(|group| !group.is_empty());
    groups
}

/// One shard's devices and the last digest seen for each
pub struct ShardPoller {
    index: usize,
    devices: Vec<Device>,
    fetch: Arc<TelemetryFetchService>,
    jobs: Arc<JobManager>,
    last_digest: HashMap<String, String>,
}

impl ShardPoller {
    pub fn new(
        index: usize,
        devices: Vec<Device>,
        fetch: Arc<TelemetryFetchService>,
        jobs: Arc<JobManager>,
    ) -> Self {
        Self {
            index,
            devices,
            fetch,
            jobs,
            last_digest: HashMap::new(),
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Poll every device once; returns how many new readings were enqueued.
    /// Cancellation is honoured between devices, never mid-fetch.
    pub async fn poll_cycle(&mut self, cancel: &CancellationToken) -> usize {
        let mut fresh = 0;
        for i in 0..self.devices.len() {
            if cancel.is_cancelled() {
                break;
            }
            let device = self.devices[i].clone();
            let Some(reading) = self.fetch.refresh_latest(&device).await else {
                continue;
            };
            if self.accept(&device, reading) {
                fresh += 1;
            }
        }
        fresh
    }

    /// Hand a reading to the job manager unless it repeats the previous one
    fn accept(&mut self, device: &Device, reading: Reading) -> bool {
        if self.last_digest.get(&device.id) == Some(&reading.digest) {
            debug!(device = %device.id, "Reading unchanged, skipping");
            return false;
        }
        self.last_digest
            .insert(device.id.clone(), reading.digest.clone());

        let payload = match serde_json::to_value(&reading) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(device = %device.id, "Failed to encode reading: {}", e);
                return false;
            }
        };

        self.jobs.enqueue_write(reading);
        self.jobs
            .enqueue_broadcast(NODE_UPDATES_TOPIC, device.id.clone(), payload.clone());
        self.jobs
            .enqueue_broadcast(device.topic(), device.id.clone(), payload);
        self.jobs.enqueue_invalidate(device.history_cache_prefix());
        true
    }

    /// Poll until cancelled, sleeping `interval` between cycles
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        info!(
            "Poller shard {} started ({} devices, every {:?})",
            self.index,
            self.devices.len(),
            interval
        );

        loop {
            let fresh = self.poll_cycle(&cancel).await;
            debug!("Shard {} cycle done, {} new readings", self.index, fresh);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Poller shard {} stopped", self.index);
    }
}

/// Spawn one task per non-empty shard
pub fn spawn_pollers(
    devices: &[Device],
    config: &PollerConfig,
    fetch: Arc<TelemetryFetchService>,
    jobs: Arc<JobManager>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let interval = Duration::from_secs(config.interval_secs);
    shard_devices(devices, config.shards)
        .into_iter()
        .enumerate()
        .map(|(index, group)| {
            let shard = ShardPoller::new(index, group, Arc::clone(&fetch), Arc::clone(&jobs));
            tokio::spawn(shard.run(interval, cancel.clone()))
        })
        .collect()
}
