//! Flow Statistics Aggregator (C6): pulls per-flow counters from the data
//! plane and rolls them up into per-device windows (spec §4.6).

use crate::collaborators::rule_installer::RuleInstaller;
use crate::config::FlowAggregatorConfig;
use crate::identity::IdentityStore;
use crate::types::{DeviceFlowStats, DeviceId, FlowSample};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Rolling per-device flow windows, bounded to `window_size` samples each
/// (spec §4.6). Per-switch failures degrade to skipping that switch only.
pub struct FlowAggregator {
    config: FlowAggregatorConfig,
    identity: Arc<IdentityStore>,
    rule_installer: Arc<dyn RuleInstaller>,
    windows: DashMap<DeviceId, VecDeque<FlowSample>>,
}

impl FlowAggregator {
    pub fn new(config: FlowAggregatorConfig, identity: Arc<IdentityStore>, rule_installer: Arc<dyn RuleInstaller>) -> Self {
        Self {
            config,
            identity,
            rule_installer,
            windows: DashMap::new(),
        }
    }

    /// Poll every configured switch, resolve each flow's device, and append
    /// to its rolling window. Unknown-MAC flows are discarded, not
    /// attributed (spec §9 redesign flag). Returns the number of samples
    /// appended.
    pub async fn poll_once(&self) -> usize {
        let mut appended = 0;

        for switch_id in &self.config.switch_ids {
            let samples = match self.rule_installer.query_flows(switch_id).await {
                Ok(samples) => samples,
                Err(e) => {
                    tracing::warn!(switch_id, error = %e, "flow query failed, skipping switch this tick");
                    continue;
                }
            };

            for sample in samples {
                let device = match self.identity.get_device_by_mac(&sample.eth_src).await {
                    Ok(Some(d)) => d,
                    Ok(None) => {
                        tracing::debug!(mac = %sample.eth_src, "discarding flow sample for unknown MAC");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "identity lookup failed for flow sample");
                        continue;
                    }
                };

                let duration = sample.duration_secs.max(0.001);
                let flow_sample = FlowSample {
                    device_id: device.device_id.clone(),
                    packets: sample.packets,
                    bytes: sample.bytes,
                    duration_secs: sample.duration_secs,
                    pps: sample.packets as f64 / duration,
                    bps: (sample.bytes * 8) as f64 / duration,
                    destination: sample.destination,
                    dest_port: sample.dest_port,
                    protocol: sample.protocol,
                    sampled_at: Utc::now(),
                };

                let mut window = self.windows.entry(device.device_id).or_insert_with(VecDeque::new);
                if window.len() >= self.config.window_size {
                    window.pop_front();
                }
                window.push_back(flow_sample);
                appended += 1;
            }
        }

        appended
    }

    /// Snapshot a device's rolling window without holding a lock during
    /// subsequent heuristic evaluation (spec §5).
    pub fn snapshot(&self, device_id: &str) -> Vec<FlowSample> {
        self.windows
            .get(device_id)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Aggregate one device's window over the trailing `window_seconds`.
    pub fn device_stats(&self, device_id: &str, window_seconds: i64) -> DeviceFlowStats {
        aggregate(&self.snapshot(device_id), window_seconds)
    }

    /// Aggregate every known device's window over the trailing `window_seconds`.
    pub fn all_device_stats(&self, window_seconds: i64) -> std::collections::HashMap<DeviceId, DeviceFlowStats> {
        self.windows
            .iter()
            .map(|entry| {
                let samples: Vec<FlowSample> = entry.value().iter().cloned().collect();
                (entry.key().clone(), aggregate(&samples, window_seconds))
            })
            .collect()
    }
}

fn aggregate(samples: &[FlowSample], window_seconds: i64) -> DeviceFlowStats {
    let cutoff = Utc::now() - chrono::Duration::seconds(window_seconds);
    let recent: Vec<&FlowSample> = samples.iter().filter(|s| s.sampled_at >= cutoff).collect();

    if recent.is_empty() {
        return DeviceFlowStats::default();
    }

    let total_packets: u64 = recent.iter().map(|s| s.packets).sum();
    let total_bytes: u64 = recent.iter().map(|s| s.bytes).sum();
    let avg_pps = recent.iter().map(|s| s.pps).sum::<f64>() / recent.len() as f64;
    let avg_bps = recent.iter().map(|s| s.bps).sum::<f64>() / recent.len() as f64;
    let unique_destinations = recent.iter().map(|s| s.destination.clone()).collect::<HashSet<_>>().len();
    let unique_ports = recent.iter().map(|s| s.dest_port).collect::<HashSet<_>>().len();

    DeviceFlowStats {
        total_packets,
        total_bytes,
        avg_pps,
        avg_bps,
        unique_destinations,
        unique_ports,
        flow_count: recent.len(),
    }
}
