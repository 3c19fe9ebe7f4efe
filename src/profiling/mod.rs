//! Behavioral Profiler (C5): time-bounded per-device traffic observation
//! producing a learned baseline (spec §4.5).

use crate::collaborators::rule_installer::FlowQuerySample;
use crate::config::ProfilingConfig;
use crate::error::{Error, Result};
use crate::identity::IdentityStore;
use crate::types::{BehavioralBaseline, DeviceId};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// One in-flight profiling accumulator.
struct Accumulator {
    packet_count: u64,
    byte_count: u64,
    destinations: HashMap<String, u64>,
    ports: HashMap<u16, u64>,
    protocols: HashMap<String, u64>,
    started_at: Instant,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            packet_count: 0,
            byte_count: 0,
            destinations: HashMap::new(),
            ports: HashMap::new(),
            protocols: HashMap::new(),
            started_at: Instant::now(),
        }
    }
}

/// One raw packet observation fed by C6 during profiling (spec §4.5).
#[derive(Debug, Clone)]
pub struct PacketInfo {
    pub bytes: u64,
    pub destination: String,
    pub dest_port: u16,
    pub protocol: String,
}

impl From<&FlowQuerySample> for PacketInfo {
    fn from(f: &FlowQuerySample) -> Self {
        Self {
            bytes: f.bytes,
            destination: f.destination.clone(),
            dest_port: f.dest_port,
            protocol: f.protocol.clone(),
        }
    }
}

/// Learns one [`BehavioralBaseline`] per device under active profiling.
pub struct BehavioralProfiler {
    config: ProfilingConfig,
    accumulators: DashMap<DeviceId, Accumulator>,
    identity: Arc<IdentityStore>,
}

impl BehavioralProfiler {
    pub fn new(config: ProfilingConfig, identity: Arc<IdentityStore>) -> Self {
        Self {
            config,
            accumulators: DashMap::new(),
            identity,
        }
    }

    /// Reset (or start) the accumulator for `device_id` (spec §4.5).
    pub fn begin(&self, device_id: &str) {
        self.accumulators.insert(device_id.to_string(), Accumulator::new());
        tracing::info!(device_id, "behavioral profiling started");
    }

    /// Record one packet observation. Ignored if `device_id` is not
    /// currently profiling.
    pub fn record(&self, device_id: &str, packet: &PacketInfo) {
        if let Some(mut acc) = self.accumulators.get_mut(device_id) {
            acc.packet_count += 1;
            acc.byte_count += packet.bytes;
            *acc.destinations.entry(packet.destination.clone()).or_insert(0) += 1;
            *acc.ports.entry(packet.dest_port).or_insert(0) += 1;
            *acc.protocols.entry(packet.protocol.clone()).or_insert(0) += 1;
        }
    }

    /// True iff `device_id` is profiling and its window has elapsed.
    pub fn is_expired(&self, device_id: &str) -> bool {
        self.accumulators
            .get(device_id)
            .map(|acc| acc.started_at.elapsed() >= self.config.duration)
            .unwrap_or(false)
    }

    /// True iff `device_id` currently has an active accumulator.
    pub fn is_profiling(&self, device_id: &str) -> bool {
        self.accumulators.contains_key(device_id)
    }

    /// Elapsed/remaining time for `GET /get_profiling_status` (spec §6).
    pub fn status(&self, device_id: &str) -> Option<(std::time::Duration, std::time::Duration)> {
        self.accumulators.get(device_id).map(|acc| {
            let elapsed = acc.started_at.elapsed();
            let remaining = self.config.duration.saturating_sub(elapsed);
            (elapsed, remaining)
        })
    }

    /// Finalize a baseline, persist it to C1, and remove the accumulator
    /// (spec §4.5). Callable early by `/finalize_onboarding`; the Supervisor
    /// monitor tick calls it once the window has elapsed.
    pub async fn finalize(&self, device_id: &str) -> Result<BehavioralBaseline> {
        let (_, acc) = self
            .accumulators
            .remove(device_id)
            .ok_or_else(|| Error::NotFound(format!("active profiling for {device_id}")))?;

        let elapsed_secs = acc.started_at.elapsed().as_secs_f64().max(1.0);
        let limited_traffic = acc.packet_count < self.config.min_packets_for_confidence;

        let mean_pps = acc.packet_count as f64 / elapsed_secs;
        let mean_bps = (acc.byte_count * 8) as f64 / elapsed_secs;
        let mean_packet_size = if acc.packet_count > 0 {
            acc.byte_count as f64 / acc.packet_count as f64
        } else {
            0.0
        };

        let baseline = BehavioralBaseline {
            device_id: device_id.to_string(),
            mean_pps,
            mean_bps,
            mean_packet_size,
            unique_destinations: acc.destinations.len(),
            unique_ports: acc.ports.len(),
            top_destinations: top_k(&acc.destinations, self.config.top_k),
            top_ports: top_k(&acc.ports, self.config.top_k),
            protocol_histogram: acc.protocols,
            established_at: Utc::now(),
            limited_traffic,
        };

        self.identity.save_baseline(device_id, &baseline).await?;
        self.identity
            .save_policy(device_id, &crate::policy::generate_policy(&baseline))
            .await?;
        if limited_traffic {
            tracing::warn!(device_id, packets = acc.packet_count, "baseline finalized with limited traffic");
        } else {
            tracing::info!(device_id, packets = acc.packet_count, "baseline finalized");
        }

        Ok(baseline)
    }

    /// Device ids currently under active profiling whose window has elapsed;
    /// used by the Supervisor's W2 monitor tick (spec §4.5, §5).
    pub fn expired_devices(&self) -> Vec<DeviceId> {
        self.accumulators
            .iter()
            .filter(|entry| entry.started_at.elapsed() >= self.config.duration)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

fn top_k<K: Clone + Ord>(counts: &HashMap<K, u64>, k: usize) -> Vec<(K, u64)> {
    let mut entries: Vec<(K, u64)> = counts.iter().map(|(key, v)| (key.clone(), *v)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(k);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn profiler() -> BehavioralProfiler {
        let identity = Arc::new(IdentityStore::open_in_memory().await.unwrap());
        identity
            .add_device("DEV_1", "AA:BB:CC:00:00:01", None, None, "sensor", "", None)
            .await
            .unwrap();
        BehavioralProfiler::new(ProfilingConfig { duration: std::time::Duration::from_millis(20), ..Default::default() }, identity)
    }

    #[tokio::test]
    async fn record_is_ignored_without_begin() {
        let p = profiler().await;
        p.record("DEV_1", &PacketInfo { bytes: 100, destination: "10.0.0.1".into(), dest_port: 80, protocol: "tcp".into() });
        assert!(!p.is_profiling("DEV_1"));
    }

    #[tokio::test]
    async fn finalize_computes_rates_and_persists() {
        let p = profiler().await;
        p.begin("DEV_1");
        for _ in 0..10 {
            p.record("DEV_1", &PacketInfo { bytes: 100, destination: "10.0.0.1".into(), dest_port: 80, protocol: "tcp".into() });
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        assert!(p.is_expired("DEV_1"));

        let baseline = p.finalize("DEV_1").await.unwrap();
        assert!(!baseline.limited_traffic);
        assert!(baseline.mean_pps > 0.0);
        assert!(!p.is_profiling("DEV_1"));

        let persisted = p.identity.get_baseline("DEV_1").await.unwrap().unwrap();
        assert_eq!(persisted.top_destinations, baseline.top_destinations);

        let policy = p.identity.get_policy("DEV_1").await.unwrap().unwrap();
        assert_eq!(policy.rate_limit_pps, baseline.mean_pps * 1.5);
    }

    #[tokio::test]
    async fn finalize_annotates_limited_traffic_on_silence() {
        let p = profiler().await;
        p.begin("DEV_1");
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        let baseline = p.finalize("DEV_1").await.unwrap();
        assert!(baseline.limited_traffic);
    }
}
